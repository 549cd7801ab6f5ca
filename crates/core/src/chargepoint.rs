//! Chargepoint identifiers and the registries they point into.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};

/// Third-party registries a chargepoint identifier can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Registry {
    GoingElectric = 0,
    OpenChargeMap = 1,
}

impl From<Registry> for u8 {
    fn from(registry: Registry) -> Self {
        registry as u8
    }
}

impl TryFrom<u8> for Registry {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::GoingElectric),
            1 => Ok(Self::OpenChargeMap),
            other => Err(format!("unknown registry code {other}")),
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoingElectric => write!(f, "GoingElectric"),
            Self::OpenChargeMap => write!(f, "OpenChargeMap"),
        }
    }
}

/// A parsed chargepoint identifier of the form `chargepoint-<registry>-<id>`,
/// e.g. `chargepoint-0-3358`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChargepointRef {
    pub registry: Registry,
    pub local_id: u64,
}

impl ChargepointRef {
    pub fn new(registry: Registry, local_id: u64) -> Self {
        Self { registry, local_id }
    }

    /// Parse a record identifier. Malformed identifiers and unknown registry
    /// codes are per-event errors, not a crash.
    pub fn parse(identifier: &str) -> Result<Self> {
        let malformed = || SyncError::MalformedChargepointRef(identifier.to_string());

        let rest = identifier.strip_prefix("chargepoint-").ok_or_else(malformed)?;
        let (registry_digits, id_digits) = rest.split_once('-').ok_or_else(malformed)?;
        if registry_digits.is_empty() || id_digits.is_empty() {
            return Err(malformed());
        }

        let registry_code: u8 = registry_digits.parse().map_err(|_| malformed())?;
        let local_id: u64 = id_digits.parse().map_err(|_| malformed())?;

        let registry = Registry::try_from(registry_code)
            .map_err(|_| SyncError::MalformedChargepointRef(identifier.to_string()))?;

        Ok(Self { registry, local_id })
    }

    /// The canonical record identifier, usable as a record identity in the
    /// target store.
    pub fn record_name(&self) -> String {
        format!("chargepoint-{}-{}", u8::from(self.registry), self.local_id)
    }
}

impl fmt::Display for ChargepointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_name())
    }
}
