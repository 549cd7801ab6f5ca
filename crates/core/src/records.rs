//! Reason codes and the target-store record shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chargepoint::ChargepointRef;
use crate::events::EventSource;

/// Geographic position of a charge point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Status reason attached to a check-in.
///
/// The enumeration is closed and numeric. Fault-family codes come in
/// base/escalated pairs where the escalated variant is base + 1; escalation
/// marks a fresh occurrence as opposed to a continuing one. `Ok`/`Recovery`
/// form the same kind of pair for the positive case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ReasonCode {
    Ok = 10,
    Recovery = 11,

    EquipmentProblem = 100,
    EquipmentProblemEscalated = 101,
    NotCompatible = 102,
    NotCompatibleEscalated = 103,
    NoChargingEquipment = 104,
    NoChargingEquipmentEscalated = 105,

    NotFound = 200,
    Duplicate = 201,
    Positive = 202,
    Negative = 203,
}

impl ReasonCode {
    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// True for the positive family (`Ok`, `Recovery`).
    pub fn is_ok_family(self) -> bool {
        matches!(self, Self::Ok | Self::Recovery)
    }

    /// True for any fault-family code, base or escalated.
    pub fn is_fault_family(self) -> bool {
        matches!(
            self,
            Self::EquipmentProblem
                | Self::EquipmentProblemEscalated
                | Self::NotCompatible
                | Self::NotCompatibleEscalated
                | Self::NoChargingEquipment
                | Self::NoChargingEquipmentEscalated
        )
    }

    /// True for the unescalated half of a base/escalated pair.
    pub fn is_base(self) -> bool {
        matches!(
            self,
            Self::Ok | Self::EquipmentProblem | Self::NotCompatible | Self::NoChargingEquipment
        )
    }

    /// The "+1" variant marking a fresh occurrence. Codes without an
    /// escalated counterpart are returned unchanged.
    pub fn escalated(self) -> Self {
        match self {
            Self::Ok => Self::Recovery,
            Self::EquipmentProblem => Self::EquipmentProblemEscalated,
            Self::NotCompatible => Self::NotCompatibleEscalated,
            Self::NoChargingEquipment => Self::NoChargingEquipmentEscalated,
            other => other,
        }
    }

    /// Stable identifier used to key the human-readable description table.
    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Recovery => "recovery",
            Self::EquipmentProblem => "equipmentProblem",
            Self::EquipmentProblemEscalated => "equipmentProblemNew",
            Self::NotCompatible => "notCompatible",
            Self::NotCompatibleEscalated => "notCompatibleNew",
            Self::NoChargingEquipment => "noChargingEquipment",
            Self::NoChargingEquipmentEscalated => "noChargingEquipmentNew",
            Self::NotFound => "notFound",
            Self::Duplicate => "duplicate",
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }
}

impl From<ReasonCode> for u16 {
    fn from(reason: ReasonCode) -> Self {
        reason.code()
    }
}

impl TryFrom<u16> for ReasonCode {
    type Error = String;

    fn try_from(code: u16) -> std::result::Result<Self, Self::Error> {
        let reason = match code {
            10 => Self::Ok,
            11 => Self::Recovery,
            100 => Self::EquipmentProblem,
            101 => Self::EquipmentProblemEscalated,
            102 => Self::NotCompatible,
            103 => Self::NotCompatibleEscalated,
            104 => Self::NoChargingEquipment,
            105 => Self::NoChargingEquipmentEscalated,
            200 => Self::NotFound,
            201 => Self::Duplicate,
            202 => Self::Positive,
            203 => Self::Negative,
            other => return Err(format!("unknown reason code {other}")),
        };
        Ok(reason)
    }
}

/// A check-in record as written to the target store. Created once per
/// accepted event and never mutated afterwards; corrections arrive as new
/// records.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInRecord {
    pub identity: String,
    pub chargepoint: ChargepointRef,
    pub location: Location,
    pub reason: ReasonCode,
    pub comment: Option<String>,
    pub plug: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub source: EventSource,
}

/// The denormalized per-chargepoint record upserted alongside each accepted
/// check-in. Keyed by the chargepoint record name; the concurrency token of
/// the stored record must be carried forward or the write fails.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargePointRecord {
    pub identity: String,
    pub metadata_hash: String,
    pub location: Location,
    pub name: String,
    pub reason: ReasonCode,
    pub reason_description: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub concurrency_token: Option<String>,
}

/// The target store's view of a persisted check-in, as returned by queries.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckIn {
    pub identity: String,
    pub chargepoint: String,
    pub reason: ReasonCode,
    pub comment: Option<String>,
    pub plug: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Absent on records predating the source field.
    pub source: Option<EventSource>,
    pub deleted: bool,
    /// Record-store identity of the authoring user, when known.
    pub user_record: Option<String>,
}

/// A user record from the target store, fetched for nickname joins.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub identity: String,
    pub nickname: Option<String>,
}
