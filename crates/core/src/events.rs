//! Charge event model and wire parsing.
//!
//! The chargEV DB serves a heterogeneous event log: manually reported
//! check-ins and fault log entries scraped from the GoingElectric registry.
//! The wire payload carries a `__t` discriminant tag; we flatten the upstream
//! class hierarchy into one struct with a `kind` sum type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};
use crate::records::ReasonCode;

/// Originating system of a charge event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventSource {
    /// Authored natively in the PlugFinder record store.
    PlugFinder = 0,
    /// Synchronized from the GoingElectric fault log.
    GoingElectric = 1,
}

impl From<EventSource> for u8 {
    fn from(source: EventSource) -> Self {
        source as u8
    }
}

impl TryFrom<u8> for EventSource {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::PlugFinder),
            1 => Ok(Self::GoingElectric),
            other => Err(format!("unknown event source {other}")),
        }
    }
}

/// Event sources considered foreign to the PlugFinder store: records with one
/// of these sources were synchronized into the store by this connector rather
/// than authored by app users.
pub const UPSTREAM_SOURCES: &[EventSource] = &[EventSource::GoingElectric];

/// Subtype-specific payload of a charge event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeEventKind {
    /// A manually reported status.
    CheckIn {
        reason: ReasonCode,
        plug: Option<String>,
    },
    /// An automatically reported status from the registry's operational log.
    FaultLog {
        is_fault: bool,
        modified: DateTime<Utc>,
    },
}

impl ChargeEventKind {
    /// Wire tag name, used in error messages and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::CheckIn { .. } => "CheckIn",
            Self::FaultLog { .. } => "Ladelog",
        }
    }
}

/// One event from the chargEV DB log. Immutable once parsed; the core only
/// transforms events into new records, never mutates them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeEvent {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub upstream_updated_at: Option<DateTime<Utc>>,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub chargepoint: String,
    pub comment: String,
    pub nickname: Option<String>,
    pub user_id: Option<String>,
    pub kind: ChargeEventKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommonPayload {
    #[serde(alias = "_id")]
    id: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    upstream_updated_at: Option<DateTime<Utc>>,
    source: EventSource,
    timestamp: DateTime<Utc>,
    chargepoint: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default, rename = "userID")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckInPayload {
    reason: ReasonCode,
    #[serde(default)]
    plug: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaultLogPayload {
    is_fault: bool,
    modified: DateTime<Utc>,
}

/// Parse a raw event payload, dispatching on the `__t` discriminant tag.
///
/// Unknown tags fail with [`SyncError::UnknownEventType`]; they are never
/// silently dropped.
pub fn parse_event(payload: &serde_json::Value) -> Result<ChargeEvent> {
    let tag = payload
        .get("__t")
        .and_then(|value| value.as_str())
        .ok_or_else(|| SyncError::UnknownEventType("<missing tag>".to_string()))?;

    let kind = match tag {
        "Ladelog" => {
            let fault_log: FaultLogPayload = serde_json::from_value(payload.clone())?;
            ChargeEventKind::FaultLog {
                is_fault: fault_log.is_fault,
                modified: fault_log.modified,
            }
        }
        // CKCheckIn is a CheckIn the target store has already seen; the extra
        // record bookkeeping fields are irrelevant to the core.
        "CheckIn" | "CKCheckIn" => {
            let check_in: CheckInPayload = serde_json::from_value(payload.clone())?;
            ChargeEventKind::CheckIn {
                reason: check_in.reason,
                plug: check_in.plug,
            }
        }
        other => return Err(SyncError::UnknownEventType(other.to_string())),
    };

    let common: CommonPayload = serde_json::from_value(payload.clone())?;

    Ok(ChargeEvent {
        id: common.id,
        updated_at: common.updated_at,
        upstream_updated_at: common.upstream_updated_at,
        source: common.source,
        timestamp: common.timestamp,
        chargepoint: common.chargepoint,
        comment: common.comment,
        nickname: common.nickname,
        user_id: common.user_id,
        kind,
    })
}
