//! Chargepoint metadata as delivered by a third-party registry.

use serde::{Deserialize, Serialize};

/// Registry coordinates, in the registry's own field order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// An open fault report attached to the registry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Seconds since the epoch.
    pub created: i64,
    pub description: String,
}

/// A live registry snapshot for one charge point.
///
/// Fetched fresh per event, never cached across events. The fingerprint is a
/// content hash of the raw registry payload; it exists purely so downstream
/// consumers can detect metadata changes and plays no part in reconciliation
/// decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargePointMetadata {
    /// The registry's own identifier (`ge_id` for GoingElectric).
    pub external_id: u64,
    pub name: String,
    pub coordinates: Coordinates,
    /// May be scheme-relative (`//example.com/...`) as delivered.
    pub url: String,
    pub operator: Option<String>,
    pub network: Option<String>,
    pub fault_report: Option<FaultReport>,
    /// md5 hex digest of the canonical raw payload.
    pub fingerprint: String,
}
