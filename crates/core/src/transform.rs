//! Shapes parsed charge events and registry metadata into target-store
//! records.

use chrono::{DateTime, Utc};

use crate::chargepoint::ChargepointRef;
use crate::errors::{Result, SyncError};
use crate::events::{ChargeEvent, ChargeEventKind, EventSource};
use crate::metadata::ChargePointMetadata;
use crate::records::{ChargePointRecord, CheckInRecord, Location, ReasonCode};

/// Build the check-in record for a charge event.
///
/// Only fault-log events have a realized mapping today; manual check-ins
/// fail with `NotImplemented` and are skipped per event.
pub fn check_in_from_event(
    event: &ChargeEvent,
    chargepoint: &ChargepointRef,
    metadata: &ChargePointMetadata,
) -> Result<CheckInRecord> {
    match &event.kind {
        ChargeEventKind::FaultLog { is_fault, modified } => Ok(check_in_from_fault_log(
            event,
            chargepoint,
            *is_fault,
            *modified,
            metadata,
        )),
        ChargeEventKind::CheckIn { .. } => Err(SyncError::NotImplemented("CheckIn")),
    }
}

/// Map a fault-log event onto the shared check-in shape.
///
/// The record timestamp is the fault log's own modification time (when the
/// registry observed the state), not the event's log timestamp. Comment text
/// arrives HTML-encoded and is decoded here.
pub fn check_in_from_fault_log(
    event: &ChargeEvent,
    chargepoint: &ChargepointRef,
    is_fault: bool,
    modified: DateTime<Utc>,
    metadata: &ChargePointMetadata,
) -> CheckInRecord {
    let comment = decode_entities(&event.comment);

    CheckInRecord {
        identity: format!("chargev-db-{}", event.id),
        chargepoint: chargepoint.clone(),
        location: Location {
            latitude: metadata.coordinates.lat,
            longitude: metadata.coordinates.lng,
        },
        reason: if is_fault {
            ReasonCode::EquipmentProblem
        } else {
            ReasonCode::Ok
        },
        comment: if comment.is_empty() { None } else { Some(comment) },
        plug: None,
        timestamp: modified,
        modified_at: event.updated_at,
        source: EventSource::GoingElectric,
    }
}

/// Build the chargepoint record upserted alongside an accepted check-in.
///
/// `final_reason` is the reconciliation engine's output, already escalated
/// where appropriate. The concurrency token starts out empty; the caller
/// carries the stored record's token forward before writing.
pub fn charge_point_record(
    metadata: &ChargePointMetadata,
    check_in: &CheckInRecord,
    final_reason: ReasonCode,
) -> ChargePointRecord {
    ChargePointRecord {
        identity: check_in.chargepoint.record_name(),
        metadata_hash: metadata.fingerprint.clone(),
        location: Location {
            latitude: metadata.coordinates.lat,
            longitude: metadata.coordinates.lng,
        },
        name: decode_entities(&metadata.name),
        reason: final_reason,
        reason_description: Some(describe_reason(final_reason)),
        timestamp: check_in.timestamp,
        url: absolute_url(&metadata.url),
        concurrency_token: None,
    }
}

/// Human-readable (non-localized) description for a reason code, with a
/// generic fallback for codes without a table entry.
pub fn describe_reason(reason: ReasonCode) -> String {
    let description = match reason.label() {
        "ok" => "available",
        "recovery" => "available again",
        "equipmentProblem" => "charging station out of order",
        "equipmentProblemNew" => "charging station reported out of order",
        "notCompatible" => "vehicle not compatible",
        "notCompatibleNew" => "vehicle reported not compatible",
        "noChargingEquipment" => "no charging equipment found",
        "noChargingEquipmentNew" => "charging equipment reported missing",
        _ => return format!("Reason code {}", reason.code()),
    };
    description.to_string()
}

/// The registry delivers scheme-relative URLs (`//example.com/...`).
fn absolute_url(url: &str) -> String {
    if url.starts_with("//") {
        format!("http:{url}")
    } else {
        url.to_string()
    }
}

fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}
