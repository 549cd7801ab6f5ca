//! Wire shapes of the record-store protocol and their mapping onto the core
//! record types.
//!
//! Records travel as `{recordName, recordType, recordChangeTag, fields}`
//! envelopes where every field value is wrapped in `{"value": ...}`.
//! Timestamps are epoch milliseconds, both in field values and in the
//! record-level created/modified stamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chargev_sync_core::{
    ChargePointRecord, CheckInRecord, EventSource, Location, ReasonCode, Result, StoredCheckIn,
    SyncError, UserRecord,
};

pub(crate) const CHECK_IN_TYPE: &str = "CheckIns";
pub(crate) const CHARGE_POINT_TYPE: &str = "ChargePoints";
pub(crate) const USER_TYPE: &str = "Users";

/// Record-level creation/modification stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireStamp {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_record_name: Option<String>,
}

impl WireStamp {
    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// One record envelope as sent and received over the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRecord {
    pub record_name: String,
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_change_tag: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<WireStamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<WireStamp>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Set on per-record failures in lookup responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_error_code: Option<String>,
}

impl WireRecord {
    pub fn new(record_name: impl Into<String>, record_type: &str) -> Self {
        Self {
            record_name: record_name.into(),
            record_type: record_type.to_string(),
            ..Self::default()
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), json!({ "value": value }));
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)?.get("value")
    }

    pub fn string_value(&self, name: &str) -> Option<String> {
        self.value(name)?.as_str().map(str::to_string)
    }

    pub fn u64_value(&self, name: &str) -> Option<u64> {
        self.value(name)?.as_u64()
    }

    /// A `{"recordName": ...}` reference field.
    pub fn reference(&self, name: &str) -> Option<String> {
        self.value(name)?
            .get("recordName")?
            .as_str()
            .map(str::to_string)
    }

    pub fn timestamp_value(&self, name: &str) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.value(name)?.as_i64()?)
    }
}

fn missing_field(record: &WireRecord, field: &str) -> SyncError {
    SyncError::store(
        None,
        format!("record {} lacks field {field:?}", record.record_name),
    )
}

/// Checked narrowing; an out-of-range wire value must not alias a valid code.
fn reason_field(record: &WireRecord) -> Result<ReasonCode> {
    let value = record
        .u64_value("reason")
        .ok_or_else(|| missing_field(record, "reason"))?;
    u16::try_from(value)
        .ok()
        .and_then(|code| ReasonCode::try_from(code).ok())
        .ok_or_else(|| {
            SyncError::store(
                None,
                format!("record {}: unknown reason code {value}", record.record_name),
            )
        })
}

/// Map a queried check-in record onto the core shape.
pub(crate) fn stored_check_in(record: &WireRecord) -> Result<StoredCheckIn> {
    let reason = reason_field(record)?;
    let timestamp = record
        .timestamp_value("timestamp")
        .ok_or_else(|| missing_field(record, "timestamp"))?;
    let source = match record.u64_value("source") {
        None => None,
        Some(value) => Some(
            u8::try_from(value)
                .ok()
                .and_then(|code| EventSource::try_from(code).ok())
                .ok_or_else(|| {
                    SyncError::store(
                        None,
                        format!(
                            "record {}: unknown event source {value}",
                            record.record_name
                        ),
                    )
                })?,
        ),
    };

    Ok(StoredCheckIn {
        identity: record.record_name.clone(),
        chargepoint: record
            .reference("chargepoint")
            .ok_or_else(|| missing_field(record, "chargepoint"))?,
        reason,
        comment: record.string_value("comment"),
        plug: record.string_value("plug"),
        timestamp,
        modified: record
            .modified
            .as_ref()
            .and_then(WireStamp::date_time)
            .unwrap_or(timestamp),
        source,
        deleted: record.deleted,
        user_record: record
            .created
            .as_ref()
            .and_then(|stamp| stamp.user_record_name.clone()),
    })
}

pub(crate) fn user_record(record: &WireRecord) -> UserRecord {
    UserRecord {
        identity: record.record_name.clone(),
        nickname: record.string_value("nickname"),
    }
}

pub(crate) fn check_in_record(check_in: &CheckInRecord) -> WireRecord {
    let mut record = WireRecord::new(&check_in.identity, CHECK_IN_TYPE);
    record.set(
        "chargepoint",
        json!({ "recordName": check_in.chargepoint.record_name() }),
    );
    record.set(
        "location",
        json!({
            "latitude": check_in.location.latitude,
            "longitude": check_in.location.longitude,
        }),
    );
    record.set("reason", json!(check_in.reason.code()));
    if let Some(comment) = &check_in.comment {
        record.set("comment", json!(comment));
    }
    if let Some(plug) = &check_in.plug {
        record.set("plug", json!(plug));
    }
    record.set("timestamp", json!(check_in.timestamp.timestamp_millis()));
    record.set(
        "sourceModified",
        json!(check_in.modified_at.timestamp_millis()),
    );
    record.set("source", json!(u8::from(check_in.source)));
    record
}

pub(crate) fn charge_point_record(charge_point: &ChargePointRecord) -> WireRecord {
    let mut record = WireRecord::new(&charge_point.identity, CHARGE_POINT_TYPE);
    record.record_change_tag = charge_point.concurrency_token.clone();
    record.set("metadataHash", json!(charge_point.metadata_hash));
    record.set(
        "location",
        json!({
            "latitude": charge_point.location.latitude,
            "longitude": charge_point.location.longitude,
        }),
    );
    record.set("name", json!(charge_point.name));
    record.set("reason", json!(charge_point.reason.code()));
    if let Some(description) = &charge_point.reason_description {
        record.set("reasonDescription", json!(description));
    }
    record.set("timestamp", json!(charge_point.timestamp.timestamp_millis()));
    record.set("url", json!(charge_point.url));
    record
}

pub(crate) fn charge_point_from_wire(record: &WireRecord) -> Result<ChargePointRecord> {
    let reason = reason_field(record)?;
    Ok(ChargePointRecord {
        identity: record.record_name.clone(),
        metadata_hash: record.string_value("metadataHash").unwrap_or_default(),
        location: record
            .value("location")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(Location {
                latitude: 0.0,
                longitude: 0.0,
            }),
        name: record.string_value("name").unwrap_or_default(),
        reason,
        reason_description: record.string_value("reasonDescription"),
        timestamp: record
            .timestamp_value("timestamp")
            .ok_or_else(|| missing_field(record, "timestamp"))?,
        url: record.string_value("url").unwrap_or_default(),
        concurrency_token: record.record_change_tag.clone(),
    })
}
