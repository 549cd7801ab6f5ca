//! Collaborator contracts the orchestrator depends on.
//!
//! The core never talks HTTP itself; the client crates implement these
//! traits, and the orchestrator tests swap in in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chargepoint::ChargepointRef;
use crate::errors::Result;
use crate::events::{ChargeEvent, EventSource};
use crate::metadata::ChargePointMetadata;
use crate::records::{ChargePointRecord, CheckInRecord, ReasonCode, StoredCheckIn, UserRecord};

/// One page of raw events from the source store. Payloads stay unparsed so
/// the orchestrator can recover from a bad event without losing the batch.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<serde_json::Value>,
    pub more_coming: bool,
    /// Start token for the next page; meaningful only while `more_coming`.
    pub next_start_token: Option<u64>,
}

/// One page of stored check-ins from the target store.
#[derive(Debug, Clone)]
pub struct CheckInPage {
    pub records: Vec<StoredCheckIn>,
    pub more_coming: bool,
    pub continuation: Option<String>,
}

/// A check-in posted back to the source store by the upload direction.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCheckIn {
    pub record_name: String,
    pub chargepoint: String,
    pub reason: ReasonCode,
    pub comment: Option<String>,
    pub plug: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub nickname: Option<String>,
    pub user_record: Option<String>,
}

/// Result of posting a batch of events to the source store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostOutcome {
    pub saved: usize,
    pub deleted: usize,
}

/// The upstream event log (chargEV DB).
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch one page of events. `change_token` scopes the delta; the start
    /// token resumes within it.
    async fn list_events(
        &self,
        change_token: Option<&str>,
        start_token: Option<u64>,
    ) -> Result<EventBatch>;

    /// The most recent event previously uploaded by this connector, used as
    /// the upload direction's delta watermark.
    async fn latest_event(&self) -> Result<Option<ChargeEvent>>;

    /// Save and delete uploaded check-ins in one call.
    async fn post_events(
        &self,
        to_save: Vec<UpstreamCheckIn>,
        to_delete: Vec<String>,
    ) -> Result<PostOutcome>;

    /// Purge everything this connector ever uploaded. Returns the number of
    /// deleted records.
    async fn delete_all(&self) -> Result<u64>;
}

/// The queryable record database (PlugFinder store).
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// The most recent stored check-in for a charge point, if any.
    async fn last_check_in(&self, chargepoint: &ChargepointRef) -> Result<Option<StoredCheckIn>>;

    /// The stored chargepoint record, if any. Its concurrency token must be
    /// carried into the next upsert.
    async fn charge_point(&self, chargepoint: &ChargepointRef)
        -> Result<Option<ChargePointRecord>>;

    /// Newest timestamp among stored check-ins whose source is in the
    /// foreign set. This is the download direction's resume position; the
    /// self-exclusion keeps the sync from treating its own writes as input.
    async fn latest_synced_timestamp(
        &self,
        foreign_sources: &[EventSource],
    ) -> Result<Option<DateTime<Utc>>>;

    /// Write the check-in and the chargepoint record as one atomic upsert
    /// batch. Fails with a write conflict when the chargepoint record's
    /// concurrency token is stale.
    async fn save_check_in(
        &self,
        check_in: CheckInRecord,
        charge_point: ChargePointRecord,
    ) -> Result<()>;

    /// Delete every check-in this connector synchronized from a foreign
    /// source. Returns the number of deleted records.
    async fn purge_synced_check_ins(&self, foreign_sources: &[EventSource]) -> Result<u64>;

    /// One page of check-ins modified after `since`, oldest first.
    async fn check_ins_page(
        &self,
        since: Option<DateTime<Utc>>,
        continuation: Option<&str>,
        limit: Option<usize>,
    ) -> Result<CheckInPage>;

    /// Batch-fetch user records for nickname joins. Implementations bisect
    /// internally when the store rejects the request as too large.
    async fn users_by_identity(&self, identities: &[String]) -> Result<Vec<UserRecord>>;
}

/// The third-party chargepoint metadata registry.
#[async_trait]
pub trait MetadataRegistry: Send + Sync {
    /// Fetch fresh metadata for the given registry-local identifiers. An
    /// empty or erroring result fails the single reconciliation attempt,
    /// never the run.
    async fn fetch_metadata(&self, ids: &[u64]) -> Result<Vec<ChargePointMetadata>>;
}
