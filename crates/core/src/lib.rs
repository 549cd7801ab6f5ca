//! Core synchronization engine for the chargEV check-in connector.
//!
//! This crate owns the domain model (events, records, reason codes), the
//! reconciliation rules, and the [`sync::SyncOrchestrator`] that drives a
//! run. It talks to the outside world only through the traits in
//! [`stores`]; the HTTP client crates implement them.

pub mod chargepoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod metadata;
pub mod paging;
pub mod reconcile;
pub mod records;
pub mod stores;
pub mod sync;
pub mod transform;

pub use chargepoint::{ChargepointRef, Registry};
pub use config::{ForeignSources, RunOptions};
pub use errors::{Result, SyncError};
pub use events::{parse_event, ChargeEvent, ChargeEventKind, EventSource, UPSTREAM_SOURCES};
pub use metadata::ChargePointMetadata;
pub use records::{ChargePointRecord, CheckInRecord, Location, ReasonCode, StoredCheckIn, UserRecord};
pub use stores::{MetadataRegistry, SourceStore, TargetStore};
pub use sync::{RunSummary, SyncOrchestrator};
