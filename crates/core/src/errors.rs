//! Error types shared across the sync workspace.

use thiserror::Error;

use crate::chargepoint::Registry;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing check-ins.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration. Aborts before any run.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Authentication against one of the stores failed.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The chargepoint belongs to a registry the connector cannot process.
    #[error("unsupported chargepoint registry: {0}")]
    UnsupportedRegistry(Registry),

    /// The chargepoint identifier does not match `chargepoint-<registry>-<id>`.
    #[error("chargepoint identifier {0:?} does not match the expected format")]
    MalformedChargepointRef(String),

    /// The event payload carried a discriminant tag we do not know.
    #[error("charge event of type {0:?} not implemented")]
    UnknownEventType(String),

    /// A known event type without a realized transformation.
    #[error("charge event of type {0:?} not implemented yet")]
    NotImplemented(&'static str),

    /// The chargepoint registry returned no usable metadata.
    #[error("metadata lookup failed: {0}")]
    MetadataLookup(String),

    /// A store request failed.
    #[error("store request failed{}: {message}", fmt_status(.status))]
    Store {
        status: Option<u16>,
        message: String,
    },

    /// A store rejected the request because it referenced too many records.
    /// Clients recover from this transparently by bisecting the request.
    #[error("store request exceeds the maximum request size")]
    RequestTooLarge,

    /// A record write was rejected because the concurrency token was stale.
    /// Implies a concurrent external edit; never retried blindly.
    #[error("record write conflict: {0}")]
    WriteConflict(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" ({code})"),
        None => String::new(),
    }
}

impl SyncError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a store error from an optional HTTP status and message.
    pub fn store(status: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self::Store {
            status: status.into(),
            message: message.into(),
        }
    }

    /// Create a metadata lookup failure.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::MetadataLookup(message.into())
    }

    /// True when the error must abort the whole run instead of skipping the
    /// current event. Per-event failures (parse, registry, metadata, plain
    /// store errors) are recovered by the orchestrator's batch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Auth(_) | Self::WriteConflict(_)
        )
    }
}
