//! Run options for the sync orchestrator.

use crate::events::{EventSource, UPSTREAM_SOURCES};

/// Per-run switches, passed explicitly to the orchestrator. Nothing in the
/// core reads process-wide state.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replace every mutating store operation with a log line. Cursor
    /// computation and reconciliation still run, so the output is
    /// representative.
    pub dry_run: bool,
    /// Cap on the total number of items processed across all batches.
    pub limit: Option<usize>,
    /// Purge previously synchronized records and re-process from scratch
    /// instead of performing a delta sync.
    pub init: bool,
}

/// Which stored sources count as "synchronized from elsewhere" rather than
/// authored natively in the target store. Kept as an explicit parameter so
/// the self-exclusion filters are visible at the call sites.
#[derive(Debug, Clone)]
pub struct ForeignSources(pub Vec<EventSource>);

impl Default for ForeignSources {
    fn default() -> Self {
        Self(UPSTREAM_SOURCES.to_vec())
    }
}

impl ForeignSources {
    pub fn contains(&self, source: EventSource) -> bool {
        self.0.contains(&source)
    }

    pub fn as_slice(&self) -> &[EventSource] {
        &self.0
    }
}
