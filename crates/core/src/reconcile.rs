//! Reconciliation engine: decides whether an incoming check-in is applied
//! and which reason code the chargepoint record ends up with.

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::events::EventSource;
use crate::records::{ReasonCode, StoredCheckIn};

/// Incoming events older than this are recorded with the base reason code
/// even when a transition occurred; only recent reports count as a fresh
/// occurrence.
pub const ESCALATION_WINDOW_DAYS: i64 = 3;

/// Outcome of reconciling one incoming check-in against the most recent
/// stored record for the same charge point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Insert the check-in; the chargepoint record takes this reason code.
    Accept(ReasonCode),
    /// The stored record is at least as new as the incoming event.
    Stale,
    /// Both the stored record and the incoming fault-log event are positive;
    /// a second consecutive positive would be redundant.
    RedundantPositive,
}

/// One incoming check-in, reduced to the fields reconciliation looks at.
#[derive(Debug, Clone, Copy)]
pub struct Incoming {
    pub reason: ReasonCode,
    pub timestamp: DateTime<Utc>,
    /// True when the event came from the registry's fault log rather than a
    /// manual report. Duplicate-positive suppression only applies here.
    pub from_fault_log: bool,
}

/// Apply the reconciliation rules in order: idempotency guard,
/// duplicate-positive suppression, escalation.
pub fn decide(previous: Option<&StoredCheckIn>, incoming: Incoming, now: DateTime<Utc>) -> Decision {
    if let Some(last) = previous {
        if last.timestamp >= incoming.timestamp {
            return Decision::Stale;
        }

        // Suppression is deliberately narrow: only an automatic positive
        // following another automatic positive. A manual positive does not
        // suppress a subsequent fault-log one.
        if incoming.from_fault_log
            && last.source == Some(EventSource::GoingElectric)
            && last.reason.is_ok_family()
            && incoming.reason.is_ok_family()
        {
            return Decision::RedundantPositive;
        }
    }

    Decision::Accept(escalated_reason(
        previous.map(|last| last.reason),
        incoming.reason,
        incoming.timestamp,
        now,
    ))
}

/// Escalate to the "+1" variant when the incoming event marks a fresh
/// occurrence:
///
/// a) there is no stored record and the incoming reason is a fault-family
///    base code, or
/// b) a stored record exists and its reason differs from the incoming one
///    (a transition, which also covers the fault -> ok recovery bump),
///
/// and in both cases the event is within the recency window. Anything older,
/// or a repeat of the same reason, keeps the base code.
pub fn escalated_reason(
    previous: Option<ReasonCode>,
    incoming: ReasonCode,
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ReasonCode {
    let fresh_occurrence = match previous {
        None => incoming.is_fault_family() && incoming.is_base(),
        Some(last) => last != incoming,
    };

    if !fresh_occurrence {
        return incoming;
    }

    if timestamp < now - Duration::days(ESCALATION_WINDOW_DAYS) {
        debug!(
            "transition to {:?} at {} is outside the {}-day window, keeping base code",
            incoming, timestamp, ESCALATION_WINDOW_DAYS
        );
        return incoming;
    }

    incoming.escalated()
}
