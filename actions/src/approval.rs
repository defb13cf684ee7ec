use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::action::Action;

/// An action parked behind the approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Suspended cycle.
    pub cycle_id: String,
    /// Action awaiting sign-off.
    pub action: Action,
    /// When the gate was opened.
    pub requested_at: DateTime<Utc>,
    /// When the gate lapses into a timeout-abort.
    pub expires_at: DateTime<Utc>,
}

/// Queue of actions suspended pending external approval.
///
/// One entry per cycle: a cycle suspends on at most one action at a time
/// because its message stream is strictly serialized.
#[derive(Debug, Clone, Default)]
pub struct ApprovalQueue {
    pending: Arc<Mutex<IndexMap<String, PendingApproval>>>,
}

impl ApprovalQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks an action for the given cycle with a time-to-live.
    pub fn submit(&self, cycle_id: impl Into<String>, action: Action, ttl: Duration) {
        let cycle_id = cycle_id.into();
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.pending.lock().insert(
            cycle_id.clone(),
            PendingApproval {
                cycle_id,
                action,
                requested_at: now,
                expires_at,
            },
        );
    }

    /// Approves the cycle's pending action, removing and returning it.
    #[must_use]
    pub fn approve(&self, cycle_id: &str) -> Option<Action> {
        self.pending
            .lock()
            .shift_remove(cycle_id)
            .map(|pending| pending.action)
    }

    /// Denies the cycle's pending action, removing and returning it.
    #[must_use]
    pub fn deny(&self, cycle_id: &str) -> Option<Action> {
        self.pending
            .lock()
            .shift_remove(cycle_id)
            .map(|pending| pending.action)
    }

    /// Removes and returns every gate whose TTL has lapsed.
    #[must_use]
    pub fn drain_expired(&self, now: DateTime<Utc>) -> Vec<PendingApproval> {
        let mut pending = self.pending.lock();
        let expired_ids: Vec<String> = pending
            .values()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.cycle_id.clone())
            .collect();
        expired_ids
            .iter()
            .filter_map(|id| pending.shift_remove(id))
            .collect()
    }

    /// The cycle's pending action, if any.
    #[must_use]
    pub fn get(&self, cycle_id: &str) -> Option<PendingApproval> {
        self.pending.lock().get(cycle_id).cloned()
    }

    /// Number of parked actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no actions are parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
