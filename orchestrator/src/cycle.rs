use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use kaizen_actions::ExecutionResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{Hypothesis, Observation};
use crate::phase::CyclePhase;

/// Cost and duration ceilings for one cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CycleBudget {
    /// Maximum cumulative cost.
    pub max_cost: f64,
    /// Maximum wall-clock duration.
    pub max_duration: Duration,
}

impl Default for CycleBudget {
    fn default() -> Self {
        Self {
            max_cost: 100.0,
            max_duration: Duration::from_secs(60 * 60),
        }
    }
}

/// Run state of a cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// The cycle is progressing through its phases.
    Running,
    /// Terminal success.
    Completed,
    /// Terminal governed stop.
    Aborted,
}

/// One improvement pass. Mutated only by the phase orchestrator; the
/// conversation queue guarantees those mutations are serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementCycle {
    /// Cycle identifier; doubles as the conversation id.
    pub cycle_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Current phase.
    pub phase: CyclePhase,
    /// Budget ceilings.
    pub budget: CycleBudget,
    /// Cost consumed so far.
    pub cumulative_cost: f64,
    /// Cycle start.
    pub started_at: DateTime<Utc>,
    /// Run state.
    pub status: CycleStatus,
    /// Observations recorded by Observe.
    pub observations: Vec<Observation>,
    /// The observation carried into Orient.
    pub carried: Option<Observation>,
    /// The hypothesis drafted by Orient.
    pub hypothesis: Option<Hypothesis>,
    /// The Act phase result.
    pub execution: Option<ExecutionResult>,
    /// Whether the cycle is suspended behind the approval gate.
    pub awaiting_approval: bool,
    /// Whether Learn flagged the outcome as a rollback candidate.
    pub rollback_eligible: bool,
}

impl ImprovementCycle {
    /// Creates a fresh cycle in the Observing phase.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, budget: CycleBudget) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            phase: CyclePhase::Observing,
            budget,
            cumulative_cost: 0.0,
            started_at: Utc::now(),
            status: CycleStatus::Running,
            observations: Vec::new(),
            carried: None,
            hypothesis: None,
            execution: None,
            awaiting_approval: false,
            rollback_eligible: false,
        }
    }

    /// Advances the phase. Backwards transitions are a logic error and are
    /// ignored, keeping the state machine monotonic by construction.
    pub fn advance(&mut self, next: CyclePhase) {
        debug_assert!(
            next.rank() >= self.phase.rank(),
            "phase transition must be monotonic: {} -> {}",
            self.phase,
            next
        );
        if next.rank() >= self.phase.rank() {
            self.phase = next;
            match next {
                CyclePhase::Completed => self.status = CycleStatus::Completed,
                CyclePhase::Aborted => self.status = CycleStatus::Aborted,
                _ => {}
            }
        }
    }

    /// Elapsed wall-clock time since the cycle started.
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or_default()
    }
}

/// Shared registry of cycles, keyed by cycle id.
#[derive(Debug, Clone, Default)]
pub struct CycleRegistry {
    cycles: Arc<RwLock<IndexMap<Uuid, ImprovementCycle>>>,
}

impl CycleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a cycle.
    pub fn insert(&self, cycle: ImprovementCycle) {
        self.cycles.write().insert(cycle.cycle_id, cycle);
    }

    /// Fetches a cycle snapshot.
    #[must_use]
    pub fn get(&self, cycle_id: Uuid) -> Option<ImprovementCycle> {
        self.cycles.read().get(&cycle_id).cloned()
    }

    /// Mutates a cycle in place, returning whether it existed.
    pub fn update<F>(&self, cycle_id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut ImprovementCycle),
    {
        let mut cycles = self.cycles.write();
        cycles.get_mut(&cycle_id).map(mutate).is_some()
    }

    /// Snapshot of every cycle.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ImprovementCycle> {
        self.cycles.read().values().cloned().collect()
    }
}
