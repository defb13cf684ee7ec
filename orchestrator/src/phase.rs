use std::fmt;

use serde::{Deserialize, Serialize};

/// Message phase tag carried by every queue message of a cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Detect signals and pick the worst one.
    Observe,
    /// Draft a hypothesis and candidate action.
    Orient,
    /// Validate and execute the action.
    Act,
    /// Re-measure and record the outcome.
    Learn,
}

impl Phase {
    /// The queue message type for this phase.
    #[must_use]
    pub const fn message_type(self) -> &'static str {
        match self {
            Self::Observe => "phase.observe",
            Self::Orient => "phase.orient",
            Self::Act => "phase.act",
            Self::Learn => "phase.learn",
        }
    }

    /// Parses a message type tag. Unknown tags are malformed messages.
    #[must_use]
    pub fn from_message_type(tag: &str) -> Option<Self> {
        match tag {
            "phase.observe" => Some(Self::Observe),
            "phase.orient" => Some(Self::Orient),
            "phase.act" => Some(Self::Act),
            "phase.learn" => Some(Self::Learn),
            _ => None,
        }
    }

    /// The cycle state a message of this phase is processed in.
    #[must_use]
    pub const fn cycle_phase(self) -> CyclePhase {
        match self {
            Self::Observe => CyclePhase::Observing,
            Self::Orient => CyclePhase::Orienting,
            Self::Act => CyclePhase::Acting,
            Self::Learn => CyclePhase::Learning,
        }
    }

    /// The next phase in the cycle, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Observe => Some(Self::Orient),
            Self::Orient => Some(Self::Act),
            Self::Act => Some(Self::Learn),
            Self::Learn => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_type())
    }
}

/// State of an improvement cycle. Transitions are strictly monotonic along
/// `Observing → Orienting → Acting → Learning → {Completed, Aborted}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Observe phase in progress or pending.
    Observing,
    /// Orient phase in progress or pending.
    Orienting,
    /// Act phase in progress, possibly suspended on approval.
    Acting,
    /// Learn phase in progress or pending.
    Learning,
    /// Terminal: the cycle finished and was recorded.
    Completed,
    /// Terminal: the cycle was stopped by a governed outcome.
    Aborted,
}

impl CyclePhase {
    /// Monotonic rank used to reject backwards transitions.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Observing => 0,
            Self::Orienting => 1,
            Self::Acting => 2,
            Self::Learning => 3,
            Self::Completed | Self::Aborted => 4,
        }
    }

    /// Whether the phase is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Stable label for events and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Observing => "observing",
            Self::Orienting => "orienting",
            Self::Acting => "acting",
            Self::Learning => "learning",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
