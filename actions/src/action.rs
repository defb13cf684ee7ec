use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of an executable action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Operating-system command.
    ShellCommand,
    /// Query against an external data system.
    Query,
    /// Call to an external API.
    ApiCall,
    /// Mutation of the spatial/vector index.
    IndexOperation,
}

impl ActionType {
    /// Stable label for logs and events.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ShellCommand => "shell_command",
            Self::Query => "query",
            Self::ApiCall => "api_call",
            Self::IndexOperation => "index_operation",
        }
    }

    /// Whether the category is gated by a tenant policy switch.
    #[must_use]
    pub const fn is_restricted(self) -> bool {
        matches!(self, Self::ShellCommand | Self::Query)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A concrete, executable operation proposed by the Orient phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Category.
    pub action_type: ActionType,
    /// Payload; a command/query string for restricted categories, structured
    /// JSON for the rest.
    pub payload: serde_json::Value,
    /// Estimated cost charged against the cycle budget.
    pub estimated_cost: f64,
    /// Whether execution requires an external approval signal.
    pub requires_approval: bool,
    /// Inverse operation captured at proposal time. Exposed through the
    /// explicit rollback operation; never consumed automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_payload: Option<serde_json::Value>,
}

impl Action {
    /// Creates an action with no approval requirement or rollback payload.
    #[must_use]
    pub fn new(action_type: ActionType, payload: serde_json::Value, estimated_cost: f64) -> Self {
        Self {
            action_type,
            payload,
            estimated_cost,
            requires_approval: false,
            rollback_payload: None,
        }
    }

    /// Marks the action as requiring approval.
    #[must_use]
    pub const fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Attaches a rollback payload.
    #[must_use]
    pub fn with_rollback(mut self, rollback: serde_json::Value) -> Self {
        self.rollback_payload = Some(rollback);
        self
    }

    /// The command string for whitelist matching, when the payload is one.
    #[must_use]
    pub fn command_line(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Modeled outcome classification recorded in the improvement ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// The cycle or action completed as intended.
    Success,
    /// A budget ceiling was breached at phase entry.
    BudgetExceeded,
    /// The tenant policy disables the action's category.
    CategoryDisabled,
    /// The command matched no whitelist pattern.
    CommandNotWhitelisted,
    /// The approval gate lapsed without a signal.
    ApprovalTimeout,
    /// The approval gate was explicitly denied.
    ApprovalDenied,
    /// The action ran and failed.
    ExecutionFailed,
    /// A single phase exceeded its message deadline.
    PhaseDeadlineExceeded,
    /// The conversation expired before the cycle finished.
    ConversationExpired,
    /// Observe found nothing to improve.
    NoObservation,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::BudgetExceeded => "budget_exceeded",
            Self::CategoryDisabled => "category_disabled",
            Self::CommandNotWhitelisted => "command_not_whitelisted",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalDenied => "approval_denied",
            Self::ExecutionFailed => "execution_failed",
            Self::PhaseDeadlineExceeded => "phase_deadline_exceeded",
            Self::ConversationExpired => "conversation_expired",
            Self::NoObservation => "no_observation",
        };
        f.write_str(label)
    }
}

/// Result of attempting an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the action succeeded.
    pub success: bool,
    /// Captured stdout/structured response.
    pub output: String,
    /// Error detail when unsuccessful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Outcome classification.
    pub reason_code: ReasonCode,
}

impl ExecutionResult {
    /// Successful result with the given output.
    #[must_use]
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_message: None,
            reason_code: ReasonCode::Success,
        }
    }

    /// Failed result with a reason code and detail.
    #[must_use]
    pub fn failure(reason_code: ReasonCode, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_message: Some(error_message.into()),
            reason_code,
        }
    }
}
