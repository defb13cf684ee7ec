use regex::Regex;
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;
use tracing::warn;

use crate::action::ActionType;

/// How much of the executor's activity a tenant wants audited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Gate rejections and failures only.
    Minimal,
    /// Attempts and results.
    Standard,
    /// Everything, including gate passes.
    Verbose,
}

impl AuditLevel {
    /// Minimum log level audit records at this level are written with.
    #[must_use]
    pub const fn min_log_level(self) -> LogLevel {
        match self {
            Self::Minimal => LogLevel::Warn,
            Self::Standard => LogLevel::Info,
            Self::Verbose => LogLevel::Debug,
        }
    }
}

/// Per-tenant governance configuration.
///
/// Read-only input to the executor; the loop never mutates it. Passed
/// explicitly into every execute call so tests can inject fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSecurityPolicy {
    /// Whether shell commands may run at all.
    pub allow_shell_commands: bool,
    /// Whether unsafe queries may run at all.
    pub allow_unsafe_queries: bool,
    /// Regex patterns; a restricted command must match at least one.
    pub command_whitelist: Vec<String>,
    /// Audit verbosity.
    pub audit_level: AuditLevel,
}

impl Default for TenantSecurityPolicy {
    /// Locked-down default: no restricted categories, empty whitelist.
    fn default() -> Self {
        Self {
            allow_shell_commands: false,
            allow_unsafe_queries: false,
            command_whitelist: Vec::new(),
            audit_level: AuditLevel::Standard,
        }
    }
}

impl TenantSecurityPolicy {
    /// Whether the policy enables the action's category at all.
    #[must_use]
    pub const fn permits_category(&self, action_type: ActionType) -> bool {
        match action_type {
            ActionType::ShellCommand => self.allow_shell_commands,
            ActionType::Query => self.allow_unsafe_queries,
            ActionType::ApiCall | ActionType::IndexOperation => true,
        }
    }

    /// Whether the command matches at least one whitelist pattern.
    ///
    /// Invalid patterns are skipped (fail closed): a broken pattern can never
    /// widen what is allowed.
    #[must_use]
    pub fn whitelist_matches(&self, command: &str) -> bool {
        self.command_whitelist.iter().any(|pattern| {
            match Regex::new(pattern) {
                Ok(regex) => regex.is_match(command),
                Err(error) => {
                    warn!(%pattern, %error, "invalid whitelist pattern skipped");
                    false
                }
            }
        })
    }
}
