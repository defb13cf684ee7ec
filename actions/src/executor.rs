use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use kaizen_atoms::HybridSearchEngine;
use serde_json::json;
use shared_logging::{LogLevel, LogRecord, LogSink};
use thiserror::Error;
use tokio::process::Command;

use crate::action::{Action, ActionType, ExecutionResult, ReasonCode};
use crate::approval::ApprovalQueue;
use crate::policy::TenantSecurityPolicy;

/// Internal executor failures. Handler errors are folded into a failed
/// [`ExecutionResult`]; this type never reaches the ledger.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Spawning or awaiting a process failed.
    #[error("process error: {0}")]
    Process(#[from] std::io::Error),
    /// The action payload did not have the shape the handler expects.
    #[error("invalid action payload: {0}")]
    InvalidPayload(String),
    /// Catch-all for handler infrastructure.
    #[error("handler error: {0}")]
    Infrastructure(String),
}

/// Executes one category of action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs the action. Expected failures (non-zero exit, remote error) are
    /// reported as an unsuccessful result, not as `Err`.
    async fn run(&self, action: &Action) -> Result<ExecutionResult, ActionError>;
}

/// Runs shell commands through `sh -c`, capturing stdout/stderr/exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandHandler;

#[async_trait]
impl ActionHandler for ShellCommandHandler {
    async fn run(&self, action: &Action) -> Result<ExecutionResult, ActionError> {
        let command = action
            .command_line()
            .ok_or_else(|| ActionError::InvalidPayload("shell payload must be a string".into()))?;
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(ExecutionResult::success(stdout))
        } else {
            Ok(ExecutionResult {
                success: false,
                output: stdout,
                error_message: Some(format!("exit={:?} stderr={stderr}", output.status.code())),
                reason_code: ReasonCode::ExecutionFailed,
            })
        }
    }
}

/// Mutates the hybrid search engine's spatial index.
///
/// Payload shape: `{"op": "rebuild", "cell_size": 0.5}` or
/// `{"op": "remove", "atom_id": 7}`. The mutation is a short exclusive
/// write on the index only, never nested in a conversation transaction.
#[derive(Debug, Clone)]
pub struct IndexOperationHandler {
    engine: HybridSearchEngine,
}

impl IndexOperationHandler {
    /// Creates a handler over the given engine.
    #[must_use]
    pub const fn new(engine: HybridSearchEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ActionHandler for IndexOperationHandler {
    async fn run(&self, action: &Action) -> Result<ExecutionResult, ActionError> {
        let op = action
            .payload
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActionError::InvalidPayload("index payload needs an op".into()))?;
        match op {
            "rebuild" => {
                let cell_size = action
                    .payload
                    .get("cell_size")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(1.0);
                self.engine.rebuild(cell_size);
                Ok(ExecutionResult::success(format!(
                    "index rebuilt with cell_size={cell_size}, points={}",
                    self.engine.indexed_points()
                )))
            }
            "remove" => {
                let atom_id = action
                    .payload
                    .get("atom_id")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| {
                        ActionError::InvalidPayload("remove needs an atom_id".into())
                    })?;
                match self.engine.remove(atom_id) {
                    Ok(()) => Ok(ExecutionResult::success(format!("atom {atom_id} removed"))),
                    Err(error) => Ok(ExecutionResult::failure(
                        ReasonCode::ExecutionFailed,
                        error.to_string(),
                    )),
                }
            }
            other => Err(ActionError::InvalidPayload(format!(
                "unknown index op: {other}"
            ))),
        }
    }
}

/// Outcome of handing an action to the executor.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The gates resolved the action; the result is final.
    Completed(ExecutionResult),
    /// The action is parked behind the approval gate; the cycle suspends.
    PendingApproval,
}

/// Builder used to configure an [`ActionExecutor`].
pub struct ActionExecutorBuilder {
    handlers: IndexMap<ActionType, Arc<dyn ActionHandler>>,
    approvals: ApprovalQueue,
    approval_ttl: Duration,
    audit: Option<Arc<dyn LogSink>>,
}

impl Default for ActionExecutorBuilder {
    fn default() -> Self {
        let mut handlers: IndexMap<ActionType, Arc<dyn ActionHandler>> = IndexMap::new();
        handlers.insert(ActionType::ShellCommand, Arc::new(ShellCommandHandler));
        Self {
            handlers,
            approvals: ApprovalQueue::new(),
            approval_ttl: Duration::from_secs(24 * 60 * 60),
            audit: None,
        }
    }
}

impl ActionExecutorBuilder {
    /// Registers (or replaces) the handler for a category.
    #[must_use]
    pub fn handler(mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(action_type, handler);
        self
    }

    /// Shares an approval queue with the orchestrator.
    #[must_use]
    pub fn approvals(mut self, approvals: ApprovalQueue) -> Self {
        self.approvals = approvals;
        self
    }

    /// Overrides the approval gate time-to-live.
    #[must_use]
    pub const fn approval_ttl(mut self, ttl: Duration) -> Self {
        self.approval_ttl = ttl;
        self
    }

    /// Attaches an audit sink.
    #[must_use]
    pub fn audit(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Finalizes the builder.
    #[must_use]
    pub fn build(self) -> ActionExecutor {
        ActionExecutor {
            handlers: self.handlers,
            approvals: self.approvals,
            approval_ttl: self.approval_ttl,
            audit: self.audit,
        }
    }
}

/// Gated action executor.
///
/// Gate order is fixed: category switch, then whitelist, then approval, then
/// execution. The attempt is audited before the handler runs so a crash
/// mid-execution still leaves a trace.
pub struct ActionExecutor {
    handlers: IndexMap<ActionType, Arc<dyn ActionHandler>>,
    approvals: ApprovalQueue,
    approval_ttl: Duration,
    audit: Option<Arc<dyn LogSink>>,
}

impl ActionExecutor {
    /// Creates a builder with the default shell handler registered.
    #[must_use]
    pub fn builder() -> ActionExecutorBuilder {
        ActionExecutorBuilder::default()
    }

    /// The shared approval queue.
    #[must_use]
    pub fn approvals(&self) -> ApprovalQueue {
        self.approvals.clone()
    }

    /// Executes an action for a cycle under the tenant's policy.
    pub async fn execute(
        &self,
        cycle_id: &str,
        action: &Action,
        policy: &TenantSecurityPolicy,
    ) -> ExecutionOutcome {
        if let Some(rejection) = Self::gate(action, policy) {
            self.audit_record(
                policy,
                cycle_id,
                LogLevel::Warn,
                "actions.gate.rejected",
                json!({
                    "action_type": action.action_type.label(),
                    "reason": rejection.reason_code.to_string(),
                }),
            );
            return ExecutionOutcome::Completed(rejection);
        }

        if action.requires_approval {
            self.approvals
                .submit(cycle_id, action.clone(), self.approval_ttl);
            self.audit_record(
                policy,
                cycle_id,
                LogLevel::Info,
                "actions.approval.requested",
                json!({ "action_type": action.action_type.label() }),
            );
            return ExecutionOutcome::PendingApproval;
        }

        ExecutionOutcome::Completed(self.run(cycle_id, action, policy).await)
    }

    /// Executes a previously approved action: the category and whitelist
    /// gates are re-checked, the approval gate is not.
    pub async fn execute_approved(
        &self,
        cycle_id: &str,
        action: &Action,
        policy: &TenantSecurityPolicy,
    ) -> ExecutionResult {
        if let Some(rejection) = Self::gate(action, policy) {
            return rejection;
        }
        self.run(cycle_id, action, policy).await
    }

    fn gate(action: &Action, policy: &TenantSecurityPolicy) -> Option<ExecutionResult> {
        if action.action_type.is_restricted() && !policy.permits_category(action.action_type) {
            return Some(ExecutionResult::failure(
                ReasonCode::CategoryDisabled,
                format!("{} disabled by tenant policy", action.action_type),
            ));
        }
        if action.action_type.is_restricted() {
            let command = action.command_line().unwrap_or_default();
            if !policy.whitelist_matches(command) {
                return Some(ExecutionResult::failure(
                    ReasonCode::CommandNotWhitelisted,
                    format!("command matched no whitelist pattern: {command}"),
                ));
            }
        }
        None
    }

    async fn run(
        &self,
        cycle_id: &str,
        action: &Action,
        policy: &TenantSecurityPolicy,
    ) -> ExecutionResult {
        // Attempt is audited before execution so a crash mid-run is traceable.
        self.audit_record(
            policy,
            cycle_id,
            LogLevel::Info,
            "actions.execute.attempt",
            json!({
                "action_type": action.action_type.label(),
                "estimated_cost": action.estimated_cost,
            }),
        );

        let result = match self.handlers.get(&action.action_type) {
            Some(handler) => match handler.run(action).await {
                Ok(result) => result,
                Err(error) => {
                    ExecutionResult::failure(ReasonCode::ExecutionFailed, error.to_string())
                }
            },
            None => ExecutionResult::failure(
                ReasonCode::ExecutionFailed,
                format!("no handler registered for {}", action.action_type),
            ),
        };

        self.audit_record(
            policy,
            cycle_id,
            if result.success {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
            "actions.execute.result",
            json!({
                "action_type": action.action_type.label(),
                "success": result.success,
                "reason": result.reason_code.to_string(),
            }),
        );
        result
    }

    fn audit_record(
        &self,
        policy: &TenantSecurityPolicy,
        cycle_id: &str,
        level: LogLevel,
        message: &str,
        metadata: serde_json::Value,
    ) {
        if level < policy.audit_level.min_log_level() {
            return;
        }
        if let Some(sink) = &self.audit {
            let record = LogRecord::new("actions.executor", level, message)
                .with_cycle(cycle_id)
                .with_metadata(metadata);
            let _ = sink.log(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AuditLevel;
    use parking_lot::Mutex;
    use shared_logging::MemoryLogSink;

    /// Handler that records invocations; used to prove rejected actions
    /// produce zero side effects.
    #[derive(Default)]
    struct RecordingHandler {
        invocations: Arc<Mutex<Vec<Action>>>,
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        async fn run(&self, action: &Action) -> Result<ExecutionResult, ActionError> {
            self.invocations.lock().push(action.clone());
            Ok(ExecutionResult::success("recorded"))
        }
    }

    fn shell_policy(whitelist: &[&str]) -> TenantSecurityPolicy {
        TenantSecurityPolicy {
            allow_shell_commands: true,
            command_whitelist: whitelist.iter().map(|s| (*s).to_string()).collect(),
            ..TenantSecurityPolicy::default()
        }
    }

    #[tokio::test]
    async fn non_whitelisted_command_is_rejected_without_side_effects() {
        let handler = Arc::new(RecordingHandler::default());
        let invocations = Arc::clone(&handler.invocations);
        let executor = ActionExecutor::builder()
            .handler(ActionType::ShellCommand, handler)
            .build();

        let action = Action::new(ActionType::ShellCommand, json!("rm -rf /"), 1.0);
        let policy = shell_policy(&["^index_rebuild\\.sh$"]);
        let outcome = executor.execute("cycle-1", &action, &policy).await;

        match outcome {
            ExecutionOutcome::Completed(result) => {
                assert!(!result.success);
                assert_eq!(result.reason_code, ReasonCode::CommandNotWhitelisted);
            }
            ExecutionOutcome::PendingApproval => panic!("should not suspend"),
        }
        assert!(invocations.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_category_fails_closed() {
        let executor = ActionExecutor::builder().build();
        let action = Action::new(ActionType::ShellCommand, json!("echo hi"), 1.0);
        let outcome = executor
            .execute("cycle-1", &action, &TenantSecurityPolicy::default())
            .await;
        match outcome {
            ExecutionOutcome::Completed(result) => {
                assert_eq!(result.reason_code, ReasonCode::CategoryDisabled);
            }
            ExecutionOutcome::PendingApproval => panic!("should not suspend"),
        }
    }

    #[tokio::test]
    async fn approval_required_suspends_without_running() {
        let handler = Arc::new(RecordingHandler::default());
        let invocations = Arc::clone(&handler.invocations);
        let executor = ActionExecutor::builder()
            .handler(ActionType::ShellCommand, handler)
            .build();

        let action =
            Action::new(ActionType::ShellCommand, json!("index_rebuild.sh"), 1.0).with_approval();
        let policy = shell_policy(&["^index_rebuild\\.sh$"]);
        let outcome = executor.execute("cycle-1", &action, &policy).await;

        assert!(matches!(outcome, ExecutionOutcome::PendingApproval));
        assert!(invocations.lock().is_empty());
        let approved = executor.approvals().approve("cycle-1").expect("parked");
        let result = executor.execute_approved("cycle-1", &approved, &policy).await;
        assert!(result.success);
        assert_eq!(invocations.lock().len(), 1);
    }

    #[tokio::test]
    async fn shell_handler_captures_output() {
        let executor = ActionExecutor::builder().build();
        let action = Action::new(ActionType::ShellCommand, json!("echo kaizen"), 1.0);
        let policy = shell_policy(&["^echo "]);
        match executor.execute("cycle-1", &action, &policy).await {
            ExecutionOutcome::Completed(result) => {
                assert!(result.success);
                assert!(result.output.contains("kaizen"));
            }
            ExecutionOutcome::PendingApproval => panic!("should not suspend"),
        }
    }

    #[tokio::test]
    async fn shell_failure_is_captured_not_fatal() {
        let executor = ActionExecutor::builder().build();
        let action = Action::new(ActionType::ShellCommand, json!("exit 3"), 1.0);
        let policy = shell_policy(&["^exit "]);
        match executor.execute("cycle-1", &action, &policy).await {
            ExecutionOutcome::Completed(result) => {
                assert!(!result.success);
                assert_eq!(result.reason_code, ReasonCode::ExecutionFailed);
                assert!(result.error_message.unwrap().contains("exit=Some(3)"));
            }
            ExecutionOutcome::PendingApproval => panic!("should not suspend"),
        }
    }

    #[tokio::test]
    async fn index_handler_rebuilds_engine() {
        let engine = HybridSearchEngine::new(
            kaizen_atoms::AtomStore::new(4),
            kaizen_atoms::SearchConfig::default(),
        );
        engine
            .ingest("tenant", b"content", vec![0.1, 0.2, 0.3, 0.4])
            .unwrap();
        let executor = ActionExecutor::builder()
            .handler(
                ActionType::IndexOperation,
                Arc::new(IndexOperationHandler::new(engine.clone())),
            )
            .build();

        let action = Action::new(
            ActionType::IndexOperation,
            json!({"op": "rebuild", "cell_size": 0.5}),
            1.0,
        );
        match executor
            .execute("cycle-1", &action, &TenantSecurityPolicy::default())
            .await
        {
            ExecutionOutcome::Completed(result) => {
                assert!(result.success);
                assert!(result.output.contains("points=1"));
            }
            ExecutionOutcome::PendingApproval => panic!("should not suspend"),
        }
    }

    #[tokio::test]
    async fn audit_respects_tenant_level() {
        let sink = Arc::new(MemoryLogSink::new());
        let executor = ActionExecutor::builder()
            .audit(Arc::clone(&sink) as Arc<dyn LogSink>)
            .build();
        let mut policy = shell_policy(&["^echo "]);
        policy.audit_level = AuditLevel::Minimal;

        let action = Action::new(ActionType::ShellCommand, json!("echo quiet"), 1.0);
        let _ = executor.execute("cycle-1", &action, &policy).await;
        // Minimal audit drops the info-level attempt/result records.
        assert!(sink.records().is_empty());

        policy.audit_level = AuditLevel::Standard;
        let _ = executor.execute("cycle-1", &action, &policy).await;
        let records = sink.records();
        assert!(records
            .iter()
            .any(|r| r.message == "actions.execute.attempt"));
    }
}
