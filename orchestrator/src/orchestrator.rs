use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use kaizen_actions::{
    Action, ActionExecutor, ExecutionOutcome, ExecutionResult, ReasonCode, TenantSecurityPolicy,
};
use kaizen_atoms::{DistanceMetric, HybridSearchEngine};
use kaizen_queue::{ConversationQueue, Delivery, OutgoingMessage, QueueError};
use serde_json::json;
use shared_event_bus::{EventOutcome, EventPublisher, ProvenanceEvent};
use shared_logging::{LogLevel, LogRecord, LogSink};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::analysis::{draft_hypothesis, select_observation, Observation};
use crate::cycle::{CycleBudget, CycleRegistry, ImprovementCycle};
use crate::guard::BudgetGuard;
use crate::ledger::{ImprovementLedger, ImprovementLedgerEntry};
use crate::metrics::MetricSource;
use crate::phase::{CyclePhase, Phase};

/// Errors surfaced by the orchestration API.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The underlying queue refused an operation.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The cycle does not exist.
    #[error("unknown cycle: {0}")]
    UnknownCycle(Uuid),
    /// The cycle has no action parked behind the approval gate.
    #[error("no pending approval for cycle {0}")]
    NoPendingApproval(Uuid),
    /// The cycle's action captured no rollback payload.
    #[error("no rollback payload for cycle {0}")]
    NoRollback(Uuid),
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Bounded wait per receive call.
    pub receive_wait: Duration,
    /// Deadline attached to every phase message.
    pub phase_deadline: Duration,
    /// Relative metric worsening tolerated before an outcome is flagged
    /// rollback-eligible (0.05 = 5%).
    pub regression_threshold: f64,
    /// Severity at or above which a proposed action requires approval.
    pub approval_severity: u8,
    /// Initial radius for similarity searches.
    pub search_radius: f64,
    /// Result count requested from similarity searches.
    pub search_k: usize,
    /// Distance metric for similarity searches.
    pub search_metric: DistanceMetric,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            receive_wait: Duration::from_secs(5),
            phase_deadline: Duration::from_secs(60 * 60),
            regression_threshold: 0.05,
            approval_severity: 95,
            search_radius: 1.0,
            search_k: 5,
            search_metric: DistanceMetric::Cosine,
        }
    }
}

/// Builder used to configure a [`PhaseOrchestrator`].
pub struct PhaseOrchestratorBuilder {
    queue: Arc<dyn ConversationQueue>,
    engine: HybridSearchEngine,
    executor: Arc<ActionExecutor>,
    metrics: Arc<dyn MetricSource>,
    ledger: ImprovementLedger,
    policies: IndexMap<String, TenantSecurityPolicy>,
    events: Option<Arc<dyn EventPublisher>>,
    logger: Option<Arc<dyn LogSink>>,
    config: LoopConfig,
}

impl PhaseOrchestratorBuilder {
    /// Starts a builder from the required collaborators.
    #[must_use]
    pub fn new(
        queue: Arc<dyn ConversationQueue>,
        engine: HybridSearchEngine,
        executor: Arc<ActionExecutor>,
        metrics: Arc<dyn MetricSource>,
    ) -> Self {
        Self {
            queue,
            engine,
            executor,
            metrics,
            ledger: ImprovementLedger::new(),
            policies: IndexMap::new(),
            events: None,
            logger: None,
            config: LoopConfig::default(),
        }
    }

    /// Overrides the ledger (e.g. to attach a JSONL mirror).
    #[must_use]
    pub fn ledger(mut self, ledger: ImprovementLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Registers a tenant's security policy. Unregistered tenants get the
    /// locked-down default.
    #[must_use]
    pub fn policy(mut self, tenant_id: impl Into<String>, policy: TenantSecurityPolicy) -> Self {
        self.policies.insert(tenant_id.into(), policy);
        self
    }

    /// Attaches a provenance event publisher.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attaches a log sink.
    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn LogSink>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Overrides the configuration.
    #[must_use]
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Finalizes the builder.
    #[must_use]
    pub fn build(self) -> PhaseOrchestrator {
        PhaseOrchestrator {
            queue: self.queue,
            engine: self.engine,
            executor: self.executor,
            metrics: self.metrics,
            ledger: self.ledger,
            registry: CycleRegistry::new(),
            policies: self.policies,
            events: self.events,
            logger: self.logger,
            config: self.config,
        }
    }
}

/// The Observe-Orient-Act-Learn state machine.
///
/// Each phase is driven by exactly one queue message; processing it and
/// sending the next phase's message happen in one delivery commit, so the
/// cycle can never record a phase without triggering the next one. The
/// budget guard runs at every phase entry before any side effect.
pub struct PhaseOrchestrator {
    queue: Arc<dyn ConversationQueue>,
    engine: HybridSearchEngine,
    executor: Arc<ActionExecutor>,
    metrics: Arc<dyn MetricSource>,
    ledger: ImprovementLedger,
    registry: CycleRegistry,
    policies: IndexMap<String, TenantSecurityPolicy>,
    events: Option<Arc<dyn EventPublisher>>,
    logger: Option<Arc<dyn LogSink>>,
    config: LoopConfig,
}

impl PhaseOrchestrator {
    /// The conversation queue the orchestrator consumes.
    #[must_use]
    pub fn queue(&self) -> Arc<dyn ConversationQueue> {
        Arc::clone(&self.queue)
    }

    /// The improvement ledger.
    #[must_use]
    pub fn ledger(&self) -> ImprovementLedger {
        self.ledger.clone()
    }

    /// The cycle registry (read access for operators and tests).
    #[must_use]
    pub fn registry(&self) -> CycleRegistry {
        self.registry.clone()
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Begins a new improvement cycle and enqueues its Observe message.
    pub async fn begin_cycle(
        &self,
        tenant_id: impl Into<String>,
        budget: CycleBudget,
    ) -> Result<Uuid, LoopError> {
        let cycle = ImprovementCycle::new(tenant_id, budget);
        let cycle_id = cycle.cycle_id;
        self.registry.insert(cycle);
        self.queue
            .send(self.phase_message(cycle_id, Phase::Observe, json!({})))
            .await?;
        self.emit(
            cycle_id,
            CyclePhase::Observing,
            "cycle.started",
            EventOutcome::Success,
            json!({}),
        )
        .await;
        Ok(cycle_id)
    }

    /// Signals approval for the cycle's parked action. The cycle resumes via
    /// its own conversation so processing stays serialized.
    pub async fn approve_action(&self, cycle_id: Uuid) -> Result<(), LoopError> {
        let cycle = self
            .registry
            .get(cycle_id)
            .ok_or(LoopError::UnknownCycle(cycle_id))?;
        if !cycle.awaiting_approval {
            return Err(LoopError::NoPendingApproval(cycle_id));
        }
        self.queue
            .send(self.phase_message(cycle_id, Phase::Act, json!({"approval": "granted"})))
            .await?;
        Ok(())
    }

    /// Denies the cycle's parked action, aborting the cycle.
    pub async fn deny_action(&self, cycle_id: Uuid) -> Result<(), LoopError> {
        let cycle = self
            .registry
            .get(cycle_id)
            .ok_or(LoopError::UnknownCycle(cycle_id))?;
        if !cycle.awaiting_approval {
            return Err(LoopError::NoPendingApproval(cycle_id));
        }
        self.queue
            .send(self.phase_message(cycle_id, Phase::Act, json!({"approval": "denied"})))
            .await?;
        Ok(())
    }

    /// Executes the rollback payload captured for the cycle's action.
    ///
    /// Explicitly operator-invoked; nothing in the loop calls this
    /// automatically.
    pub async fn rollback(&self, cycle_id: Uuid) -> Result<ExecutionResult, LoopError> {
        let cycle = self
            .registry
            .get(cycle_id)
            .ok_or(LoopError::UnknownCycle(cycle_id))?;
        let action = cycle
            .hypothesis
            .as_ref()
            .map(|h| &h.proposed_action)
            .ok_or(LoopError::NoRollback(cycle_id))?;
        let rollback_payload = action
            .rollback_payload
            .clone()
            .ok_or(LoopError::NoRollback(cycle_id))?;

        let rollback_action = Action::new(action.action_type, rollback_payload, 0.0);
        let policy = self.policy_for(&cycle.tenant_id);
        let result = self
            .executor
            .execute_approved(&cycle_id.to_string(), &rollback_action, &policy)
            .await;
        self.emit(
            cycle_id,
            cycle.phase,
            "cycle.rollback",
            if result.success {
                EventOutcome::Success
            } else {
                EventOutcome::Failure
            },
            json!({ "reason": result.reason_code.to_string() }),
        )
        .await;
        Ok(result)
    }

    /// Periodic maintenance run by workers between receives: lapsed approval
    /// gates become timeout-aborts, expired conversations abort their cycles.
    pub async fn housekeeping(&self) {
        for lapsed in self.executor.approvals().drain_expired(Utc::now()) {
            if let Ok(cycle_id) = Uuid::parse_str(&lapsed.cycle_id) {
                let sent = self
                    .queue
                    .send(self.phase_message(cycle_id, Phase::Act, json!({"approval": "timeout"})))
                    .await;
                if sent.is_err() {
                    // Conversation already gone; settle the cycle directly.
                    self.abort_cycle(cycle_id, ReasonCode::ApprovalTimeout).await;
                }
            }
        }
        for conversation_id in self.queue.drain_expired() {
            if let Ok(cycle_id) = Uuid::parse_str(&conversation_id) {
                let Some(cycle) = self.registry.get(cycle_id) else {
                    continue;
                };
                if cycle.phase.is_terminal() {
                    continue;
                }
                // Expiry while suspended on approval is a timeout-abort; the
                // parked action is released, never executed.
                let reason = if cycle.awaiting_approval {
                    let _ = self.executor.approvals().deny(&conversation_id);
                    ReasonCode::ApprovalTimeout
                } else {
                    ReasonCode::ConversationExpired
                };
                self.abort_cycle(cycle_id, reason).await;
            }
        }
    }

    /// Processes one delivery: parse, guard, run the phase, commit the
    /// follow-up message in the same transaction.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<(), LoopError> {
        let message = delivery.message().clone();

        let Some(phase) = Phase::from_message_type(&message.message_type) else {
            delivery.reject(format!("unknown message type: {}", message.message_type));
            return Ok(());
        };
        let Ok(cycle_id) = Uuid::parse_str(&message.conversation_id) else {
            delivery.reject(format!(
                "conversation id is not a cycle id: {}",
                message.conversation_id
            ));
            return Ok(());
        };
        let Some(cycle) = self.registry.get(cycle_id) else {
            delivery.reject(format!("unknown cycle: {cycle_id}"));
            return Ok(());
        };
        if cycle.phase.is_terminal() {
            // Redelivery after a terminal transition; acknowledge and move on.
            delivery.commit(Vec::new())?;
            return Ok(());
        }

        let now = Utc::now();
        if message.is_expired(now) {
            self.abort_cycle(cycle_id, ReasonCode::PhaseDeadlineExceeded)
                .await;
            delivery.commit(Vec::new())?;
            return Ok(());
        }

        // Budget guard precedes every phase side effect.
        if let Some(reason) = BudgetGuard::check(&cycle, now) {
            self.abort_cycle(cycle_id, reason).await;
            delivery.commit(Vec::new())?;
            return Ok(());
        }

        let outcome = match phase {
            Phase::Observe => self.run_observe(&cycle).await,
            Phase::Orient => self.run_orient(&cycle).await,
            Phase::Act => self.run_act(&cycle, &message.payload).await,
            Phase::Learn => self.run_learn(&cycle).await,
        };

        match outcome {
            Ok(follow_ups) => delivery.commit(follow_ups)?,
            Err(error) => {
                // Transient collaborator failure: back off and retry; the
                // queue dead-letters at the ceiling.
                warn!(%cycle_id, %phase, %error, "phase processing failed; retrying");
                self.log(
                    cycle_id,
                    LogLevel::Warn,
                    "loop.phase.retry",
                    json!({ "phase": phase.to_string(), "error": error.to_string() }),
                );
                delivery.retry();
            }
        }
        Ok(())
    }

    async fn run_observe(&self, cycle: &ImprovementCycle) -> anyhow::Result<Vec<OutgoingMessage>> {
        let observations = self.metrics.observe(&cycle.tenant_id).await?;

        // Context for the carried pick: how many similar past signals exist.
        let similar = select_observation(&observations)
            .map(|carried| self.similar_signals(&carried).len())
            .unwrap_or_default();

        let Some(carried) = select_observation(&observations) else {
            self.registry.update(cycle.cycle_id, |cycle| {
                cycle.advance(CyclePhase::Completed);
            });
            self.ledger.append(ImprovementLedgerEntry::new(
                cycle.cycle_id,
                true,
                ReasonCode::NoObservation,
            ));
            self.emit(
                cycle.cycle_id,
                CyclePhase::Completed,
                "phase.observe.completed",
                EventOutcome::Success,
                json!({ "observations": 0 }),
            )
            .await;
            self.queue
                .close_conversation(&cycle.cycle_id.to_string())
                .await;
            return Ok(Vec::new());
        };

        let analysis_id = carried.analysis_id;
        self.registry.update(cycle.cycle_id, |cycle| {
            cycle.observations = observations;
            cycle.carried = Some(carried);
            cycle.advance(CyclePhase::Orienting);
        });
        self.emit(
            cycle.cycle_id,
            CyclePhase::Observing,
            "phase.observe.completed",
            EventOutcome::Success,
            json!({ "carried_analysis_id": analysis_id, "similar_signals": similar }),
        )
        .await;
        Ok(vec![self.phase_message(
            cycle.cycle_id,
            Phase::Orient,
            json!({}),
        )])
    }

    async fn run_orient(&self, cycle: &ImprovementCycle) -> anyhow::Result<Vec<OutgoingMessage>> {
        let carried = cycle
            .carried
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cycle has no carried observation"))?;

        let analogous = self.similar_signals(&carried);
        let hypothesis = draft_hypothesis(&carried, &analogous, self.config.approval_severity);
        let confidence = hypothesis.confidence;
        let action_type = hypothesis.proposed_action.action_type;

        self.registry.update(cycle.cycle_id, |cycle| {
            cycle.hypothesis = Some(hypothesis);
            cycle.advance(CyclePhase::Acting);
        });
        self.emit(
            cycle.cycle_id,
            CyclePhase::Orienting,
            "phase.orient.completed",
            EventOutcome::Success,
            json!({
                "action_type": action_type.label(),
                "confidence": confidence,
                "analogous_fixes": analogous.len(),
            }),
        )
        .await;
        Ok(vec![self.phase_message(
            cycle.cycle_id,
            Phase::Act,
            json!({}),
        )])
    }

    async fn run_act(
        &self,
        cycle: &ImprovementCycle,
        payload: &serde_json::Value,
    ) -> anyhow::Result<Vec<OutgoingMessage>> {
        let cycle_key = cycle.cycle_id.to_string();
        let policy = self.policy_for(&cycle.tenant_id);

        match payload.get("approval").and_then(|v| v.as_str()) {
            Some("granted") => {
                let Some(action) = self.executor.approvals().approve(&cycle_key) else {
                    return Err(anyhow::anyhow!("approval signal without parked action"));
                };
                let result = self
                    .executor
                    .execute_approved(&cycle_key, &action, &policy)
                    .await;
                Ok(self.finish_act(cycle.cycle_id, &action, result).await)
            }
            Some("denied") => {
                let _ = self.executor.approvals().deny(&cycle_key);
                self.abort_cycle(cycle.cycle_id, ReasonCode::ApprovalDenied)
                    .await;
                Ok(Vec::new())
            }
            Some("timeout") => {
                self.abort_cycle(cycle.cycle_id, ReasonCode::ApprovalTimeout)
                    .await;
                Ok(Vec::new())
            }
            _ => {
                let action = cycle
                    .hypothesis
                    .as_ref()
                    .map(|h| h.proposed_action.clone())
                    .ok_or_else(|| anyhow::anyhow!("cycle has no hypothesis"))?;
                match self.executor.execute(&cycle_key, &action, &policy).await {
                    ExecutionOutcome::PendingApproval => {
                        self.registry.update(cycle.cycle_id, |cycle| {
                            cycle.awaiting_approval = true;
                        });
                        self.emit(
                            cycle.cycle_id,
                            CyclePhase::Acting,
                            "action.approval_pending",
                            EventOutcome::Pending,
                            json!({ "action_type": action.action_type.label() }),
                        )
                        .await;
                        // No follow-up message: the cycle is suspended until
                        // an approval signal or the gate's TTL produces one.
                        Ok(Vec::new())
                    }
                    ExecutionOutcome::Completed(result) => {
                        Ok(self.finish_act(cycle.cycle_id, &action, result).await)
                    }
                }
            }
        }
    }

    /// Records an Act result and schedules Learn.
    async fn finish_act(
        &self,
        cycle_id: Uuid,
        action: &Action,
        result: ExecutionResult,
    ) -> Vec<OutgoingMessage> {
        let outcome = if result.success {
            EventOutcome::Success
        } else {
            EventOutcome::Failure
        };
        let reason = result.reason_code;
        self.registry.update(cycle_id, |cycle| {
            cycle.cumulative_cost += action.estimated_cost;
            cycle.execution = Some(result);
            cycle.awaiting_approval = false;
            cycle.advance(CyclePhase::Learning);
        });
        self.emit(
            cycle_id,
            CyclePhase::Acting,
            "action.executed",
            outcome,
            json!({
                "action_type": action.action_type.label(),
                "reason": reason.to_string(),
            }),
        )
        .await;
        vec![self.phase_message(cycle_id, Phase::Learn, json!({}))]
    }

    async fn run_learn(&self, cycle: &ImprovementCycle) -> anyhow::Result<Vec<OutgoingMessage>> {
        let carried = cycle
            .carried
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cycle has no carried observation"))?;
        let execution = cycle
            .execution
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cycle has no execution result"))?;

        let before = carried.metric_value;
        let after = self
            .metrics
            .measure(&cycle.tenant_id, &carried.metric_name)
            .await?;

        // Observed metrics are lower-is-better problem signals; a relative
        // increase past the threshold is a regression.
        let delta_fraction = if before.abs() > f64::EPSILON {
            (after - before) / before.abs()
        } else {
            0.0
        };
        let regressed = delta_fraction > self.config.regression_threshold;
        let has_rollback = cycle
            .hypothesis
            .as_ref()
            .is_some_and(|h| h.proposed_action.rollback_payload.is_some());
        let rollback_eligible = regressed && has_rollback;

        let reason = if execution.success {
            ReasonCode::Success
        } else {
            execution.reason_code
        };
        let mut entry = ImprovementLedgerEntry::new(cycle.cycle_id, execution.success, reason)
            .with_metrics(before, after);
        if rollback_eligible {
            entry = entry.rollback_eligible();
        }
        self.ledger.append(entry);

        self.registry.update(cycle.cycle_id, |cycle| {
            cycle.rollback_eligible = rollback_eligible;
            cycle.advance(CyclePhase::Completed);
        });
        self.emit(
            cycle.cycle_id,
            CyclePhase::Learning,
            "phase.learn.completed",
            if execution.success {
                EventOutcome::Success
            } else {
                EventOutcome::Failure
            },
            json!({
                "before": before,
                "after": after,
                "delta_fraction": delta_fraction,
                "rollback_eligible": rollback_eligible,
            }),
        )
        .await;
        self.queue
            .close_conversation(&cycle.cycle_id.to_string())
            .await;
        Ok(Vec::new())
    }

    /// Terminal governed stop: ledger entry, registry transition, event,
    /// conversation closed. Idempotent for already-terminal cycles.
    async fn abort_cycle(&self, cycle_id: Uuid, reason: ReasonCode) {
        let already_terminal = self
            .registry
            .get(cycle_id)
            .is_some_and(|cycle| cycle.phase.is_terminal());
        if already_terminal {
            return;
        }
        self.registry.update(cycle_id, |cycle| {
            cycle.advance(CyclePhase::Aborted);
        });
        self.ledger
            .append(ImprovementLedgerEntry::new(cycle_id, false, reason));
        self.log(
            cycle_id,
            LogLevel::Warn,
            "loop.cycle.aborted",
            json!({ "reason": reason.to_string() }),
        );
        self.emit(
            cycle_id,
            CyclePhase::Aborted,
            "cycle.aborted",
            EventOutcome::Failure,
            json!({ "reason": reason.to_string() }),
        )
        .await;
        self.queue.close_conversation(&cycle_id.to_string()).await;
    }

    fn similar_signals(&self, observation: &Observation) -> Vec<kaizen_atoms::SearchHit> {
        let vector = observation.signal_vector(self.engine.store().dimension());
        let query = self.engine.query_for(
            vector,
            self.config.search_radius,
            self.config.search_k,
            self.config.search_metric,
        );
        self.engine.search(&query).0
    }

    fn policy_for(&self, tenant_id: &str) -> TenantSecurityPolicy {
        self.policies
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    fn phase_message(
        &self,
        cycle_id: Uuid,
        phase: Phase,
        payload: serde_json::Value,
    ) -> OutgoingMessage {
        OutgoingMessage {
            conversation_id: cycle_id.to_string(),
            message_type: phase.message_type().to_string(),
            payload,
            deadline: Some(
                Utc::now()
                    + chrono::Duration::from_std(self.config.phase_deadline)
                        .unwrap_or_else(|_| chrono::Duration::hours(1)),
            ),
        }
    }

    async fn emit(
        &self,
        cycle_id: Uuid,
        phase: CyclePhase,
        event_type: &str,
        outcome: EventOutcome,
        payload: serde_json::Value,
    ) {
        if let Some(events) = &self.events {
            let event =
                ProvenanceEvent::new(cycle_id.to_string(), phase.label(), event_type, outcome)
                    .with_payload(payload);
            // The audit collaborator failing must never fail the loop.
            let _ = events.publish(event).await;
        }
    }

    fn log(&self, cycle_id: Uuid, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(logger) = &self.logger {
            let record = LogRecord::new("loop.orchestrator", level, message)
                .with_cycle(cycle_id.to_string())
                .with_metadata(metadata);
            let _ = logger.log(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ObservationKind;
    use crate::metrics::StaticMetricSource;
    use async_trait::async_trait;
    use kaizen_actions::{
        ActionError, ActionHandler, ActionType, AuditLevel, IndexOperationHandler,
    };
    use kaizen_atoms::{AtomStore, SearchConfig};
    use kaizen_queue::{MemoryConversationQueue, QueueConfig};
    use shared_event_bus::MemoryEventBus;

    /// Shell stand-in so tests never spawn real processes.
    struct StubShellHandler;

    #[async_trait]
    impl ActionHandler for StubShellHandler {
        async fn run(&self, _action: &Action) -> Result<ExecutionResult, ActionError> {
            Ok(ExecutionResult::success("stubbed"))
        }
    }

    struct Harness {
        orchestrator: PhaseOrchestrator,
        metrics: StaticMetricSource,
        events: Arc<MemoryEventBus>,
    }

    fn observation(kind: ObservationKind, severity: u8, value: f64) -> Observation {
        Observation {
            analysis_id: 1,
            kind,
            metric_name: "query_latency_p95".into(),
            metric_value: value,
            severity,
            observed_at: Utc::now(),
        }
    }

    fn harness(config: LoopConfig) -> Harness {
        harness_with_ttl(config, Duration::from_secs(24 * 60 * 60))
    }

    fn harness_with_ttl(config: LoopConfig, approval_ttl: Duration) -> Harness {
        let queue = Arc::new(MemoryConversationQueue::new(QueueConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(8),
            ..QueueConfig::default()
        }));
        let engine = HybridSearchEngine::new(AtomStore::new(8), SearchConfig::default());
        let metrics = StaticMetricSource::new();
        let events = Arc::new(MemoryEventBus::new(64));
        let executor = Arc::new(
            ActionExecutor::builder()
                .handler(
                    ActionType::IndexOperation,
                    Arc::new(IndexOperationHandler::new(engine.clone())),
                )
                .handler(ActionType::ShellCommand, Arc::new(StubShellHandler))
                .approval_ttl(approval_ttl)
                .build(),
        );
        let policy = TenantSecurityPolicy {
            allow_shell_commands: true,
            allow_unsafe_queries: false,
            command_whitelist: vec!["^index_rebuild\\.sh".into()],
            audit_level: AuditLevel::Standard,
        };
        let orchestrator = PhaseOrchestratorBuilder::new(
            queue,
            engine,
            executor,
            Arc::new(metrics.clone()) as Arc<dyn MetricSource>,
        )
        .policy("tenant-a", policy)
        .events(Arc::clone(&events) as Arc<dyn EventPublisher>)
        .config(config)
        .build();
        Harness {
            orchestrator,
            metrics,
            events,
        }
    }

    /// Drives the queue until it drains (the single-threaded test worker).
    async fn drain(orchestrator: &PhaseOrchestrator) {
        let queue = orchestrator.queue();
        while let Ok(Some(delivery)) = queue.receive(Duration::from_millis(50)).await {
            orchestrator.handle_delivery(delivery).await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_cycle_records_improvement() {
        let h = harness(LoopConfig::default());
        h.metrics.set_observations(vec![observation(
            ObservationKind::PerformanceRegression,
            80,
            120.0,
        )]);
        h.metrics.set_measurement("query_latency_p95", 40.0);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Completed);
        assert!(!cycle.rollback_eligible);

        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].before_metric, Some(120.0));
        assert_eq!(entries[0].after_metric, Some(40.0));
        assert_eq!(entries[0].reason_code, ReasonCode::Success);

        // Phase events arrive in monotonic order.
        let phases: Vec<String> = h
            .events
            .for_cycle(&cycle_id.to_string())
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        let observe = phases
            .iter()
            .position(|e| e == "phase.observe.completed")
            .unwrap();
        let learn = phases
            .iter()
            .position(|e| e == "phase.learn.completed")
            .unwrap();
        assert!(observe < learn);
    }

    #[tokio::test]
    async fn budget_breach_aborts_before_orient() {
        let h = harness(LoopConfig::default());
        h.metrics.set_observations(vec![observation(
            ObservationKind::PerformanceRegression,
            80,
            120.0,
        )]);

        let cycle_id = h
            .orchestrator
            .begin_cycle(
                "tenant-a",
                CycleBudget {
                    max_cost: 100.0,
                    max_duration: Duration::from_secs(3600),
                },
            )
            .await
            .unwrap();
        // Simulate spend recorded by earlier work in the cycle.
        h.orchestrator
            .registry()
            .update(cycle_id, |cycle| cycle.cumulative_cost = 150.0);

        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Aborted);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason_code, ReasonCode::BudgetExceeded);
        // No Orient message was ever enqueued.
        assert_eq!(h.orchestrator.queue().depth().ready, 0);
        assert!(cycle.carried.is_none());
    }

    #[tokio::test]
    async fn empty_observations_complete_cleanly() {
        let h = harness(LoopConfig::default());
        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Completed);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries[0].reason_code, ReasonCode::NoObservation);
        assert!(entries[0].success);
    }

    #[tokio::test]
    async fn non_whitelisted_remedy_fails_into_learn() {
        let h = harness(LoopConfig::default());
        // Repetition maps to a shell command remedy; break the whitelist so
        // the gate rejects it.
        h.metrics
            .set_observations(vec![observation(ObservationKind::Repetition, 60, 10.0)]);
        h.metrics.set_measurement("query_latency_p95", 10.0);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-b", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        // tenant-b has no policy registered: shell commands are disabled.
        assert_eq!(entries[0].reason_code, ReasonCode::CategoryDisabled);
        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Completed);
    }

    #[tokio::test]
    async fn approval_gate_suspends_then_resumes() {
        let h = harness(LoopConfig::default());
        h.metrics
            .set_observations(vec![observation(ObservationKind::Repetition, 97, 50.0)]);
        h.metrics.set_measurement("query_latency_p95", 45.0);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Acting);
        assert!(cycle.awaiting_approval);
        assert!(h.orchestrator.ledger().for_cycle(cycle_id).is_empty());

        h.orchestrator.approve_action(cycle_id).await.unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Completed);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
    }

    #[tokio::test]
    async fn denied_approval_aborts() {
        let h = harness(LoopConfig::default());
        h.metrics
            .set_observations(vec![observation(ObservationKind::Repetition, 97, 50.0)]);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        h.orchestrator.deny_action(cycle_id).await.unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Aborted);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries[0].reason_code, ReasonCode::ApprovalDenied);
    }

    #[tokio::test]
    async fn lapsed_approval_gate_times_out() {
        let h = harness_with_ttl(LoopConfig::default(), Duration::ZERO);
        h.metrics
            .set_observations(vec![observation(ObservationKind::Repetition, 97, 50.0)]);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;
        assert!(h
            .orchestrator
            .registry()
            .get(cycle_id)
            .unwrap()
            .awaiting_approval);

        h.orchestrator.housekeeping().await;
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Aborted);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries[0].reason_code, ReasonCode::ApprovalTimeout);
    }

    #[tokio::test]
    async fn regression_flags_rollback_eligibility() {
        let h = harness(LoopConfig::default());
        h.metrics.set_observations(vec![observation(
            ObservationKind::PerformanceRegression,
            70,
            100.0,
        )]);
        // The metric got 20% worse after the action.
        h.metrics.set_measurement("query_latency_p95", 120.0);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert!(cycle.rollback_eligible);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert!(entries[0].rollback_eligible);

        // Rollback is operator-invoked only; nothing ran it automatically.
        let result = h.orchestrator.rollback(cycle_id).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn phase_deadline_expiry_is_governed() {
        let h = harness(LoopConfig {
            phase_deadline: Duration::ZERO,
            ..LoopConfig::default()
        });
        h.metrics.set_observations(vec![observation(
            ObservationKind::PerformanceRegression,
            80,
            120.0,
        )]);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Aborted);
        let entries = h.orchestrator.ledger().for_cycle(cycle_id);
        assert_eq!(entries[0].reason_code, ReasonCode::PhaseDeadlineExceeded);
    }

    #[tokio::test]
    async fn malformed_messages_dead_letter() {
        let h = harness(LoopConfig::default());
        h.orchestrator
            .queue()
            .send(OutgoingMessage {
                conversation_id: "not-a-uuid".into(),
                message_type: "phase.observe".into(),
                payload: json!({}),
                deadline: None,
            })
            .await
            .unwrap();
        drain(&h.orchestrator).await;
        assert_eq!(h.orchestrator.queue().dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn transient_metric_failures_retry_to_dead_letter() {
        let h = harness(LoopConfig::default());
        // No measurement and no observations set: observe succeeds with an
        // empty set, so force the failure through Learn instead by seeding
        // an observation without a measurement.
        h.metrics.set_observations(vec![observation(
            ObservationKind::PerformanceRegression,
            80,
            120.0,
        )]);

        let cycle_id = h
            .orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        drain(&h.orchestrator).await;

        // Learn retried against the missing measurement until the queue
        // dead-lettered its message; the cycle parks in Learning.
        let cycle = h.orchestrator.registry().get(cycle_id).unwrap();
        assert_eq!(cycle.phase, CyclePhase::Learning);
        let dead = h.orchestrator.queue().dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.attempts, 5);
    }
}
