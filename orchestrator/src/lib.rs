#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Phase orchestrator for autonomous improvement cycles.
//!
//! A cycle is one pass through Observe, Orient, Act, and Learn, driven
//! one-to-one by conversation-queue messages so every phase transition is
//! serialized, durable, and budget-guarded. The orchestrator owns nothing
//! but coordination: observations come from a [`MetricSource`], candidate
//! remedies from the hybrid search engine, and execution goes through the
//! gated action executor.

/// Observation and hypothesis drafting.
pub mod analysis;
/// Cycle aggregate and registry.
pub mod cycle;
/// Budget ceilings checked at every phase entry.
pub mod guard;
/// Append-only improvement ledger.
pub mod ledger;
/// Metric source collaborator interface.
pub mod metrics;
/// The message-driven phase state machine.
pub mod orchestrator;
/// Phase enums and message parsing.
pub mod phase;
/// Cooperative worker pool.
pub mod worker;

pub use analysis::{Hypothesis, Observation, ObservationKind};
pub use cycle::{CycleBudget, CycleRegistry, CycleStatus, ImprovementCycle};
pub use guard::BudgetGuard;
pub use ledger::{ImprovementLedger, ImprovementLedgerEntry};
pub use metrics::{MetricSource, StaticMetricSource};
pub use orchestrator::{LoopConfig, LoopError, PhaseOrchestrator, PhaseOrchestratorBuilder};
pub use phase::{CyclePhase, Phase};
pub use worker::WorkerPool;
