#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Action execution fabric for the improvement loop.
//!
//! Every proposed action passes the same ordered gates before anything runs:
//! category switch, command whitelist, approval requirement. Rejections are
//! governed outcomes carried in the execution result, never errors.

/// Action and execution-result types.
pub mod action;
/// Approval gate queue for high-risk actions.
pub mod approval;
/// The gated executor and its handler registry.
pub mod executor;
/// Per-tenant security policy.
pub mod policy;

pub use action::{Action, ActionType, ExecutionResult, ReasonCode};
pub use approval::{ApprovalQueue, PendingApproval};
pub use executor::{
    ActionError, ActionExecutor, ActionExecutorBuilder, ActionHandler, ExecutionOutcome,
    IndexOperationHandler, ShellCommandHandler,
};
pub use policy::{AuditLevel, TenantSecurityPolicy};
