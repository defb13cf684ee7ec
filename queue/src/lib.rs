#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Durable conversation queue: at-least-once delivery with per-conversation
//! affinity, exponential retry backoff, a dead-letter queue, and conversation
//! expiry.
//!
//! A conversation groups every message of one improvement cycle; the queue
//! guarantees at most one in-flight consumer per conversation, which makes a
//! cycle's message stream strictly ordered without any caller-side locking.

/// Message and dead-letter records.
pub mod message;
/// Queue trait and the in-memory implementation.
pub mod queue;

pub use message::{DeadLetter, DeadLetterReason, OutgoingMessage, QueueMessage};
pub use queue::{
    ConversationQueue, Delivery, MemoryConversationQueue, QueueConfig, QueueDepth, QueueError,
};
