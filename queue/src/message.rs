use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message delivered through the conversation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message identifier.
    pub id: Uuid,
    /// Conversation (cycle) the message belongs to.
    pub conversation_id: String,
    /// Message type tag, e.g. `phase.observe`.
    pub message_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts consumed so far (failed processing attempts).
    pub attempts: u32,
    /// Deadline after which the message should be treated as stale.
    pub deadline: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// Whether the message's deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// A follow-up message enqueued atomically with a commit.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Target conversation.
    pub conversation_id: String,
    /// Message type tag.
    pub message_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Optional processing deadline.
    pub deadline: Option<DateTime<Utc>>,
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The retry ceiling was reached.
    RetryExhausted,
    /// The payload could not be parsed; retrying would never succeed.
    Malformed(String),
}

/// A message removed from the main queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The poisoned message, including its final attempt count.
    pub message: QueueMessage,
    /// Removal reason.
    pub reason: DeadLetterReason,
    /// Removal timestamp.
    pub dead_lettered_at: DateTime<Utc>,
}
