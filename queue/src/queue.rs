use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::message::{DeadLetter, DeadLetterReason, OutgoingMessage, QueueMessage};

/// Errors surfaced by the queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The target conversation was closed or has expired.
    #[error("conversation closed: {0}")]
    ConversationClosed(String),
}

/// Queue tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Failed processing attempts before a message is dead-lettered.
    pub max_attempts: u32,
    /// First retry delay; doubles per failure.
    pub backoff_base: Duration,
    /// Ceiling on the retry delay.
    pub backoff_cap: Duration,
    /// Conversation lifetime before auto-expiry.
    pub conversation_lifetime: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(16),
            conversation_lifetime: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    /// Retry delay after the given number of failed attempts (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempts.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// Queue depth snapshot for observability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDepth {
    /// Immediately deliverable messages.
    pub ready: usize,
    /// Messages waiting out a retry backoff.
    pub delayed: usize,
    /// Messages currently held by a consumer.
    pub inflight: usize,
    /// Dead-lettered messages.
    pub dead_letters: usize,
}

/// Durable conversation queue contract.
///
/// Implementable by any broker offering per-conversation single-flight
/// delivery plus atomic ack-and-enqueue. The in-memory implementation below
/// provides those semantics for a single process.
#[async_trait]
pub trait ConversationQueue: Send + Sync {
    /// Enqueues a message, registering the conversation on first use.
    async fn send(&self, outgoing: OutgoingMessage) -> Result<Uuid, QueueError>;

    /// Receives the next deliverable message, blocking up to `timeout`.
    ///
    /// Returns `None` when nothing became deliverable within the timeout.
    /// While the returned [`Delivery`] is unsettled, no other message of the
    /// same conversation will be delivered to anyone.
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Closes a conversation, discarding its pending messages.
    async fn close_conversation(&self, conversation_id: &str);

    /// Snapshot of dead-lettered messages.
    fn dead_letters(&self) -> Vec<DeadLetter>;

    /// Drains the ids of conversations that expired since the last call.
    fn drain_expired(&self) -> Vec<String>;

    /// Current queue depth.
    fn depth(&self) -> QueueDepth;
}

trait DeliveryBackend: Send + Sync {
    fn commit(
        &self,
        message: &QueueMessage,
        follow_ups: Vec<OutgoingMessage>,
    ) -> Result<(), QueueError>;
    fn retry(&self, message: &QueueMessage);
    fn reject(&self, message: &QueueMessage, reason: String);
    fn release(&self, message: &QueueMessage);
}

/// A received message holding its conversation's affinity lock.
///
/// Dropping the delivery without settling it models a consumer crash: the
/// message returns to the ready set with its attempt count unchanged.
pub struct Delivery {
    message: QueueMessage,
    backend: Arc<dyn DeliveryBackend>,
    settled: bool,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &QueueMessage {
        &self.message
    }

    /// Acks the message and enqueues the follow-ups in the same transaction:
    /// either all of it happens or none of it does.
    pub fn commit(mut self, follow_ups: Vec<OutgoingMessage>) -> Result<(), QueueError> {
        self.backend.commit(&self.message, follow_ups)?;
        self.settled = true;
        Ok(())
    }

    /// Records a failed processing attempt. The message is re-queued with
    /// exponential backoff, or dead-lettered once the ceiling is reached.
    pub fn retry(mut self) {
        self.backend.retry(&self.message);
        self.settled = true;
    }

    /// Dead-letters the message immediately (malformed payloads bypass retry).
    pub fn reject(mut self, reason: impl Into<String>) {
        self.backend.reject(&self.message, reason.into());
        self.settled = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.backend.release(&self.message);
        }
    }
}

#[derive(Debug)]
struct ConversationState {
    expires_at: DateTime<Utc>,
    closed: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    delayed: Vec<(DateTime<Utc>, QueueMessage)>,
    inflight: HashMap<Uuid, QueueMessage>,
    locked: HashSet<String>,
    dead: Vec<DeadLetter>,
    conversations: HashMap<String, ConversationState>,
    expired: Vec<String>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl QueueShared {
    fn enqueue_locked(
        state: &mut QueueState,
        config: &QueueConfig,
        outgoing: OutgoingMessage,
        now: DateTime<Utc>,
    ) -> Result<Uuid, QueueError> {
        let conversation = state
            .conversations
            .entry(outgoing.conversation_id.clone())
            .or_insert_with(|| ConversationState {
                expires_at: now
                    + chrono::Duration::from_std(config.conversation_lifetime)
                        .unwrap_or_else(|_| chrono::Duration::hours(24)),
                closed: false,
            });
        if conversation.closed {
            return Err(QueueError::ConversationClosed(outgoing.conversation_id));
        }
        let message = QueueMessage {
            id: Uuid::new_v4(),
            conversation_id: outgoing.conversation_id,
            message_type: outgoing.message_type,
            payload: outgoing.payload,
            enqueued_at: now,
            attempts: 0,
            deadline: outgoing.deadline,
        };
        let id = message.id;
        state.ready.push_back(message);
        Ok(id)
    }

    fn sweep(&self, state: &mut QueueState, now: DateTime<Utc>) {
        // Promote delayed messages whose backoff has elapsed.
        let mut promoted = Vec::new();
        state.delayed.retain(|(visible_at, message)| {
            if *visible_at <= now {
                promoted.push(message.clone());
                false
            } else {
                true
            }
        });
        for message in promoted {
            state.ready.push_back(message);
        }

        // Expire conversations past their lifetime, discarding stale work.
        let mut expired_ids = Vec::new();
        for (id, conversation) in &mut state.conversations {
            if !conversation.closed && conversation.expires_at <= now {
                conversation.closed = true;
                expired_ids.push(id.clone());
            }
        }
        for id in expired_ids {
            warn!(conversation = %id, "conversation expired; discarding pending messages");
            state.ready.retain(|message| message.conversation_id != id);
            state
                .delayed
                .retain(|(_, message)| message.conversation_id != id);
            state.expired.push(id);
        }
    }

    fn unlock(state: &mut QueueState, message: &QueueMessage) {
        state.inflight.remove(&message.id);
        state.locked.remove(&message.conversation_id);
    }
}

impl DeliveryBackend for QueueShared {
    fn commit(
        &self,
        message: &QueueMessage,
        follow_ups: Vec<OutgoingMessage>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        // Validate before applying anything so the commit stays all-or-nothing.
        for outgoing in &follow_ups {
            if state
                .conversations
                .get(&outgoing.conversation_id)
                .is_some_and(|c| c.closed)
            {
                return Err(QueueError::ConversationClosed(
                    outgoing.conversation_id.clone(),
                ));
            }
        }
        QueueShared::unlock(&mut state, message);
        let now = Utc::now();
        for outgoing in follow_ups {
            // Validated above; registration of new conversations cannot fail.
            let _ = Self::enqueue_locked(&mut state, &self.config, outgoing, now);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    fn retry(&self, message: &QueueMessage) {
        let mut state = self.state.lock();
        QueueShared::unlock(&mut state, message);
        let mut message = message.clone();
        message.attempts += 1;
        if message.attempts >= self.config.max_attempts {
            warn!(
                message_id = %message.id,
                attempts = message.attempts,
                "retry ceiling reached; dead-lettering"
            );
            state.dead.push(DeadLetter {
                message,
                reason: DeadLetterReason::RetryExhausted,
                dead_lettered_at: Utc::now(),
            });
        } else {
            let delay = self.config.backoff_for(message.attempts);
            let visible_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| {
                    chrono::Duration::seconds(16)
                });
            state.delayed.push((visible_at, message));
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn reject(&self, message: &QueueMessage, reason: String) {
        let mut state = self.state.lock();
        QueueShared::unlock(&mut state, message);
        state.dead.push(DeadLetter {
            message: message.clone(),
            reason: DeadLetterReason::Malformed(reason),
            dead_lettered_at: Utc::now(),
        });
    }

    fn release(&self, message: &QueueMessage) {
        let mut state = self.state.lock();
        QueueShared::unlock(&mut state, message);
        state.ready.push_front(message.clone());
        drop(state);
        self.notify.notify_waiters();
    }
}

/// In-memory queue with durable-broker semantics, suitable for a single
/// process and for tests.
#[derive(Clone)]
pub struct MemoryConversationQueue {
    shared: Arc<QueueShared>,
}

impl MemoryConversationQueue {
    /// Creates a queue with the given configuration.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    /// Queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }
}

impl Default for MemoryConversationQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl ConversationQueue for MemoryConversationQueue {
    async fn send(&self, outgoing: OutgoingMessage) -> Result<Uuid, QueueError> {
        let id = {
            let mut state = self.shared.state.lock();
            QueueShared::enqueue_locked(&mut state, &self.shared.config, outgoing, Utc::now())?
        };
        self.shared.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.shared.state.lock();
                let now = Utc::now();
                self.shared.sweep(&mut state, now);

                let position = state.ready.iter().position(|message| {
                    !state.locked.contains(&message.conversation_id)
                        && !state
                            .conversations
                            .get(&message.conversation_id)
                            .is_some_and(|c| c.closed)
                });
                if let Some(message) = position.and_then(|index| state.ready.remove(index)) {
                    state.locked.insert(message.conversation_id.clone());
                    state.inflight.insert(message.id, message.clone());
                    return Ok(Some(Delivery {
                        message,
                        backend: Arc::clone(&self.shared) as Arc<dyn DeliveryBackend>,
                        settled: false,
                    }));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let poll = remaining.min(Duration::from_millis(10));
            tokio::select! {
                () = self.shared.notify.notified() => {}
                () = sleep(poll) => {}
            }
        }
    }

    async fn close_conversation(&self, conversation_id: &str) {
        let mut state = self.shared.state.lock();
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            conversation.closed = true;
        }
        state
            .ready
            .retain(|message| message.conversation_id != conversation_id);
        state
            .delayed
            .retain(|(_, message)| message.conversation_id != conversation_id);
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state.lock().dead.clone()
    }

    fn drain_expired(&self) -> Vec<String> {
        std::mem::take(&mut self.shared.state.lock().expired)
    }

    fn depth(&self) -> QueueDepth {
        let state = self.shared.state.lock();
        QueueDepth {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            inflight: state.inflight.len(),
            dead_letters: state.dead.len(),
        }
    }
}
