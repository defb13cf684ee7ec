#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Provenance event publishing for improvement cycles.
//!
//! Every phase transition and action execution emits a [`ProvenanceEvent`]
//! for external audit/graph-mirroring consumers. The core never depends on a
//! consumer succeeding: callers are expected to drop publish errors.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Outcome classification attached to a provenance event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// The step completed as intended.
    Success,
    /// The step failed or was rejected.
    Failure,
    /// The step is awaiting an external decision.
    Pending,
}

/// Structured provenance record emitted by the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Improvement cycle the event belongs to.
    pub cycle_id: String,
    /// Event type (e.g. `phase.observe.completed`, `action.executed`).
    pub event_type: String,
    /// Phase label at emission time.
    pub phase: String,
    /// Emission timestamp.
    pub occurred_at: DateTime<Utc>,
    /// Outcome classification.
    pub outcome: EventOutcome,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ProvenanceEvent {
    /// Creates an event for the given cycle and type.
    #[must_use]
    pub fn new(
        cycle_id: impl Into<String>,
        phase: impl Into<String>,
        event_type: impl Into<String>,
        outcome: EventOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id: cycle_id.into(),
            event_type: event_type.into(),
            phase: phase.into(),
            occurred_at: Utc::now(),
            outcome,
            payload: serde_json::Value::Null,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: ProvenanceEvent) -> Result<()>;
}

/// In-memory broadcast bus retaining a bounded backlog (for local runs and tests).
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<ProvenanceEvent>,
    backlog: Arc<Mutex<VecDeque<ProvenanceEvent>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Subscribes to live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProvenanceEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of recent events retained in memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProvenanceEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Events recorded for a specific cycle, oldest first.
    #[must_use]
    pub fn for_cycle(&self, cycle_id: &str) -> Vec<ProvenanceEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.cycle_id == cycle_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: ProvenanceEvent) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            backlog.push_back(event.clone());
            while backlog.len() > self.capacity {
                backlog.pop_front();
            }
        }
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// File-backed publisher appending JSON lines, useful for durable audit trails.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: ProvenanceEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let data = serde_json::to_vec(&event)?;
        file.write_all(&data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event() -> ProvenanceEvent {
        ProvenanceEvent::new("cycle-1", "observing", "phase.observe.completed", EventOutcome::Success)
            .with_payload(serde_json::json!({"observations": 2}))
    }

    #[tokio::test]
    async fn publishes_and_receives() {
        let bus = MemoryEventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(sample_event()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "phase.observe.completed");
    }

    #[tokio::test]
    async fn backlog_filters_by_cycle() {
        let bus = MemoryEventBus::new(16);
        bus.publish(sample_event()).await.unwrap();
        bus.publish(ProvenanceEvent::new(
            "cycle-2",
            "acting",
            "action.executed",
            EventOutcome::Failure,
        ))
        .await
        .unwrap();
        assert_eq!(bus.for_cycle("cycle-1").len(), 1);
        assert_eq!(bus.for_cycle("cycle-2").len(), 1);
    }

    #[tokio::test]
    async fn file_publisher_writes_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provenance.log");
        let publisher = FileEventPublisher::new(&path).unwrap();
        publisher.publish(sample_event()).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("phase.observe.completed"));
    }
}
