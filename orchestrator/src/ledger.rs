use std::sync::Arc;

use chrono::{DateTime, Utc};
use kaizen_actions::ReasonCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use uuid::Uuid;

/// Append-only record of one cycle's outcome. Never updated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementLedgerEntry {
    /// The cycle this entry records.
    pub cycle_id: Uuid,
    /// Metric value before the action, when one was measured.
    pub before_metric: Option<f64>,
    /// Metric value after the action, when one was re-measured.
    pub after_metric: Option<f64>,
    /// Whether the cycle achieved its intent.
    pub success: bool,
    /// Outcome classification.
    pub reason_code: ReasonCode,
    /// Whether the outcome regressed past the threshold and an operator may
    /// want to invoke the rollback operation.
    pub rollback_eligible: bool,
    /// Write timestamp.
    pub recorded_at: DateTime<Utc>,
}

impl ImprovementLedgerEntry {
    /// Creates an entry recorded now.
    #[must_use]
    pub fn new(cycle_id: Uuid, success: bool, reason_code: ReasonCode) -> Self {
        Self {
            cycle_id,
            before_metric: None,
            after_metric: None,
            success,
            reason_code,
            rollback_eligible: false,
            recorded_at: Utc::now(),
        }
    }

    /// Attaches before/after metric readings.
    #[must_use]
    pub const fn with_metrics(mut self, before: f64, after: f64) -> Self {
        self.before_metric = Some(before);
        self.after_metric = Some(after);
        self
    }

    /// Flags the entry as rollback-eligible.
    #[must_use]
    pub const fn rollback_eligible(mut self) -> Self {
        self.rollback_eligible = true;
        self
    }
}

/// Append-only improvement ledger with an optional JSONL mirror for the
/// reporting collaborator.
#[derive(Clone, Default)]
pub struct ImprovementLedger {
    entries: Arc<Mutex<Vec<ImprovementLedgerEntry>>>,
    mirror: Option<Arc<JsonLogger>>,
}

impl ImprovementLedger {
    /// In-memory ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that additionally appends each entry to a JSONL file.
    #[must_use]
    pub fn with_mirror(mirror: Arc<JsonLogger>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            mirror: Some(mirror),
        }
    }

    /// Appends an entry. There is deliberately no update or delete.
    pub fn append(&self, entry: ImprovementLedgerEntry) {
        if let Some(mirror) = &self.mirror {
            let record = LogRecord::new("loop.ledger", LogLevel::Info, "ledger.entry")
                .with_cycle(entry.cycle_id.to_string())
                .with_metadata(serde_json::to_value(&entry).unwrap_or_default());
            let _ = mirror.log(&record);
        }
        self.entries.lock().push(entry);
    }

    /// Snapshot of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ImprovementLedgerEntry> {
        self.entries.lock().clone()
    }

    /// Entries recorded for one cycle.
    #[must_use]
    pub fn for_cycle(&self, cycle_id: Uuid) -> Vec<ImprovementLedgerEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.cycle_id == cycle_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_and_queries_by_cycle() {
        let ledger = ImprovementLedger::new();
        let cycle_id = Uuid::new_v4();
        ledger.append(
            ImprovementLedgerEntry::new(cycle_id, true, ReasonCode::Success)
                .with_metrics(120.0, 40.0),
        );
        ledger.append(ImprovementLedgerEntry::new(
            Uuid::new_v4(),
            false,
            ReasonCode::BudgetExceeded,
        ));

        let entries = ledger.for_cycle(cycle_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].before_metric, Some(120.0));
        assert_eq!(entries[0].after_metric, Some(40.0));
        assert!(entries[0].success);
        assert_eq!(ledger.entries().len(), 2);
    }

    #[test]
    fn mirror_writes_jsonl() {
        let dir = tempdir().unwrap();
        let logger = Arc::new(JsonLogger::new(dir.path().join("ledger.jsonl")).unwrap());
        let ledger = ImprovementLedger::with_mirror(Arc::clone(&logger));
        ledger.append(ImprovementLedgerEntry::new(
            Uuid::new_v4(),
            false,
            ReasonCode::CommandNotWhitelisted,
        ));
        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("command_not_whitelisted"));
    }
}
