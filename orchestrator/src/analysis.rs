use chrono::{DateTime, Utc};
use kaizen_actions::{Action, ActionType};
use kaizen_atoms::SearchHit;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Signal classification produced by the Observe phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// A tracked metric degraded.
    PerformanceRegression,
    /// Queries are missing expected knowledge.
    KnowledgeGap,
    /// Spend is above the expected envelope.
    HighCost,
    /// The same work is being redone.
    Repetition,
}

impl ObservationKind {
    /// Stable label for logs and vectors.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PerformanceRegression => "performance_regression",
            Self::KnowledgeGap => "knowledge_gap",
            Self::HighCost => "high_cost",
            Self::Repetition => "repetition",
        }
    }

    /// Numeric feature used when embedding an observation as a query vector.
    #[must_use]
    pub const fn feature(self) -> f32 {
        match self {
            Self::PerformanceRegression => 0.1,
            Self::KnowledgeGap => 0.4,
            Self::HighCost => 0.7,
            Self::Repetition => 0.9,
        }
    }

    /// The action category a hypothesis for this kind proposes.
    #[must_use]
    pub const fn remedy(self) -> ActionType {
        match self {
            Self::PerformanceRegression => ActionType::IndexOperation,
            Self::KnowledgeGap => ActionType::ApiCall,
            Self::HighCost => ActionType::Query,
            Self::Repetition => ActionType::ShellCommand,
        }
    }
}

/// A detected signal. Produced only by the Observe phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Monotonic analysis identifier; lower means older.
    pub analysis_id: u64,
    /// Signal classification.
    pub kind: ObservationKind,
    /// Metric the signal was derived from.
    pub metric_name: String,
    /// Metric value at observation time.
    pub metric_value: f64,
    /// Severity, 0-100.
    pub severity: u8,
    /// Observation timestamp.
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    /// Embeds the observation as a fixed-dimension query vector for the
    /// search engine. Deterministic: identical observations embed identically.
    #[must_use]
    pub fn signal_vector(&self, dimension: usize) -> Vec<f32> {
        #[allow(clippy::cast_possible_truncation)]
        let features = [
            self.kind.feature(),
            f32::from(self.severity) / 100.0,
            self.metric_value as f32,
            self.metric_name.len() as f32 / 64.0,
        ];
        (0..dimension).map(|i| features[i % features.len()]).collect()
    }
}

/// A candidate remedy drafted by the Orient phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    /// The observation this hypothesis answers.
    pub analysis_id: u64,
    /// Remedy classification (the proposed action's category label).
    pub hypothesis_type: String,
    /// Priority derived from severity.
    pub priority: u8,
    /// Why this remedy was chosen.
    pub rationale: String,
    /// The concrete action to validate and execute.
    pub proposed_action: Action,
    /// Confidence, 0-1. Scales with how many analogous past fixes exist.
    pub confidence: f32,
}

/// Picks the observation to carry forward: highest severity wins, ties break
/// toward the lowest (oldest) analysis id.
#[must_use]
pub fn select_observation(observations: &[Observation]) -> Option<Observation> {
    observations
        .iter()
        .max_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| b.analysis_id.cmp(&a.analysis_id))
        })
        .cloned()
}

/// Drafts exactly one hypothesis for the carried observation.
///
/// `analogous_fixes` are search hits for similar past incidents; more of
/// them means higher confidence. Actions above the approval severity are
/// marked as requiring sign-off.
#[must_use]
pub fn draft_hypothesis(
    observation: &Observation,
    analogous_fixes: &[SearchHit],
    approval_severity: u8,
) -> Hypothesis {
    let action_type = observation.kind.remedy();
    let payload = match action_type {
        ActionType::IndexOperation => json!({"op": "rebuild", "cell_size": 1.0}),
        ActionType::ShellCommand => json!("index_rebuild.sh"),
        ActionType::Query => json!(format!(
            "EXPLAIN ANALYZE SELECT 1 -- tune {}",
            observation.metric_name
        )),
        ActionType::ApiCall => json!({
            "endpoint": "knowledge/refresh",
            "metric": observation.metric_name,
        }),
    };
    let rollback = match action_type {
        ActionType::IndexOperation => Some(json!({"op": "rebuild", "cell_size": 1.0})),
        _ => None,
    };

    let mut action = Action::new(action_type, payload, f64::from(observation.severity) / 20.0);
    if let Some(rollback) = rollback {
        action = action.with_rollback(rollback);
    }
    if observation.severity >= approval_severity {
        action = action.with_approval();
    }

    #[allow(clippy::cast_precision_loss)]
    let confidence = (0.4 + analogous_fixes.len() as f32 * 0.1).min(0.95);

    Hypothesis {
        analysis_id: observation.analysis_id,
        hypothesis_type: action_type.label().to_string(),
        priority: observation.severity,
        rationale: format!(
            "{} on {} (severity {}, {} analogous incidents)",
            observation.kind.label(),
            observation.metric_name,
            observation.severity,
            analogous_fixes.len()
        ),
        proposed_action: action,
        confidence,
    }
}
