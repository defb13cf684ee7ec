use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::analysis::Observation;

/// External metrics/anomaly collaborator consulted by Observe and Learn.
///
/// Failures here are transient from the loop's perspective: the phase
/// message is retried with backoff and eventually dead-lettered.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Detects current signals for a tenant.
    async fn observe(&self, tenant_id: &str) -> anyhow::Result<Vec<Observation>>;

    /// Re-measures a single metric by name.
    async fn measure(&self, tenant_id: &str, metric_name: &str) -> anyhow::Result<f64>;
}

/// Fixture-style metric source backed by preloaded data. Used in tests and
/// local runs; production wires a real telemetry collaborator.
#[derive(Debug, Clone, Default)]
pub struct StaticMetricSource {
    observations: Arc<RwLock<Vec<Observation>>>,
    measurements: Arc<RwLock<IndexMap<String, f64>>>,
}

impl StaticMetricSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the observations returned by `observe`.
    pub fn set_observations(&self, observations: Vec<Observation>) {
        *self.observations.write() = observations;
    }

    /// Sets the value returned when `metric_name` is re-measured.
    pub fn set_measurement(&self, metric_name: impl Into<String>, value: f64) {
        self.measurements.write().insert(metric_name.into(), value);
    }
}

#[async_trait]
impl MetricSource for StaticMetricSource {
    async fn observe(&self, _tenant_id: &str) -> anyhow::Result<Vec<Observation>> {
        Ok(self.observations.read().clone())
    }

    async fn measure(&self, _tenant_id: &str, metric_name: &str) -> anyhow::Result<f64> {
        self.measurements
            .read()
            .get(metric_name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no measurement for {metric_name}"))
    }
}
