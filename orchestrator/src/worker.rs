use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::orchestrator::PhaseOrchestrator;

/// Cooperative consumer pool over the orchestrator's queue.
///
/// Workers share one queue; conversation affinity in the queue itself keeps
/// each cycle on a single consumer at a time, so the pool scales out across
/// cycles without ever interleaving phases within one.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.workers` consumers over the orchestrator's queue.
    #[must_use]
    pub fn spawn(orchestrator: Arc<PhaseOrchestrator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let workers = orchestrator.config().workers.max(1);
        let receive_wait = orchestrator.config().receive_wait;
        let handles = (0..workers)
            .map(|index| {
                let orchestrator = Arc::clone(&orchestrator);
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    Self::run_worker(index, &orchestrator, receive_wait, &mut stop).await;
                })
            })
            .collect();
        Self { shutdown, handles }
    }

    async fn run_worker(
        index: usize,
        orchestrator: &PhaseOrchestrator,
        receive_wait: Duration,
        stop: &mut watch::Receiver<bool>,
    ) {
        debug!(worker = index, "worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            orchestrator.housekeeping().await;
            match orchestrator.queue().receive(receive_wait).await {
                Ok(Some(delivery)) => {
                    if let Err(err) = orchestrator.handle_delivery(delivery).await {
                        error!(worker = index, error = %err, "delivery handling failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(worker = index, error = %err, "receive failed");
                }
            }
        }
        debug!(worker = index, "worker stopped");
    }

    /// Signals shutdown and waits for every worker to finish its current
    /// delivery. In-flight deliveries settle normally; nothing is lost.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        join_all(self.handles).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Observation, ObservationKind};
    use crate::cycle::CycleBudget;
    use crate::metrics::{MetricSource, StaticMetricSource};
    use crate::orchestrator::{LoopConfig, PhaseOrchestratorBuilder};
    use crate::phase::CyclePhase;
    use chrono::Utc;
    use kaizen_actions::{ActionExecutor, ActionType, IndexOperationHandler};
    use kaizen_atoms::{AtomStore, HybridSearchEngine, SearchConfig};
    use kaizen_queue::{ConversationQueue, MemoryConversationQueue, QueueConfig};

    #[tokio::test]
    async fn pool_drives_cycles_to_completion() {
        let queue = Arc::new(MemoryConversationQueue::new(QueueConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(8),
            ..QueueConfig::default()
        }));
        let engine = HybridSearchEngine::new(AtomStore::new(8), SearchConfig::default());
        let metrics = StaticMetricSource::new();
        metrics.set_observations(vec![Observation {
            analysis_id: 1,
            kind: ObservationKind::PerformanceRegression,
            metric_name: "query_latency_p95".into(),
            metric_value: 120.0,
            severity: 80,
            observed_at: Utc::now(),
        }]);
        metrics.set_measurement("query_latency_p95", 40.0);
        let executor = Arc::new(
            ActionExecutor::builder()
                .handler(
                    ActionType::IndexOperation,
                    Arc::new(IndexOperationHandler::new(engine.clone())),
                )
                .build(),
        );
        let orchestrator = Arc::new(
            PhaseOrchestratorBuilder::new(
                queue as Arc<dyn ConversationQueue>,
                engine,
                executor,
                Arc::new(metrics.clone()) as Arc<dyn MetricSource>,
            )
            .config(LoopConfig {
                workers: 2,
                receive_wait: Duration::from_millis(20),
                ..LoopConfig::default()
            })
            .build(),
        );

        let pool = WorkerPool::spawn(Arc::clone(&orchestrator));
        let first = orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();
        let second = orchestrator
            .begin_cycle("tenant-a", CycleBudget::default())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = [first, second].iter().all(|id| {
                orchestrator
                    .registry()
                    .get(*id)
                    .is_some_and(|cycle| cycle.phase.is_terminal())
            });
            if done || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        for id in [first, second] {
            let cycle = orchestrator.registry().get(id).unwrap();
            assert_eq!(cycle.phase, CyclePhase::Completed);
            let entries = orchestrator.ledger().for_cycle(id);
            assert_eq!(entries.len(), 1);
            assert!(entries[0].success);
        }
    }
}
