//! Wires the pipeline components together and runs their loops.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use insightforge_ai::Analyzer;
use insightforge_core::SharedClock;

use crate::batches::BatchSealer;
use crate::breaker::CircuitBreaker;
use crate::config::{ConfigError, PipelineConfig};
use crate::jobs::{JobCreator, JobWorker, ManualTrigger, RecoveryLoop, WorkerHandle, WorkerStats};
use crate::metrics::MetricsCollector;
use crate::scheduler::{LoopHandle, PeriodicLoop};
use crate::store::PipelineStore;

/// Shared pieces of one pipeline process.
///
/// Loops are built from this on [`Pipeline::spawn`]; the manual trigger and
/// metrics collector are handed to the HTTP layer.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn PipelineStore>,
    analyzer: Arc<dyn Analyzer>,
    breaker: Arc<CircuitBreaker>,
    clock: SharedClock,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PipelineStore>,
        analyzer: Arc<dyn Analyzer>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let breaker = CircuitBreaker::shared(config.breaker_config(), clock.clone());

        Ok(Self {
            config,
            store,
            analyzer,
            breaker,
            clock,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn PipelineStore> {
        self.store.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn sealer(&self) -> BatchSealer {
        BatchSealer::new(self.store.clone(), self.clock.clone(), self.config.seal_policy())
    }

    pub fn creator(&self) -> JobCreator {
        JobCreator::new(self.store.clone(), self.clock.clone(), self.config.max_attempts)
    }

    pub fn worker(&self, index: usize) -> JobWorker {
        JobWorker::new(
            self.config.worker_config(index),
            self.store.clone(),
            self.analyzer.clone(),
            self.breaker.clone(),
            self.clock.clone(),
            self.config.retry_policy(),
        )
    }

    pub fn recovery(&self) -> RecoveryLoop {
        RecoveryLoop::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.retry_policy(),
            self.config.recovery_config(),
        )
    }

    pub fn trigger(&self) -> ManualTrigger {
        ManualTrigger::new(self.store.clone(), self.clock.clone(), self.config.max_attempts)
    }

    pub fn metrics(&self) -> MetricsCollector {
        MetricsCollector::new(self.store.clone(), self.breaker.clone(), self.clock.clone())
    }

    /// Start the sealer, creator, recovery and worker loops.
    pub fn spawn(&self, shutdown: &CancellationToken) -> PipelineHandle {
        let mut loops = Vec::with_capacity(3);

        let sealer = Arc::new(self.sealer());
        loops.push(
            PeriodicLoop::new("sealer", self.config.sealer_interval()).spawn(shutdown, move || {
                let sealer = sealer.clone();
                async move {
                    if let Err(err) = sealer.run_once().await {
                        error!(error = %err, "sealing pass failed");
                    }
                }
            }),
        );

        let creator = Arc::new(self.creator());
        loops.push(
            PeriodicLoop::new("creator", self.config.creator_interval()).spawn(shutdown, move || {
                let creator = creator.clone();
                async move {
                    if let Err(err) = creator.run_once().await {
                        error!(error = %err, "job creation pass failed");
                    }
                }
            }),
        );

        let recovery = Arc::new(self.recovery());
        let interval = recovery.config().interval;
        loops.push(PeriodicLoop::new("recovery", interval).spawn(shutdown, move || {
            let recovery = recovery.clone();
            async move {
                if let Err(err) = recovery.run_once().await {
                    error!(error = %err, "recovery pass failed");
                }
            }
        }));

        let workers = (0..self.config.worker_concurrency)
            .map(|i| Arc::new(self.worker(i)).spawn(shutdown))
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            analyzer = self.analyzer.name(),
            "pipeline started"
        );

        PipelineHandle { loops, workers }
    }
}

/// Handle to the running loops of a [`Pipeline`].
#[derive(Debug)]
pub struct PipelineHandle {
    loops: Vec<LoopHandle>,
    workers: Vec<WorkerHandle>,
}

impl PipelineHandle {
    pub fn worker_stats(&self) -> Vec<(String, WorkerStats)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.stats()))
            .collect()
    }

    /// Stop every loop after its in-flight iteration and wait. Returns the
    /// final worker stats.
    pub async fn shutdown(self) -> Vec<(String, WorkerStats)> {
        let mut stats = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            let name = worker.name().to_string();
            stats.push((name, worker.shutdown().await));
        }
        for handle in self.loops {
            handle.shutdown().await;
        }
        info!("pipeline stopped");
        stats
    }
}
