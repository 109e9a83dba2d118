//! On-demand pipeline metrics.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use insightforge_core::{Clock, SharedClock};

use crate::batches::BatchStats;
use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::store::{JobStats, PipelineStore, StoreResult};

/// Completed-job latency over a trailing window (milliseconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub window_secs: i64,
    pub count: usize,
    pub avg_ms: Option<f64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl LatencySummary {
    pub fn from_samples(window_secs: i64, mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self {
                window_secs,
                ..Default::default()
            };
        }

        samples.sort_unstable();
        let sum: u64 = samples.iter().sum();

        Self {
            window_secs,
            count: samples.len(),
            avg_ms: Some(sum as f64 / samples.len() as f64),
            p95_ms: percentile(&samples, 95.0),
            p99_ms: percentile(&samples, 99.0),
            max_ms: samples.last().copied(),
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted.get(rank.saturating_sub(1).min(sorted.len() - 1)).copied()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterSummary {
    pub total: u64,
    pub last_24h: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub generated_at: DateTime<Utc>,
    pub jobs: JobStats,
    pub batches: BatchStats,
    pub latency: LatencySummary,
    pub circuit_breaker: BreakerMetrics,
    pub dead_letters: DeadLetterSummary,
}

pub struct MetricsCollector {
    store: Arc<dyn PipelineStore>,
    breaker: Arc<CircuitBreaker>,
    clock: SharedClock,
    latency_window: Duration,
}

impl MetricsCollector {
    pub fn new(store: Arc<dyn PipelineStore>, breaker: Arc<CircuitBreaker>, clock: SharedClock) -> Self {
        Self {
            store,
            breaker,
            clock,
            latency_window: Duration::hours(1),
        }
    }

    pub async fn collect(&self) -> StoreResult<PipelineMetrics> {
        let now = self.clock.now();

        let jobs = self.store.job_stats(now).await?;
        let batches = self.store.batch_stats(now).await?;
        let samples = self
            .store
            .recent_analysis_times(now - self.latency_window)
            .await?;
        let (total, last_24h) = self.store.dead_letter_counts(now - Duration::hours(24)).await?;

        Ok(PipelineMetrics {
            generated_at: now,
            jobs,
            batches,
            latency: LatencySummary::from_samples(self.latency_window.num_seconds(), samples),
            circuit_breaker: self.breaker.metrics(),
            dead_letters: DeadLetterSummary { total, last_24h },
        })
    }
}
