//! Batch and insight records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use insightforge_ai::AnalysisOutput;
use insightforge_core::{BatchId, DomainError, InsightId};

/// Lifecycle of a batch. Transitions only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Accepting events
    Open,
    /// Immutable, eligible for analysis
    Sealed,
    /// Insight stored
    Analyzed,
    Archived,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 4] = [
        BatchStatus::Open,
        BatchStatus::Sealed,
        BatchStatus::Analyzed,
        BatchStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "OPEN",
            BatchStatus::Sealed => "SEALED",
            BatchStatus::Analyzed => "ANALYZED",
            BatchStatus::Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(BatchStatus::Open),
            "SEALED" => Ok(BatchStatus::Sealed),
            "ANALYZED" => Ok(BatchStatus::Analyzed),
            "ARCHIVED" => Ok(BatchStatus::Archived),
            other => Err(DomainError::validation(format!("unknown batch status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub status: BatchStatus,
    pub event_count: u64,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, at OPEN -> SEALED
    pub sealed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// A fresh OPEN batch whose window starts at `now`.
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::generate(now),
            status: BatchStatus::Open,
            event_count: 0,
            created_at: now,
            sealed_at: None,
        }
    }

    /// Start of the batch window: the id's encoded start, else `created_at`.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.id.window_start().unwrap_or(self.created_at)
    }

    /// ISO-8601 interval `<window start>/<sealed_at>`.
    pub fn time_window(&self) -> String {
        let end = self.sealed_at.unwrap_or(self.created_at);
        format!("{}/{}", self.window_start().to_rfc3339(), end.to_rfc3339())
    }
}

/// When an OPEN batch becomes due for sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealPolicy {
    pub size_threshold: u64,
    pub time_window: Duration,
}

impl Default for SealPolicy {
    fn default() -> Self {
        Self {
            size_threshold: 100,
            time_window: Duration::from_secs(10 * 60),
        }
    }
}

impl SealPolicy {
    /// Batches created strictly before this instant are due by age.
    pub fn age_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.time_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .max(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn is_due(&self, batch: &Batch, now: DateTime<Utc>) -> bool {
        batch.status == BatchStatus::Open
            && (batch.event_count >= self.size_threshold || batch.created_at < self.age_cutoff(now))
    }
}

/// Stored analysis result, one per batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: InsightId,
    pub batch_id: BatchId,
    pub summary: String,
    pub confidence: f64,
    pub patterns: Vec<String>,
    pub event_count: u64,
    pub time_window: String,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn from_output(
        batch: &Batch,
        output: AnalysisOutput,
        event_count: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let output = output.normalized();
        Self {
            id: InsightId::new(),
            batch_id: batch.id.clone(),
            summary: output.summary,
            confidence: output.confidence,
            patterns: output.patterns,
            event_count,
            time_window: batch.time_window(),
            created_at: now,
        }
    }
}

/// Counts of batches by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub open: u64,
    pub sealed: u64,
    pub analyzed: u64,
    pub archived: u64,
    /// Age of the oldest OPEN batch in seconds
    pub oldest_open_age_secs: Option<i64>,
}
