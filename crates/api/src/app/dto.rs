use serde::Deserialize;

use insightforge_infra::batches::{Batch, Insight};
use insightforge_infra::jobs::{AnalysisJob, DeadLetterJob};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    /// Requested limit, defaulted and clamped to `1..=MAX_LIST_LIMIT`.
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

// -------------------------
// Response mapping
// -------------------------

pub fn job_to_json(job: &AnalysisJob) -> serde_json::Value {
    serde_json::json!({
        "id": job.id.to_string(),
        "batch_id": job.batch_id.to_string(),
        "status": job.status.to_string(),
        "attempt_count": job.attempt_count,
        "max_attempts": job.max_attempts,
        "trigger_type": job.trigger_type,
        "lock_expires_at": job.lock_expires_at.map(|t| t.to_rfc3339()),
        "last_error": job.last_error,
        "created_at": job.created_at.to_rfc3339(),
    })
}

pub fn dead_letter_to_json(entry: &DeadLetterJob) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id.to_string(),
        "job_id": entry.job_id.to_string(),
        "batch_id": entry.batch_id.to_string(),
        "attempt_count": entry.attempt_count,
        "reason": entry.reason,
        "last_error": entry.last_error,
        "error_context": entry.error_context,
        "failed_at": entry.failed_at.to_rfc3339(),
    })
}

pub fn batch_to_json(batch: &Batch, insight: Option<&Insight>) -> serde_json::Value {
    serde_json::json!({
        "id": batch.id.to_string(),
        "status": batch.status,
        "event_count": batch.event_count,
        "created_at": batch.created_at.to_rfc3339(),
        "sealed_at": batch.sealed_at.map(|t| t.to_rfc3339()),
        "insight": insight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_limit_is_clamped() {
        assert_eq!(ListQuery::default().limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(ListQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(ListQuery { limit: Some(10_000) }.limit(), MAX_LIST_LIMIT);
        assert_eq!(ListQuery { limit: Some(7) }.limit(), 7);
    }
}
