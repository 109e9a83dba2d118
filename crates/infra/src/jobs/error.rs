use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use insightforge_ai::AnalysisError;
use insightforge_core::BatchId;

use crate::batches::BatchStatus;
use crate::breaker::BreakerError;
use crate::store::StoreError;

/// Why processing a claimed job failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("batch {batch_id} is {status}, expected SEALED")]
    BatchNotSealed {
        batch_id: BatchId,
        status: BatchStatus,
    },

    #[error("batch {0} has no events")]
    NoEvents(BatchId),

    #[error("circuit open, retry after {retry_at}")]
    CircuitOpen { retry_at: DateTime<Utc> },

    #[error("analysis exceeded {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BreakerError<ProcessError>> for ProcessError {
    fn from(err: BreakerError<ProcessError>) -> Self {
        match err {
            BreakerError::Open { retry_at } => ProcessError::CircuitOpen { retry_at },
            BreakerError::Inner(inner) => inner,
        }
    }
}
