//! Analysis jobs: creation, claiming, retry, and dead-letter handling.
//!
//! ## Design
//!
//! - One job per sealed batch (at most one PENDING/RUNNING/SUCCESS job per batch)
//! - Claims are leases (`lock_expires_at`); every write after a claim is fenced on the lease
//! - Transient failures back off exponentially; fatal ones go straight to the DLQ
//! - The recovery loop reclaims jobs whose worker disappeared
//!
//! ## Components
//!
//! - `JobCreator`: creates SCHEDULED jobs for sealed batches
//! - `JobWorker`: claims and processes jobs
//! - `RecoveryLoop`: stuck-job and expired-lease sweeps
//! - `ManualTrigger`: operator entry point (analyze now, replay a dead letter)

pub mod classify;
pub mod creator;
pub mod error;
pub mod recovery;
pub mod trigger;
pub mod types;
pub mod worker;

pub use classify::{classify, error_context, Classification, ErrorClass};
pub use creator::{CreateReport, JobCreator};
pub use error::ProcessError;
pub use recovery::{RecoveryConfig, RecoveryLoop, RecoveryReport};
pub use trigger::{ManualTrigger, TriggerError, TriggerOutcome};
pub use types::{
    reasons, retry_deadline, AnalysisJob, DeadLetterJob, JobFailure, JobStatus, Lease,
    RetryPolicy, TriggerType, MAX_BACKOFF_EXPONENT, MAX_RETRY_DELAY,
};
pub use worker::{JobWorker, WorkOutcome, WorkerConfig, WorkerHandle, WorkerStats};
