//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use insightforge_core::{BatchId, DeadLetterId, DomainError, JobId};

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed (possibly backed off until `lock_expires_at`)
    Pending,
    /// Claimed by a worker under a lease
    Running,
    /// Completed successfully
    Success,
    /// Dead-lettered, no further retries
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Statuses that block creating another job for the same batch.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// What created the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "SCHEDULED",
            TriggerType::Manual => "MANUAL",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(TriggerType::Scheduled),
            "MANUAL" => Ok(TriggerType::Manual),
            other => Err(DomainError::validation(format!("unknown trigger type: {other}"))),
        }
    }
}

/// Largest exponent applied by the backoff formula.
pub const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Ceiling on any retry delay, including provider `Retry-After` hints.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + delay`, with `delay` capped at [`MAX_RETRY_DELAY`]. Never panics.
pub fn retry_deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay.min(MAX_RETRY_DELAY))
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Retry policy configuration.
///
/// `delay = base_delay * 2^min(attempt, 5)`, plus up to `jitter` (fraction) of
/// uniform random extra delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before a transient failure dead-letters the job
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Jitter factor (0.0-1.0), added on top of the exponential delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Exponential delay for `attempt`, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        self.backoff_with_sample(attempt, 0.0)
    }

    /// Delay for `attempt` given a jitter sample in \[0, 1).
    pub fn backoff_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exp = attempt.min(MAX_BACKOFF_EXPONENT);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * 2_f64.powi(exp as i32);
        let jitter_ms = delay_ms * self.jitter * sample.clamp(0.0, 1.0);

        Duration::from_millis((delay_ms + jitter_ms).round() as u64)
    }

    /// Delay for `attempt` with random jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::rng().random_range(0.0..1.0);
        self.backoff_with_sample(attempt, sample)
    }

    /// Wall-clock instant at which a job retried at `attempt` becomes claimable.
    pub fn retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        retry_deadline(now, self.delay_for_attempt(attempt))
    }
}

/// One unit of work: "analyze this batch".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub batch_id: BatchId,
    pub status: JobStatus,
    /// Non-completions so far (starts at 0, never decreases)
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Lease expiry while RUNNING; not-before time while backed off in PENDING
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_context: Option<JsonValue>,
    pub analysis_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub trigger_type: TriggerType,
}

impl AnalysisJob {
    /// Create a new PENDING job.
    pub fn new(
        batch_id: BatchId,
        max_attempts: u32,
        trigger_type: TriggerType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            batch_id,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts,
            lock_expires_at: None,
            last_error: None,
            error_context: None,
            analysis_time_ms: None,
            created_at: now,
            updated_at: now,
            trigger_type,
        }
    }

    /// Claimable: PENDING with no lock, or a lock that has passed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.lock_expires_at.map_or(true, |at| at <= now)
    }

    /// The lease a RUNNING job is held under.
    pub fn lease(&self) -> Option<Lease> {
        match (self.status, self.lock_expires_at) {
            (JobStatus::Running, Some(expires_at)) => Some(Lease {
                job_id: self.id,
                expires_at,
            }),
            _ => None,
        }
    }

    /// Whether a transient failure may be retried.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// A worker's claim on a job.
///
/// The expiry doubles as a fencing token: state changes made on behalf of a
/// lease only apply while the job is still RUNNING with this exact expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub expires_at: DateTime<Utc>,
}

/// Error details recorded on a job when an attempt fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
    pub context: JsonValue,
}

impl JobFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>, context: JsonValue) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context,
        }
    }

    /// Text stored in `last_error`.
    pub fn last_error(&self) -> String {
        format!("{}: {}", self.code, self.message)
    }
}

/// Immutable forensic record of a job that will not be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub error_context: Option<JsonValue>,
    /// Why the job was dead-lettered (e.g. `max_attempts_exceeded`)
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterJob {
    /// Snapshot a job at the moment it is dead-lettered.
    pub fn from_job(
        job: &AnalysisJob,
        reason: impl Into<String>,
        failure: &JobFailure,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            job_id: job.id,
            batch_id: job.batch_id.clone(),
            attempt_count: job.attempt_count,
            last_error: Some(failure.last_error()),
            error_context: Some(failure.context.clone()),
            reason: reason.into(),
            failed_at,
        }
    }
}

/// Dead-letter reasons.
pub mod reasons {
    pub const FATAL_ERROR: &str = "fatal_error";
    pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
    pub const STUCK_JOB_MAX_ATTEMPTS: &str = "stuck_job_max_attempts";
}
