//! Failure classification: decides whether a failed attempt is worth retrying.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use insightforge_ai::AnalysisErrorKind;

use super::error::ProcessError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Likely to succeed later; retried with backoff
    Transient,
    /// Will fail the same way again; dead-lettered immediately
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub class: ErrorClass,
    /// Stable machine code, e.g. `rate_limited`
    pub code: &'static str,
    pub message: String,
}

impl Classification {
    fn transient(code: &'static str, message: String) -> Self {
        Self {
            class: ErrorClass::Transient,
            code,
            message,
        }
    }

    fn fatal(code: &'static str, message: String) -> Self {
        Self {
            class: ErrorClass::Fatal,
            code,
            message,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Classify a processing failure.
///
/// Anything not known to be permanent is transient; `max_attempts` bounds
/// how long an unknown failure can keep a job alive.
pub fn classify(err: &ProcessError) -> Classification {
    let message = err.to_string();

    match err {
        ProcessError::BatchNotFound(_) => Classification::fatal("batch_not_found", message),
        ProcessError::BatchNotSealed { .. } => Classification::fatal("batch_not_sealed", message),
        ProcessError::NoEvents(_) => Classification::fatal("no_events", message),
        ProcessError::CircuitOpen { .. } => Classification::transient("circuit_open", message),
        ProcessError::Timeout(_) => Classification::transient("timeout", message),
        ProcessError::Store(_) => Classification::transient("store_error", message),
        ProcessError::Analysis(analysis) => match analysis.kind() {
            AnalysisErrorKind::Timeout => Classification::transient("timeout", message),
            AnalysisErrorKind::Connection => Classification::transient("connection_reset", message),
            AnalysisErrorKind::RateLimited => Classification::transient("rate_limited", message),
            AnalysisErrorKind::Upstream => Classification::transient("upstream_error", message),
            AnalysisErrorKind::InvalidResponse => {
                Classification::transient("invalid_response", message)
            }
            AnalysisErrorKind::Other => Classification::transient("unknown", message),
            AnalysisErrorKind::Unauthorized => Classification::fatal("unauthorized", message),
            AnalysisErrorKind::Forbidden => Classification::fatal("forbidden", message),
            AnalysisErrorKind::NotFound => Classification::fatal("not_found", message),
            AnalysisErrorKind::InvalidRequest => Classification::fatal("validation", message),
        },
    }
}

/// Structured context persisted alongside `last_error`.
pub fn error_context(err: &ProcessError, classification: &Classification) -> JsonValue {
    let mut context = json!({
        "class": classification.class,
        "code": classification.code,
    });

    match err {
        ProcessError::CircuitOpen { retry_at } => {
            context["retry_at"] = json!(retry_at.to_rfc3339());
        }
        ProcessError::Timeout(limit) => {
            context["timeout_ms"] = json!(limit.as_millis() as u64);
        }
        ProcessError::BatchNotSealed { status, .. } => {
            context["batch_status"] = json!(status.as_str());
        }
        ProcessError::Analysis(analysis) => {
            context["analysis_error"] = json!(analysis.kind());
            if let insightforge_ai::AnalysisError::RateLimited {
                retry_after_secs: Some(secs),
            } = analysis
            {
                context["retry_after_secs"] = json!(secs);
            }
            if let insightforge_ai::AnalysisError::Upstream { status, .. } = analysis {
                context["http_status"] = json!(status);
            }
        }
        _ => {}
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use insightforge_ai::AnalysisError;

    use crate::batches::BatchStatus;
    use crate::store::StoreError;

    fn class_of(err: ProcessError) -> (ErrorClass, &'static str) {
        let c = classify(&err);
        (c.class, c.code)
    }

    #[test]
    fn retryable_failures_are_transient() {
        use ErrorClass::Transient;

        assert_eq!(class_of(ProcessError::Timeout(Duration::from_secs(120))), (Transient, "timeout"));
        assert_eq!(
            class_of(ProcessError::CircuitOpen { retry_at: Utc::now() }),
            (Transient, "circuit_open")
        );
        assert_eq!(
            class_of(AnalysisError::RateLimited { retry_after_secs: None }.into()),
            (Transient, "rate_limited")
        );
        assert_eq!(
            class_of(AnalysisError::Connection("reset by peer".into()).into()),
            (Transient, "connection_reset")
        );
        assert_eq!(
            class_of(StoreError::Storage("pool timed out".into()).into()),
            (Transient, "store_error")
        );
    }

    #[test]
    fn unknown_failures_default_to_transient() {
        let (class, code) = class_of(AnalysisError::Other("???".into()).into());
        assert_eq!(class, ErrorClass::Transient);
        assert_eq!(code, "unknown");
    }

    #[test]
    fn permanent_failures_are_fatal() {
        use ErrorClass::Fatal;
        let batch = || "b".parse::<insightforge_core::BatchId>().unwrap();

        assert_eq!(class_of(AnalysisError::Unauthorized.into()), (Fatal, "unauthorized"));
        assert_eq!(class_of(AnalysisError::Forbidden.into()), (Fatal, "forbidden"));
        assert_eq!(class_of(AnalysisError::NotFound.into()), (Fatal, "not_found"));
        assert_eq!(
            class_of(AnalysisError::InvalidRequest("bad".into()).into()),
            (Fatal, "validation")
        );
        assert_eq!(class_of(ProcessError::BatchNotFound(batch())), (Fatal, "batch_not_found"));
        assert_eq!(class_of(ProcessError::NoEvents(batch())), (Fatal, "no_events"));
        assert_eq!(
            class_of(ProcessError::BatchNotSealed {
                batch_id: batch(),
                status: BatchStatus::Open
            }),
            (Fatal, "batch_not_sealed")
        );
    }

    #[test]
    fn context_carries_retry_hints() {
        let err: ProcessError = AnalysisError::RateLimited {
            retry_after_secs: Some(30),
        }
        .into();
        let ctx = error_context(&err, &classify(&err));

        assert_eq!(ctx["code"], "rate_limited");
        assert_eq!(ctx["class"], "TRANSIENT");
        assert_eq!(ctx["retry_after_secs"], 30);
    }
}
