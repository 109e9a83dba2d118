use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of an analysis call, tagged at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("analysis timed out: {0}")]
    Timeout(String),

    #[error("connection to analysis provider failed: {0}")]
    Connection(String),

    #[error("rate limited by analysis provider")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("analysis provider rejected credentials")]
    Unauthorized,

    #[error("analysis provider denied access")]
    Forbidden,

    #[error("analysis endpoint not found")]
    NotFound,

    #[error("invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error("analysis provider error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid analysis response: {0}")]
    InvalidResponse(String),

    #[error("analysis failed: {0}")]
    Other(String),
}

/// Discriminant of [`AnalysisError`], used for retry classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisErrorKind {
    Timeout,
    Connection,
    RateLimited,
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidRequest,
    Upstream,
    InvalidResponse,
    Other,
}

impl AnalysisError {
    pub fn kind(&self) -> AnalysisErrorKind {
        match self {
            AnalysisError::Timeout(_) => AnalysisErrorKind::Timeout,
            AnalysisError::Connection(_) => AnalysisErrorKind::Connection,
            AnalysisError::RateLimited { .. } => AnalysisErrorKind::RateLimited,
            AnalysisError::Unauthorized => AnalysisErrorKind::Unauthorized,
            AnalysisError::Forbidden => AnalysisErrorKind::Forbidden,
            AnalysisError::NotFound => AnalysisErrorKind::NotFound,
            AnalysisError::InvalidRequest(_) => AnalysisErrorKind::InvalidRequest,
            AnalysisError::Upstream { .. } => AnalysisErrorKind::Upstream,
            AnalysisError::InvalidResponse(_) => AnalysisErrorKind::InvalidResponse,
            AnalysisError::Other(_) => AnalysisErrorKind::Other,
        }
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            400 | 422 => AnalysisError::InvalidRequest(body),
            401 => AnalysisError::Unauthorized,
            403 => AnalysisError::Forbidden,
            404 => AnalysisError::NotFound,
            429 => AnalysisError::RateLimited {
                retry_after_secs: None,
            },
            _ => AnalysisError::Upstream {
                status,
                message: body,
            },
        }
    }
}
