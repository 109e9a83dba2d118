use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use insightforge_events::BehaviorEvent;

use crate::error::AnalysisError;

/// Output of one analysis call.
///
/// This is *not* stored as-is: the pipeline wraps it into an insight record
/// together with batch metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    /// Human-readable summary of the batch.
    pub summary: String,

    /// Confidence in \[0, 1\].
    pub confidence: f64,

    /// Detected patterns, most significant first.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl AnalysisOutput {
    pub fn new(summary: impl Into<String>, confidence: f64) -> Self {
        Self {
            summary: summary.into(),
            confidence,
            patterns: Vec::new(),
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    /// Clamp confidence into \[0, 1\]; non-finite values become 0.
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// The analysis function: `analyze(events) -> {summary, confidence, patterns}`.
///
/// Implementations may fail, time out or rate-limit; callers put them behind a
/// circuit breaker and their own timeout. Events arrive ordered by timestamp.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn analyze(&self, events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError>;
}

#[async_trait]
impl<A: Analyzer + ?Sized> Analyzer for std::sync::Arc<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn analyze(&self, events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError> {
        (**self).analyze(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_clamps_confidence() {
        assert_eq!(AnalysisOutput::new("s", 1.7).normalized().confidence, 1.0);
        assert_eq!(AnalysisOutput::new("s", -0.2).normalized().confidence, 0.0);
        assert_eq!(AnalysisOutput::new("s", f64::NAN).normalized().confidence, 0.0);
        assert_eq!(AnalysisOutput::new("s", 0.42).normalized().confidence, 0.42);
    }

    #[test]
    fn patterns_default_when_missing() {
        let out: AnalysisOutput =
            serde_json::from_str(r#"{"summary":"quiet hour","confidence":0.3}"#).unwrap();
        assert!(out.patterns.is_empty());
    }
}
