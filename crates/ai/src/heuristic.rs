use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Duration;

use insightforge_events::BehaviorEvent;

use crate::analyzer::{AnalysisOutput, Analyzer};
use crate::error::AnalysisError;

/// Deterministic, local analyzer for development and tests.
///
/// Model:
/// - Count events per type and per user.
/// - Flag a dominant event type when it covers at least half the batch.
/// - Flag returning users (at least `repeat_threshold` events each).
/// - Flag bursts: `burst_threshold` or more events inside any `burst_window`.
/// - Confidence grows with sample size and saturates below 1.
#[derive(Debug, Clone)]
pub struct HeuristicAnalyzer {
    repeat_threshold: usize,
    burst_threshold: usize,
    burst_window: Duration,
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self {
            repeat_threshold: 3,
            burst_threshold: 20,
            burst_window: Duration::seconds(60),
        }
    }
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repeat_threshold(mut self, threshold: usize) -> Self {
        self.repeat_threshold = threshold.max(2);
        self
    }

    pub fn with_burst(mut self, threshold: usize, window: Duration) -> Self {
        self.burst_threshold = threshold.max(2);
        self.burst_window = window;
        self
    }

    /// Pure inference over an ordered event slice.
    pub fn infer(&self, events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError> {
        if events.is_empty() {
            return Err(AnalysisError::InvalidRequest(
                "cannot analyze an empty batch".to_string(),
            ));
        }

        let total = events.len();
        let by_type = count_by(events, |e| e.event_type.as_str());
        let by_user = count_by(events, |e| e.user_id.as_str());

        let mut ranked: Vec<(&str, usize)> = by_type.iter().map(|(k, v)| (*k, *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut patterns = Vec::new();

        if let Some((top_type, top_count)) = ranked.first() {
            let share = *top_count as f64 / total as f64;
            if share >= 0.5 {
                patterns.push(format!(
                    "dominant activity: {top_type} ({:.0}% of events)",
                    share * 100.0
                ));
            }
        }

        if let Some((count, start)) = densest_window(events, self.burst_window) {
            if count >= self.burst_threshold {
                patterns.push(format!(
                    "burst: {count} events within {}s starting {}",
                    self.burst_window.num_seconds(),
                    start.to_rfc3339()
                ));
            }
        }

        let returning = by_user
            .values()
            .filter(|n| **n >= self.repeat_threshold)
            .count();
        if returning > 0 {
            patterns.push(format!(
                "{returning} returning user(s) with {}+ events",
                self.repeat_threshold
            ));
        }

        if by_user.len() == 1 {
            patterns.push("single-user batch".to_string());
        }

        let span = events
            .last()
            .zip(events.first())
            .map(|(last, first)| last.timestamp - first.timestamp)
            .unwrap_or_else(Duration::zero);

        let top_types: Vec<String> = ranked
            .iter()
            .take(3)
            .map(|(t, n)| format!("{t}={n}"))
            .collect();

        let summary = format!(
            "{total} event(s) from {} user(s) over {}s; top activity: {}",
            by_user.len(),
            span.num_seconds().max(0),
            top_types.join(", ")
        );

        let confidence = (total as f64 / (total as f64 + 20.0)).clamp(0.05, 0.95);

        Ok(AnalysisOutput::new(summary, confidence)
            .with_patterns(patterns)
            .normalized())
    }
}

#[async_trait]
impl Analyzer for HeuristicAnalyzer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn analyze(&self, events: &[BehaviorEvent]) -> Result<AnalysisOutput, AnalysisError> {
        self.infer(events)
    }
}

fn count_by<'a, F>(events: &'a [BehaviorEvent], key: F) -> BTreeMap<&'a str, usize>
where
    F: Fn(&'a BehaviorEvent) -> &'a str,
{
    let mut counts = BTreeMap::new();
    for e in events {
        *counts.entry(key(e)).or_insert(0) += 1;
    }
    counts
}

/// Largest number of events inside any window of length `window`, with the
/// timestamp that window starts at. Expects events ordered by timestamp.
fn densest_window(
    events: &[BehaviorEvent],
    window: Duration,
) -> Option<(usize, chrono::DateTime<chrono::Utc>)> {
    let mut best: Option<(usize, chrono::DateTime<chrono::Utc>)> = None;
    let mut start = 0;

    for end in 0..events.len() {
        while events[end].timestamp - events[start].timestamp > window {
            start += 1;
        }
        let count = end - start + 1;
        if best.map_or(true, |(n, _)| count > n) {
            best = Some((count, events[start].timestamp));
        }
    }

    best
}
