use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use insightforge_core::{BatchId, DomainError, DomainResult};

/// A user-behavior event as handed over by the ingestion path.
///
/// `timestamp` is client/business time; the store assigns the batch and the
/// arrival time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBehaviorEvent {
    pub event_type: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl NewBehaviorEvent {
    pub fn new(
        event_type: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            user_id: user_id.into(),
            timestamp,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject events that cannot be attributed or categorized.
    pub fn validate(&self) -> DomainResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(DomainError::validation("event_type must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(DomainError::validation("user_id must not be empty"));
        }
        Ok(())
    }
}

/// A stored event, bound to the batch it was appended to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub event_id: Uuid,
    pub batch_id: BatchId,
    pub event_type: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: JsonValue,
    /// When the store accepted the event (arrival order).
    pub received_at: DateTime<Utc>,
}

impl BehaviorEvent {
    pub fn from_new(
        batch_id: BatchId,
        event: NewBehaviorEvent,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            batch_id,
            event_type: event.event_type,
            user_id: event.user_id,
            timestamp: event.timestamp,
            metadata: event.metadata,
            received_at,
        }
    }
}

/// Order events the way the analysis request expects them: by timestamp, ties
/// broken by arrival.
pub fn order_for_analysis(events: &mut [BehaviorEvent]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.received_at.cmp(&b.received_at))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}
