//! Strongly-typed identifiers used across the pipeline.

use core::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an analysis job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Identifier of a dead-letter record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

/// Identifier of a stored insight.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsightId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(JobId, "JobId");
impl_uuid_newtype!(DeadLetterId, "DeadLetterId");
impl_uuid_newtype!(InsightId, "InsightId");

const BATCH_PREFIX: &str = "batch_";
const WINDOW_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Stable external key of a batch.
///
/// Generated keys look like `batch_20261018T101500Z_9f3a61c2`: the UTC start of
/// the batch window followed by a random suffix. Keys minted elsewhere are
/// accepted as long as they are non-empty; only generated keys carry a
/// recoverable window start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Mint a key for a batch whose window opens at `opened_at`.
    pub fn generate(opened_at: DateTime<Utc>) -> Self {
        let random = Uuid::now_v7().simple().to_string();
        let suffix = &random[random.len() - 8..];
        Self(format!(
            "{BATCH_PREFIX}{}_{suffix}",
            opened_at.format(WINDOW_FORMAT)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Window start encoded in a generated key (second precision).
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        let rest = self.0.strip_prefix(BATCH_PREFIX)?;
        let stamp = rest.split('_').next()?;
        NaiveDateTime::parse_from_str(stamp, WINDOW_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BatchId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("BatchId: empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<BatchId> for String {
    fn from(value: BatchId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_batch_id_encodes_window_start() {
        let opened = Utc.with_ymd_and_hms(2026, 10, 18, 10, 15, 0).unwrap();
        let id = BatchId::generate(opened);

        assert!(id.as_str().starts_with("batch_20261018T101500Z_"));
        assert_eq!(id.window_start(), Some(opened));
    }

    #[test]
    fn generated_batch_ids_are_distinct_within_the_same_second() {
        let opened = Utc.with_ymd_and_hms(2026, 10, 18, 10, 15, 0).unwrap();
        assert_ne!(BatchId::generate(opened), BatchId::generate(opened));
    }

    #[test]
    fn foreign_batch_ids_have_no_window() {
        let id: BatchId = "legacy-42".parse().unwrap();
        assert_eq!(id.window_start(), None);
        assert!("   ".parse::<BatchId>().is_err());
    }

    #[test]
    fn job_id_round_trips_through_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn batch_id_serializes_transparently() {
        let id: BatchId = "batch_x".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"batch_x\"");
    }
}
