//! `insightforge-core`: shared building blocks for the insight pipeline.
//!
//! This crate contains identifiers, the domain error model and the clock
//! abstraction. It has **no infrastructure concerns** (no I/O, no runtime).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, DeadLetterId, InsightId, JobId};
