//! Batches: bounded groups of events that get analyzed as a unit.

pub mod sealer;
pub mod types;

pub use sealer::{BatchSealer, SealReport};
pub use types::{Batch, BatchStats, BatchStatus, Insight, SealPolicy};
