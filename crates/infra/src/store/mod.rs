//! Storage boundary for batches, jobs, dead letters and insights.
//!
//! The pipeline coordinates workers purely through conditional updates in the
//! store: claims, completions and failures each check the state they expect
//! and report whether they applied. Two adapters share the same semantics:
//! an in-memory store for tests/dev and a PostgreSQL store.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryPipelineStore;
pub use postgres::PostgresPipelineStore;
pub use r#trait::{
    BatchStore, CompletionOutcome, DeadLetterStore, InsightStore, JobStats, JobStore,
    PipelineStore, StoreError, StoreResult,
};
