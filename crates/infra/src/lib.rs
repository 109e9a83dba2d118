//! `insightforge-infra`
//!
//! **Responsibility:** the resilient batch/job pipeline.
//!
//! - Batches are sealed by size or age, then analyzed exactly once.
//! - Jobs are claimed through atomic conditional updates (leases); every
//!   later write is fenced on the lease.
//! - Failures are classified: transient ones back off exponentially, fatal
//!   ones land in the dead-letter queue.
//! - A circuit breaker guards the external analysis call.
//! - Storage is behind [`store::PipelineStore`] with in-memory and Postgres
//!   implementations.

pub mod batches;
pub mod breaker;
pub mod config;
pub mod jobs;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Pipeline, PipelineHandle};
