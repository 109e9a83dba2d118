//! `insightforge-ai`
//!
//! **Responsibility:** the boundary to the external analysis function.
//!
//! This crate is intentionally **not** part of the pipeline state machine:
//! - It must not touch storage or job state.
//! - It turns an ordered slice of events into an insight, or a typed error.
//! - Errors carry an explicit [`AnalysisErrorKind`] so callers can decide on
//!   retries without inspecting messages.

pub mod analyzer;
pub mod error;
pub mod heuristic;
pub mod http;

pub use analyzer::{AnalysisOutput, Analyzer};
pub use error::{AnalysisError, AnalysisErrorKind};
pub use heuristic::HeuristicAnalyzer;
pub use http::HttpAnalyzer;
