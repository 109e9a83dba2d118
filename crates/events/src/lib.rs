//! `insightforge-events`
//!
//! **Responsibility:** the user-behavior event shapes exchanged with the
//! ingestion path.
//!
//! Ingestion transport lives outside this workspace. The pipeline only needs
//! "the events of a batch, ordered by arrival", which is what this crate models.

pub mod event;

pub use event::{BehaviorEvent, NewBehaviorEvent, order_for_analysis};
