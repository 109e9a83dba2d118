//! HTTP admin surface and process wiring for the insightforge pipeline.

pub mod app;
