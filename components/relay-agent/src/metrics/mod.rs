//! Per-run delivery counters.
pub mod metrics;
