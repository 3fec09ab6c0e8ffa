//! Wiring of one relay run.
pub mod runtime;
