//! Connection lifecycle state machine.
pub mod models;
pub mod session;
