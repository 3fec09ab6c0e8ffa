//! Relay agent: streams standard input, line by line, as structured events
//! to a remote session collector over a WebSocket.
//!
//! Data flows `input` → `decoder` → `controller` (with `queue` and
//! `session`) → `transport`.

pub mod cli;
pub mod controller;
pub mod decoder;
pub mod helpers;
pub mod input;
pub mod instrumentation;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod transport;
