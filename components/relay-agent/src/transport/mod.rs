//! WebSocket transport to the collector.
pub mod models;
pub mod protocol;
pub mod transport;
