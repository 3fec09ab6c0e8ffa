//! Ordered buffer of events waiting for the transport.
pub mod delivery_queue;
