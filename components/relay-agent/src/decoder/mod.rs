//! Line decoding: raw stdin lines into typed [`models::Event`]s.
pub mod decoder;
pub mod models;
