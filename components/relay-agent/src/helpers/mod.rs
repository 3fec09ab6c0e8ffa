//! Configuration, identity and process plumbing shared by the relay.
pub mod load_config;
pub mod session_id;
pub mod shutdown;
pub mod status;
