//! Standard input line source.
pub mod reader;
