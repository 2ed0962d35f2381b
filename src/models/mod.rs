//! Data models shared by the database layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{Capabilities, ConnectionInfo, DatabaseType};
pub use query::{QueryOptions, QueryOutput, QueryParam, ReturnMode, Row};
