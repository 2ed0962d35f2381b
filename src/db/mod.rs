//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Identifier quoting and escaping
//! - Engine handles and row decoding
//! - Per-engine SQL dialects
//! - Nested transactions and sequences
//! - The client-facing connection and its registry

pub mod connection;
pub mod dialect;
pub mod engine;
pub mod manager;
pub(crate) mod params;
pub mod quote;
pub mod sequence;
pub mod transaction;
pub mod types;

pub use connection::Connection;
pub use dialect::{AfterCreate, DialectAdapter, adapter_for};
pub use engine::{ClientLibrary, Engine, SqlxEngine, TransactionTracker};
pub use manager::{ConnectionManager, DEFAULT_TARGET, SharedConnection};
pub use quote::IdentifierQuoter;
pub use sequence::SequenceGenerator;
pub use transaction::{LayerState, TransactionLayer, TransactionManager};
