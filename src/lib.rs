//! Portable database layer.
//!
//! One query and transaction contract over MySQL/MariaDB, PostgreSQL and
//! SQLite: identifier quoting, per-engine dialects, nested transactions on
//! savepoints, and sequence emulation.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::ConnectionOptions;
pub use db::{Connection, ConnectionManager};
pub use error::{DbError, DbResult};
