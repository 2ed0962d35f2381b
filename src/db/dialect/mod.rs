//! Engine-specific SQL dialects.
//!
//! A [`DialectAdapter`] knows everything that differs between engines:
//! connection descriptors and init statements, pagination, temporary tables,
//! database creation, transaction and sequence SQL, and how to read the
//! engine's error codes. One adapter is chosen when a connection is opened
//! and never changes afterwards.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::config::ConnectionOptions;
use crate::db::engine::Engine;
use crate::db::quote::{IdentifierQuoter, strip_alias_chars, strip_table_chars};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use async_trait::async_trait;
use url::Url;

/// Name of the scratch table used to probe 4-byte UTF-8 support.
pub const EXTENDED_CHARSET_TEST_TABLE: &str = "drupal_utf8mb4_test";

/// What the connection must do after a database was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterCreate {
    /// The current handle already points at the new database.
    Active,
    /// The handle must be reopened against the new database.
    Reconnect,
}

/// Engine-specific SQL generation and error classification.
#[async_trait]
pub trait DialectAdapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DatabaseType;

    /// Short driver identifier: `mysql`, `pgsql` or `sqlite`.
    fn driver(&self) -> &'static str;

    fn database_type(&self) -> &'static str {
        self.driver()
    }

    fn quoter(&self) -> IdentifierQuoter;

    fn quote_identifier(&self, identifier: &str) -> String {
        self.quoter().quote(identifier)
    }

    fn escape_table(&self, name: &str) -> String {
        self.quoter().quote(&strip_table_chars(name))
    }

    fn escape_field(&self, name: &str) -> String {
        self.quoter().quote(&strip_table_chars(name))
    }

    fn escape_alias(&self, name: &str) -> String {
        self.quoter().quote(&strip_alias_chars(name))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    /// Whether schema changes take part in transactions.
    fn supports_transactional_ddl(&self) -> bool;

    /// Bound parameter marker for the 1-based `index`.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    // -------------------------------------------------------------------------
    // Connection setup
    // -------------------------------------------------------------------------

    /// Data-source descriptor handed to the driver.
    fn descriptor(&self, options: &ConnectionOptions) -> DbResult<Url>;

    /// Statements run right after the handle is opened, in order.
    fn init_statements(&self, options: &ConnectionOptions) -> Vec<String>;

    /// Engine codes meaning the configured database does not exist.
    fn database_not_found_codes(&self) -> &'static [&'static str];

    /// Database to connect to while the configured one is being created.
    fn maintenance_database(&self) -> Option<&'static str>;

    /// Map a failed connect onto the error kinds callers distinguish.
    fn classify_connect_error(&self, err: DbError, options: &ConnectionOptions) -> DbError {
        let not_found = err
            .engine_code()
            .is_some_and(|code| self.database_not_found_codes().contains(&code));
        if not_found {
            let database = options.database.clone().unwrap_or_default();
            return DbError::database_not_found(database, err.to_string());
        }
        match err {
            DbError::ConnectionFailed { .. } | DbError::InvalidInput { .. } => err,
            other => {
                let message = other.to_string();
                let suggestion = connection_suggestion(self.kind(), &message);
                DbError::connection_failed(message, suggestion)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Query shaping
    // -------------------------------------------------------------------------

    /// Pagination suffix selecting `count` rows starting at `from`.
    fn range_clause(&self, from: u64, count: u64) -> String {
        format!("LIMIT {count} OFFSET {from}")
    }

    /// Statement creating temporary table `table` from `query`.
    fn temporary_table_sql(&self, table: &str, query: &str) -> String {
        format!("CREATE TEMPORARY TABLE {table} AS {query}")
    }

    /// Create database `name`. Any failure is reported as database-not-found.
    async fn create_database(&self, engine: &mut dyn Engine, name: &str)
    -> DbResult<AfterCreate>;

    // -------------------------------------------------------------------------
    // Extended charset
    // -------------------------------------------------------------------------

    /// Whether the configured charset is the 4-byte UTF-8 one.
    fn extended_charset_active(&self, _options: &ConnectionOptions) -> bool {
        true
    }

    /// Whether the charset can be switched between 3- and 4-byte UTF-8.
    fn extended_charset_configurable(&self) -> bool {
        false
    }

    /// Whether client and server can store 4-byte UTF-8. May run statements.
    async fn probe_extended_charset(&self, _engine: &mut dyn Engine, _test_table: &str) -> bool {
        true
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    fn begin_sql(&self) -> &'static str {
        "BEGIN"
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {name}")
    }

    fn release_savepoint_sql(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {name}")
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {name}")
    }

    fn commit_sql(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    /// True when `err` says the savepoint is gone, i.e. the engine already
    /// committed everything underneath it.
    fn is_missing_savepoint(&self, err: &DbError) -> bool;

    /// True when `sql` commits any open transaction as a side effect.
    fn implicitly_commits(&self, _sql: &str) -> bool {
        false
    }

    // -------------------------------------------------------------------------
    // Sequences
    // -------------------------------------------------------------------------

    /// DDL for the sequence table `table` (already quoted).
    fn sequence_table_sql(&self, table: &str) -> String;

    /// Insert of a row with an engine-assigned value.
    fn sequence_insert_sql(&self, table: &str) -> String {
        format!("INSERT INTO {table} DEFAULT VALUES")
    }

    /// Raise the counter to at least the single bound parameter, without
    /// failing when that value already exists.
    fn sequence_floor_sql(&self, table: &str) -> String;
}

/// Adapter for `database_type`.
pub fn adapter_for(database_type: DatabaseType) -> Box<dyn DialectAdapter> {
    match database_type {
        DatabaseType::MySQL => Box::new(MySqlDialect),
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::SQLite => Box::new(SqliteDialect),
    }
}

/// Descriptor for a network engine: socket over host, default port, the
/// given extra pairs, then the driver options.
pub(crate) fn network_descriptor(
    options: &ConnectionOptions,
    extra: &[(&str, &str)],
) -> DbResult<Url> {
    let host = match options.unix_socket {
        Some(_) => "localhost",
        None => options.host.as_deref().unwrap_or("localhost"),
    };
    let mut url = Url::parse(&format!("{}://{}", options.driver.scheme(), host))
        .map_err(|e| DbError::invalid_input(format!("Invalid host '{host}': {e}")))?;

    if let Some(username) = options.username.as_deref().filter(|u| !u.is_empty()) {
        url.set_username(username)
            .map_err(|_| DbError::invalid_input("Username cannot be encoded in a URL"))?;
    }
    if let Some(password) = options.password.as_deref() {
        url.set_password(Some(password))
            .map_err(|_| DbError::invalid_input("Password cannot be encoded in a URL"))?;
    }
    if options.unix_socket.is_none() {
        url.set_port(options.port_or_default())
            .map_err(|_| DbError::invalid_input("Port cannot be set on this URL"))?;
    }
    if let Some(database) = options.database.as_deref().filter(|d| !d.is_empty()) {
        url.set_path(&format!("/{database}"));
    }

    let pairs: Vec<(&str, &str)> = extra
        .iter()
        .copied()
        .chain(
            options
                .driver_options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .collect();
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }

    Ok(url)
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(db_type: DatabaseType, error: &str) -> String {
    let error_str = error.to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match db_type {
        DatabaseType::PostgreSQL => "Verify the host, port and database name".to_string(),
        DatabaseType::MySQL => "Verify the host, port or socket and database name".to_string(),
        DatabaseType::SQLite => "Verify the file path exists and is accessible".to_string(),
    }
}

/// Validate a database name before it is spliced into DDL.
pub(crate) fn checked_database_name(name: &str) -> DbResult<&str> {
    if name.is_empty() || strip_alias_chars(name) != name {
        return Err(DbError::database_not_found(
            name,
            "Database names may only contain letters, digits and underscores",
        ));
    }
    Ok(name)
}
