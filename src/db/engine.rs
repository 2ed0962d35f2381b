//! Low-level engine handles.
//!
//! An [`Engine`] runs one statement at a time against a live database handle
//! and reports whether a transaction is open on it. The production
//! implementation, [`SqlxEngine`], wraps a single sqlx connection; tests plug
//! in scripted engines through the same trait.
//!
//! # Architecture
//!
//! Statement execution uses database-specific implementations organized in
//! submodules (`mysql`, `postgres`, `sqlite`). Each submodule provides the
//! same interface adapted to the driver's result types.

use crate::db::params::bind_all;
use crate::db::types::RowToJson;
use crate::error::DbResult;
use crate::models::{DatabaseType, QueryOutput, QueryParam, ReturnMode, Row};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::cmp::Ordering;
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Minimum mysqlnd version able to negotiate utf8mb4.
const MYSQLND_MIN_VERSION: &str = "5.0.9";

/// Minimum libmysqlclient version able to negotiate utf8mb4.
const LIBMYSQLCLIENT_MIN_VERSION: &str = "5.5.3";

/// The client library an engine handle talks through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLibrary {
    /// A native wire-protocol client (sqlx). Speaks every charset the server does.
    Native(&'static str),
    /// The PHP-era mysqlnd client, with its version string.
    Mysqlnd(String),
    /// The C libmysqlclient, with its version string.
    LibMysqlClient(String),
}

impl ClientLibrary {
    /// True when the client can negotiate 4-byte UTF-8 with the server.
    pub fn supports_extended_charset(&self) -> bool {
        match self {
            Self::Native(_) => true,
            Self::Mysqlnd(version) => {
                compare_versions(version, MYSQLND_MIN_VERSION) != Ordering::Less
            }
            Self::LibMysqlClient(version) => {
                compare_versions(version, LIBMYSQLCLIENT_MIN_VERSION) != Ordering::Less
            }
        }
    }
}

impl std::fmt::Display for ClientLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(name) => write!(f, "{name}"),
            Self::Mysqlnd(version) => write!(f, "mysqlnd {version}"),
            Self::LibMysqlClient(version) => write!(f, "libmysqlclient {version}"),
        }
    }
}

/// Numeric components of the first dotted version in `s`.
///
/// `"mysqlnd 5.0.11-dev - 20120503"` yields `[5, 0, 11]`.
fn version_parts(s: &str) -> Vec<u64> {
    let start = s.find(|c: char| c.is_ascii_digit()).unwrap_or(s.len());
    s[start..]
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or("")
        .split('.')
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect()
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (version_parts(a), version_parts(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            a.get(i)
                .copied()
                .unwrap_or(0)
                .cmp(&b.get(i).copied().unwrap_or(0))
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// A live handle to one database.
#[async_trait]
pub trait Engine: Send {
    fn database_type(&self) -> DatabaseType;

    /// Run one statement and shape its result by `mode`.
    async fn run(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        mode: ReturnMode,
    ) -> DbResult<QueryOutput>;

    /// Whether the engine currently has a transaction open.
    fn in_transaction(&self) -> bool;

    fn client_library(&self) -> ClientLibrary;

    /// Replace the handle with one opened from `descriptor`.
    async fn reconnect(&mut self, descriptor: &Url) -> DbResult<()>;

    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// Follows transaction state from the statements that succeed on a handle.
///
/// sqlx only tracks transactions it opened itself, and this layer issues
/// `BEGIN`/`SAVEPOINT` as plain SQL, so the state is derived from the text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionTracker {
    open: bool,
    ddl_commits: bool,
}

impl TransactionTracker {
    /// A tracker for an engine where schema changes commit implicitly.
    pub fn committing_ddl() -> Self {
        Self {
            open: false,
            ddl_commits: true,
        }
    }

    /// MySQL commits implicitly on schema changes; the other engines do not.
    pub fn for_engine(database_type: DatabaseType) -> Self {
        match database_type {
            DatabaseType::MySQL => Self::committing_ddl(),
            _ => Self::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Record a statement that completed successfully.
    pub fn observe(&mut self, sql: &str) {
        let mut words = sql.split_whitespace().map(str::to_ascii_uppercase);
        let first = words.next().unwrap_or_default();
        let second = words.next().unwrap_or_default();

        match first.as_str() {
            "BEGIN" => self.open = true,
            "START" if second == "TRANSACTION" => self.open = true,
            "COMMIT" | "END" => self.open = false,
            "ROLLBACK" if second != "TO" => self.open = false,
            "CREATE" | "ALTER" | "DROP" | "RENAME" | "TRUNCATE"
                if self.ddl_commits && second != "TEMPORARY" =>
            {
                self.open = false
            }
            _ => {}
        }
    }
}

/// The driver handle behind a [`SqlxEngine`].
enum Handle {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl Handle {
    async fn open(database_type: DatabaseType, descriptor: &Url) -> DbResult<Self> {
        match database_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_url(descriptor)?;
                Ok(Self::MySql(options.connect().await?))
            }
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_url(descriptor)?;
                Ok(Self::Postgres(options.connect().await?))
            }
            DatabaseType::SQLite => {
                let options =
                    SqliteConnectOptions::from_str(descriptor.as_str())?.create_if_missing(true);
                Ok(Self::SQLite(options.connect().await?))
            }
        }
    }

    async fn close(self) -> DbResult<()> {
        match self {
            Self::MySql(c) => c.close().await?,
            Self::Postgres(c) => c.close().await?,
            Self::SQLite(c) => c.close().await?,
        }
        Ok(())
    }
}

/// [`Engine`] backed by one sqlx connection.
pub struct SqlxEngine {
    database_type: DatabaseType,
    handle: Handle,
    tracker: TransactionTracker,
}

impl SqlxEngine {
    /// Open a handle from a data-source descriptor.
    pub async fn connect(database_type: DatabaseType, descriptor: &Url) -> DbResult<Self> {
        let handle = Handle::open(database_type, descriptor).await?;
        Ok(Self {
            database_type,
            handle,
            tracker: TransactionTracker::for_engine(database_type),
        })
    }
}

impl std::fmt::Debug for SqlxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxEngine")
            .field("database_type", &self.database_type)
            .field("in_transaction", &self.tracker.is_open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Engine for SqlxEngine {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn run(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        mode: ReturnMode,
    ) -> DbResult<QueryOutput> {
        debug!(
            sql = %sql,
            params = params.len(),
            mode = ?mode,
            "Executing statement"
        );

        let output = match &mut self.handle {
            Handle::MySql(c) => mysql::run(c, sql, params, mode).await,
            Handle::Postgres(c) => postgres::run(c, sql, params, mode).await,
            Handle::SQLite(c) => sqlite::run(c, sql, params, mode).await,
        }
        .map_err(|e| e.with_sql(sql))?;

        self.tracker.observe(sql);
        Ok(output)
    }

    fn in_transaction(&self) -> bool {
        self.tracker.is_open()
    }

    fn client_library(&self) -> ClientLibrary {
        ClientLibrary::Native("sqlx")
    }

    async fn reconnect(&mut self, descriptor: &Url) -> DbResult<()> {
        let handle = Handle::open(self.database_type, descriptor).await?;
        let previous = std::mem::replace(&mut self.handle, handle);
        self.tracker = TransactionTracker::for_engine(self.database_type);
        if let Err(e) = previous.close().await {
            debug!(error = %e, "Failed to close replaced handle");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.handle.close().await
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Parameterless statements go through the text protocol so that statements
// which cannot be prepared (SAVEPOINT, SET NAMES, CREATE DATABASE) still run.

mod mysql {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::{Executor, MySql};

    pub async fn run(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        mode: ReturnMode,
    ) -> DbResult<QueryOutput> {
        if mode == ReturnMode::Rows {
            let rows: Vec<Row> = if params.is_empty() {
                (&mut *conn)
                    .fetch(sql)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?
            } else {
                bind_all::<MySql>(sql, params)
                    .fetch(&mut *conn)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?
            };
            return Ok(QueryOutput::Rows(rows));
        }

        let result = if params.is_empty() {
            (&mut *conn).execute(sql).await?
        } else {
            bind_all::<MySql>(sql, params).execute(&mut *conn).await?
        };

        Ok(match mode {
            ReturnMode::InsertId => QueryOutput::InsertId(result.last_insert_id() as i64),
            ReturnMode::AffectedRows => QueryOutput::AffectedRows(result.rows_affected()),
            _ => QueryOutput::Nothing,
        })
    }
}

mod postgres {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::postgres::PgRow;
    use sqlx::{Executor, Postgres};

    /// First column of a `RETURNING` row as an id.
    fn returned_id(row: &PgRow) -> Option<i64> {
        use sqlx::Row as _;
        row.try_get::<i64, _>(0)
            .ok()
            .or_else(|| row.try_get::<i32, _>(0).ok().map(i64::from))
    }

    pub async fn run(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        mode: ReturnMode,
    ) -> DbResult<QueryOutput> {
        if mode == ReturnMode::Rows {
            let rows: Vec<Row> = if params.is_empty() {
                (&mut *conn)
                    .fetch(sql)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?
            } else {
                bind_all::<Postgres>(sql, params)
                    .fetch(&mut *conn)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?
            };
            return Ok(QueryOutput::Rows(rows));
        }

        // PostgreSQL reports no insert id on the result. The id comes from
        // the statement's own RETURNING row; without one there is no id.
        if mode == ReturnMode::InsertId {
            let row = if params.is_empty() {
                (&mut *conn).fetch_optional(sql).await?
            } else {
                bind_all::<Postgres>(sql, params)
                    .fetch_optional(&mut *conn)
                    .await?
            };
            return Ok(row
                .as_ref()
                .and_then(returned_id)
                .map_or(QueryOutput::Nothing, QueryOutput::InsertId));
        }

        let result = if params.is_empty() {
            (&mut *conn).execute(sql).await?
        } else {
            bind_all::<Postgres>(sql, params).execute(&mut *conn).await?
        };

        Ok(match mode {
            ReturnMode::AffectedRows => QueryOutput::AffectedRows(result.rows_affected()),
            _ => QueryOutput::Nothing,
        })
    }
}

mod sqlite {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::{Executor, Sqlite};

    pub async fn run(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        mode: ReturnMode,
    ) -> DbResult<QueryOutput> {
        if mode == ReturnMode::Rows {
            let rows: Vec<Row> = if params.is_empty() {
                (&mut *conn)
                    .fetch(sql)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?
            } else {
                bind_all::<Sqlite>(sql, params)
                    .fetch(&mut *conn)
                    .map_ok(|r| r.to_json_map())
                    .try_collect()
                    .await?
            };
            return Ok(QueryOutput::Rows(rows));
        }

        let result = if params.is_empty() {
            (&mut *conn).execute(sql).await?
        } else {
            bind_all::<Sqlite>(sql, params).execute(&mut *conn).await?
        };

        Ok(match mode {
            ReturnMode::InsertId => QueryOutput::InsertId(result.last_insert_rowid()),
            ReturnMode::AffectedRows => QueryOutput::AffectedRows(result.rows_affected()),
            _ => QueryOutput::Nothing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parts() {
        assert_eq!(version_parts("5.5.3"), vec![5, 5, 3]);
        assert_eq!(
            version_parts("mysqlnd 5.0.11-dev - 20120503 - $Id: abc $"),
            vec![5, 0, 11]
        );
        assert!(version_parts("unknown").is_empty());
    }

    #[test]
    fn test_client_library_minimums() {
        assert!(ClientLibrary::Native("sqlx").supports_extended_charset());

        assert!(!ClientLibrary::Mysqlnd("mysqlnd 5.0.8".into()).supports_extended_charset());
        assert!(ClientLibrary::Mysqlnd("mysqlnd 5.0.9".into()).supports_extended_charset());
        assert!(ClientLibrary::Mysqlnd("mysqlnd 8.1.2".into()).supports_extended_charset());

        assert!(!ClientLibrary::LibMysqlClient("5.5.2".into()).supports_extended_charset());
        assert!(ClientLibrary::LibMysqlClient("5.5.3".into()).supports_extended_charset());
        assert!(ClientLibrary::LibMysqlClient("5.10.0".into()).supports_extended_charset());
    }

    #[test]
    fn test_tracker_begin_commit() {
        let mut tracker = TransactionTracker::default();
        assert!(!tracker.is_open());
        tracker.observe("START TRANSACTION");
        assert!(tracker.is_open());
        tracker.observe("SAVEPOINT savepoint_1");
        tracker.observe("ROLLBACK TO SAVEPOINT savepoint_1");
        assert!(tracker.is_open());
        tracker.observe("commit");
        assert!(!tracker.is_open());

        tracker.observe("BEGIN");
        tracker.observe("ROLLBACK");
        assert!(!tracker.is_open());
    }

    #[test]
    fn test_tracker_ddl_commits_only_when_configured() {
        let mut tracker = TransactionTracker::committing_ddl();
        tracker.observe("START TRANSACTION");
        tracker.observe("CREATE TEMPORARY TABLE db_temporary_0 ENGINE=MEMORY SELECT 1");
        assert!(tracker.is_open());
        tracker.observe("CREATE TABLE t (id INT)");
        assert!(!tracker.is_open());

        let mut tracker = TransactionTracker::default();
        tracker.observe("BEGIN");
        tracker.observe("DROP TABLE t");
        assert!(tracker.is_open());
    }
}
