//! Error types for the database layer.
//!
//! Every failure surfaced to callers is a distinguishable `DbError` kind.
//! Engine diagnostics (message and native error code) are preserved so the
//! dialect adapters can classify them without string-matching at call sites.

use sqlx::error::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String, suggestion: String },

    #[error("Database '{database}' not found: {message}")]
    DatabaseNotFound { database: String, message: String },

    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        /// Native engine code, e.g. "1305" on MySQL or "42P01" on PostgreSQL
        code: Option<String>,
        sql: String,
    },

    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        message: String,
        code: Option<String>,
        sql: String,
    },

    #[error("Transaction commit failed: {message}")]
    TransactionCommitFailed { message: String },

    #[error("No active transaction: {message}")]
    NoActiveTransaction { message: String },

    #[error("Transaction name '{name}' is already in use")]
    TransactionNameNotUnique { name: String },

    #[error("Transaction '{name}' rolled back out of order: active inner layers were discarded")]
    TransactionOutOfOrder { name: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection_failed(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database not found error.
    pub fn database_not_found(database: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseNotFound {
            database: database.into(),
            message: message.into(),
        }
    }

    /// Create a query error carrying the engine diagnostic.
    pub fn query_failed(
        message: impl Into<String>,
        code: Option<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self::QueryFailed {
            message: message.into(),
            code,
            sql: sql.into(),
        }
    }

    /// Create a constraint violation error.
    pub fn constraint_violation(
        message: impl Into<String>,
        code: Option<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self::ConstraintViolation {
            message: message.into(),
            code,
            sql: sql.into(),
        }
    }

    pub fn transaction_commit_failed(message: impl Into<String>) -> Self {
        Self::TransactionCommitFailed {
            message: message.into(),
        }
    }

    pub fn no_active_transaction(message: impl Into<String>) -> Self {
        Self::NoActiveTransaction {
            message: message.into(),
        }
    }

    pub fn transaction_name_not_unique(name: impl Into<String>) -> Self {
        Self::TransactionNameNotUnique { name: name.into() }
    }

    pub fn transaction_out_of_order(name: impl Into<String>) -> Self {
        Self::TransactionOutOfOrder { name: name.into() }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Native engine error code, if the engine reported one.
    pub fn engine_code(&self) -> Option<&str> {
        match self {
            Self::QueryFailed { code, .. } | Self::ConstraintViolation { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }

    /// True for both plain query failures and constraint violations.
    pub fn is_query_failure(&self) -> bool {
        matches!(
            self,
            Self::QueryFailed { .. } | Self::ConstraintViolation { .. }
        )
    }

    /// True when the statement was rejected by a uniqueness or integrity rule.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }

    /// Attach the statement text to a query error that was converted without it.
    pub fn with_sql(self, statement: &str) -> Self {
        match self {
            Self::QueryFailed { message, code, sql } if sql.is_empty() => {
                Self::query_failed(message, code, statement)
            }
            Self::ConstraintViolation { message, code, sql } if sql.is_empty() => {
                Self::constraint_violation(message, code, statement)
            }
            other => other,
        }
    }
}

/// Native code for a database-level error.
///
/// MySQL reports a numeric error number alongside the SQLSTATE; the number is
/// what the server documentation refers to (1305, 1049, ...), so it wins.
fn engine_code(db_err: &dyn sqlx::error::DatabaseError) -> Option<String> {
    if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        return Some(mysql.number().to_string());
    }
    db_err.code().map(|c| c.to_string())
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection_failed(
                msg.to_string(),
                "Check the connection options and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = engine_code(db_err.as_ref());
                let constraint = matches!(
                    db_err.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                );
                if constraint {
                    DbError::constraint_violation(db_err.message(), code, "")
                } else {
                    DbError::query_failed(db_err.message(), code, "")
                }
            }
            sqlx::Error::RowNotFound => DbError::query_failed("No rows returned", None, ""),
            sqlx::Error::PoolTimedOut => {
                DbError::connection_failed("Timed out acquiring a connection", "Retry later")
            }
            sqlx::Error::PoolClosed => {
                DbError::connection_failed("Connection is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection_failed(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection_failed(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection_failed(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query_failed(format!("Column not found: {}", col), None, "")
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection_failed("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection_failed("refused", "Check the server");
        assert_eq!(err.suggestion(), Some("Check the server"));
        assert_eq!(DbError::internal("x").suggestion(), None);
    }

    #[test]
    fn test_constraint_violation_is_query_failure() {
        let err = DbError::constraint_violation("Duplicate entry", Some("1062".into()), "INSERT");
        assert!(err.is_query_failure());
        assert!(err.is_constraint_violation());

        let err = DbError::query_failed("syntax", Some("1064".into()), "SELEC");
        assert!(err.is_query_failure());
        assert!(!err.is_constraint_violation());
    }

    #[test]
    fn test_engine_code_exposed() {
        let err = DbError::query_failed("SAVEPOINT x does not exist", Some("1305".into()), "");
        assert_eq!(err.engine_code(), Some("1305"));
        assert_eq!(DbError::no_active_transaction("none").engine_code(), None);
    }

    #[test]
    fn test_with_sql_fills_missing_statement() {
        let err = DbError::query_failed("boom", None, "").with_sql("SELECT 1");
        match err {
            DbError::QueryFailed { sql, .. } => assert_eq!(sql, "SELECT 1"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = DbError::query_failed("boom", None, "SELECT 2").with_sql("SELECT 1");
        match err {
            DbError::QueryFailed { sql, .. } => assert_eq!(sql, "SELECT 2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_row_not_found_maps_to_query_failure() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(err.is_query_failure());
    }
}
