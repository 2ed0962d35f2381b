//! SQLite.

use super::{AfterCreate, DialectAdapter};
use crate::config::ConnectionOptions;
use crate::db::engine::Engine;
use crate::db::quote::IdentifierQuoter;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// In-memory database, also used while the real file is being created.
pub const MEMORY_DATABASE: &str = ":memory:";

/// SQLITE_CANTOPEN
const CANNOT_OPEN: &str = "14";

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

#[async_trait]
impl DialectAdapter for SqliteDialect {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn driver(&self) -> &'static str {
        "sqlite"
    }

    fn quoter(&self) -> IdentifierQuoter {
        IdentifierQuoter::ANSI
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn descriptor(&self, options: &ConnectionOptions) -> DbResult<Url> {
        let path = options
            .database
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(MEMORY_DATABASE);
        let mut url = Url::parse(&format!("sqlite:{path}"))
            .map_err(|e| DbError::invalid_input(format!("Invalid SQLite path '{path}': {e}")))?;
        if !options.driver_options.is_empty() {
            url.query_pairs_mut().extend_pairs(&options.driver_options);
        }
        Ok(url)
    }

    fn init_statements(&self, options: &ConnectionOptions) -> Vec<String> {
        let mut commands = BTreeMap::from([(
            "foreign_keys".to_string(),
            "PRAGMA foreign_keys = ON".to_string(),
        )]);
        commands.extend(options.init_commands.clone());
        commands
            .into_values()
            .filter(|sql| !sql.trim().is_empty())
            .collect()
    }

    fn database_not_found_codes(&self) -> &'static [&'static str] {
        &[CANNOT_OPEN]
    }

    fn maintenance_database(&self) -> Option<&'static str> {
        Some(MEMORY_DATABASE)
    }

    /// The database is a file; creating it means making its directory. The
    /// file itself appears on reconnect.
    async fn create_database(
        &self,
        _engine: &mut dyn Engine,
        name: &str,
    ) -> DbResult<AfterCreate> {
        let parent = Path::new(name)
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = parent {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DbError::database_not_found(name, e.to_string()))?;
        }
        Ok(AfterCreate::Reconnect)
    }

    fn is_missing_savepoint(&self, err: &DbError) -> bool {
        err.is_query_failure() && err.to_string().contains("no such savepoint")
    }

    fn sequence_table_sql(&self, table: &str) -> String {
        format!("CREATE TABLE IF NOT EXISTS {table} (value INTEGER PRIMARY KEY)")
    }

    fn sequence_floor_sql(&self, table: &str) -> String {
        format!("INSERT INTO {table} (value) VALUES (?) ON CONFLICT (value) DO NOTHING")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_paths() {
        let options =
            ConnectionOptions::new(DatabaseType::SQLite).with_database("/var/lib/app/app.sqlite");
        assert_eq!(
            SqliteDialect.descriptor(&options).unwrap().as_str(),
            "sqlite:/var/lib/app/app.sqlite"
        );

        let options = ConnectionOptions::new(DatabaseType::SQLite);
        assert_eq!(
            SqliteDialect.descriptor(&options).unwrap().as_str(),
            "sqlite::memory:"
        );
    }

    #[test]
    fn test_default_init_enables_foreign_keys() {
        let options = ConnectionOptions::new(DatabaseType::SQLite);
        assert_eq!(
            SqliteDialect.init_statements(&options),
            vec!["PRAGMA foreign_keys = ON".to_string()]
        );

        let options = ConnectionOptions::new(DatabaseType::SQLite)
            .with_init_command("foreign_keys", "PRAGMA foreign_keys = OFF");
        assert_eq!(
            SqliteDialect.init_statements(&options),
            vec!["PRAGMA foreign_keys = OFF".to_string()]
        );
    }

    #[test]
    fn test_missing_savepoint_by_message() {
        let err = DbError::query_failed("no such savepoint: savepoint_1", Some("1".into()), "");
        assert!(SqliteDialect.is_missing_savepoint(&err));
        let err = DbError::query_failed("database is locked", Some("5".into()), "");
        assert!(!SqliteDialect.is_missing_savepoint(&err));
    }

    #[test]
    fn test_temporary_table_sql() {
        assert_eq!(
            SqliteDialect.temporary_table_sql("\"db_temporary_0\"", "SELECT 1"),
            "CREATE TEMPORARY TABLE \"db_temporary_0\" AS SELECT 1"
        );
    }
}
