//! MySQL and MariaDB.

use super::{AfterCreate, DialectAdapter, checked_database_name, network_descriptor};
use crate::config::{ConnectionOptions, EXTENDED_CHARSET, SQL_MODE_INIT_KEY};
use crate::db::engine::Engine;
use crate::db::quote::{IdentifierQuoter, strip_alias_chars};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ReturnMode};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// Strict mode applied to every session unless the `sql_mode` init command
/// is overridden.
pub const DEFAULT_SQL_MODE: &str = "SET sql_mode = 'ANSI,STRICT_TRANS_TABLES,STRICT_ALL_TABLES,NO_ZERO_IN_DATE,NO_ZERO_DATE,ERROR_FOR_DIVISION_BY_ZERO'";

/// ER_SP_DOES_NOT_EXIST, raised for a savepoint the server no longer has.
const SAVEPOINT_DOES_NOT_EXIST: &str = "1305";

/// ER_BAD_DB_ERROR
const UNKNOWN_DATABASE: &str = "1049";

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

#[async_trait]
impl DialectAdapter for MySqlDialect {
    fn kind(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn driver(&self) -> &'static str {
        "mysql"
    }

    fn quoter(&self) -> IdentifierQuoter {
        IdentifierQuoter::BACKTICK
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn descriptor(&self, options: &ConnectionOptions) -> DbResult<Url> {
        let mut extra = vec![("charset", options.charset_or_default())];
        if let Some(socket) = options.unix_socket.as_deref() {
            extra.push(("socket", socket));
        }
        if let Some(collation) = options.collation.as_deref() {
            extra.push(("collation", collation));
        }
        network_descriptor(options, &extra)
    }

    fn init_statements(&self, options: &ConnectionOptions) -> Vec<String> {
        let charset = strip_alias_chars(options.charset_or_default());
        let set_names = match options.collation.as_deref().map(strip_alias_chars) {
            Some(collation) if !collation.is_empty() => {
                format!("SET NAMES {charset} COLLATE {collation}")
            }
            _ => format!("SET NAMES {charset}"),
        };

        let mut commands =
            BTreeMap::from([(SQL_MODE_INIT_KEY.to_string(), DEFAULT_SQL_MODE.to_string())]);
        commands.extend(options.init_commands.clone());

        std::iter::once(set_names)
            .chain(commands.into_values().filter(|sql| !sql.trim().is_empty()))
            .collect()
    }

    fn database_not_found_codes(&self) -> &'static [&'static str] {
        &[UNKNOWN_DATABASE]
    }

    fn maintenance_database(&self) -> Option<&'static str> {
        None
    }

    fn range_clause(&self, from: u64, count: u64) -> String {
        format!("LIMIT {from}, {count}")
    }

    fn temporary_table_sql(&self, table: &str, query: &str) -> String {
        format!("CREATE TEMPORARY TABLE {table} ENGINE=MEMORY {query}")
    }

    async fn create_database(
        &self,
        engine: &mut dyn Engine,
        name: &str,
    ) -> DbResult<AfterCreate> {
        let quoted = self.quote_identifier(checked_database_name(name)?);
        let not_found = |e: DbError| DbError::database_not_found(name, e.to_string());

        engine
            .run(
                &format!("CREATE DATABASE IF NOT EXISTS {quoted}"),
                &[],
                ReturnMode::Nothing,
            )
            .await
            .map_err(not_found)?;
        engine
            .run(&format!("USE {quoted}"), &[], ReturnMode::Nothing)
            .await
            .map_err(not_found)?;
        Ok(AfterCreate::Active)
    }

    fn extended_charset_active(&self, options: &ConnectionOptions) -> bool {
        options.charset_or_default() == EXTENDED_CHARSET
    }

    fn extended_charset_configurable(&self) -> bool {
        true
    }

    async fn probe_extended_charset(&self, engine: &mut dyn Engine, test_table: &str) -> bool {
        let client = engine.client_library();
        if !client.supports_extended_charset() {
            debug!(client = %client, "Client library too old for utf8mb4");
            return false;
        }

        let create = format!(
            "CREATE TABLE {test_table} (id VARCHAR(255), PRIMARY KEY(id(255))) \
             CHARACTER SET utf8mb4 COLLATE utf8mb4_general_ci ROW_FORMAT=DYNAMIC ENGINE=INNODB"
        );
        let drop = format!("DROP TABLE {test_table}");
        for sql in [create, drop] {
            if let Err(e) = engine.run(&sql, &[], ReturnMode::Nothing).await {
                debug!(error = %e, "Server rejected utf8mb4 test table");
                return false;
            }
        }
        true
    }

    fn begin_sql(&self) -> &'static str {
        "START TRANSACTION"
    }

    fn is_missing_savepoint(&self, err: &DbError) -> bool {
        err.engine_code() == Some(SAVEPOINT_DOES_NOT_EXIST)
    }

    fn implicitly_commits(&self, sql: &str) -> bool {
        let mut words = sql.split_whitespace().map(str::to_ascii_uppercase);
        let first = words.next().unwrap_or_default();
        let second = words.next().unwrap_or_default();
        matches!(
            first.as_str(),
            "CREATE" | "ALTER" | "DROP" | "RENAME" | "TRUNCATE"
        ) && second != "TEMPORARY"
    }

    fn sequence_table_sql(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             value INT UNSIGNED NOT NULL AUTO_INCREMENT, PRIMARY KEY (value)\
             ) ENGINE=InnoDB"
        )
    }

    fn sequence_insert_sql(&self, table: &str) -> String {
        format!("INSERT INTO {table} () VALUES ()")
    }

    fn sequence_floor_sql(&self, table: &str) -> String {
        format!("INSERT INTO {table} (value) VALUES (?) ON DUPLICATE KEY UPDATE value = value")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_prefers_socket() {
        let options = ConnectionOptions::new(DatabaseType::MySQL)
            .with_host("db")
            .with_port(3307)
            .with_unix_socket("/run/mysqld/mysqld.sock")
            .with_database("app");
        let url = MySqlDialect.descriptor(&options).unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), None);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("socket".into(), "/run/mysqld/mysqld.sock".into())));
    }

    #[test]
    fn test_descriptor_defaults_port_and_carries_charset() {
        let options = ConnectionOptions::new(DatabaseType::MySQL)
            .with_host("db")
            .with_credentials("root", "p@ss")
            .with_database("app")
            .with_charset("utf8mb4")
            .with_driver_option("ssl-mode", "disabled");
        let url = MySqlDialect.descriptor(&options).unwrap();
        assert_eq!(url.scheme(), "mysql");
        assert_eq!(url.host_str(), Some("db"));
        assert_eq!(url.port(), Some(3306));
        assert_eq!(url.username(), "root");
        assert_eq!(url.path(), "/app");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("charset".into(), "utf8mb4".into()));
        assert!(pairs.contains(&("ssl-mode".into(), "disabled".into())));
    }

    #[test]
    fn test_init_statements_default_sql_mode() {
        let options = ConnectionOptions::new(DatabaseType::MySQL);
        let stmts = MySqlDialect.init_statements(&options);
        assert_eq!(stmts, vec!["SET NAMES utf8".to_string(), DEFAULT_SQL_MODE.to_string()]);
    }

    #[test]
    fn test_init_statements_collation_and_override() {
        let options = ConnectionOptions::new(DatabaseType::MySQL)
            .with_charset("utf8mb4")
            .with_collation("utf8mb4_general_ci")
            .with_init_command(SQL_MODE_INIT_KEY, "SET sql_mode = 'ANSI'")
            .with_init_command("isolation", "SET SESSION tx_isolation='READ-COMMITTED'");
        let stmts = MySqlDialect.init_statements(&options);
        assert_eq!(stmts[0], "SET NAMES utf8mb4 COLLATE utf8mb4_general_ci");
        assert!(stmts.contains(&"SET sql_mode = 'ANSI'".to_string()));
        assert!(!stmts.contains(&DEFAULT_SQL_MODE.to_string()));
        assert_eq!(stmts.len(), 3);
    }

    #[test]
    fn test_extended_charset_active_from_options() {
        let options = ConnectionOptions::new(DatabaseType::MySQL)
            .with_host("db")
            .with_charset("utf8mb4");
        assert!(MySqlDialect.extended_charset_active(&options));
        let options = ConnectionOptions::new(DatabaseType::MySQL);
        assert!(!MySqlDialect.extended_charset_active(&options));
    }

    #[test]
    fn test_missing_savepoint_code() {
        let err = DbError::query_failed("SAVEPOINT s does not exist", Some("1305".into()), "");
        assert!(MySqlDialect.is_missing_savepoint(&err));
        let err = DbError::query_failed("Lock wait timeout", Some("1205".into()), "");
        assert!(!MySqlDialect.is_missing_savepoint(&err));
    }

    #[test]
    fn test_implicit_commit_statements() {
        assert!(MySqlDialect.implicitly_commits("CREATE TABLE t (id INT)"));
        assert!(MySqlDialect.implicitly_commits("drop table t"));
        assert!(!MySqlDialect.implicitly_commits("CREATE TEMPORARY TABLE t SELECT 1"));
        assert!(!MySqlDialect.implicitly_commits("INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn test_sequence_sql() {
        assert_eq!(
            MySqlDialect.sequence_insert_sql("`sequences`"),
            "INSERT INTO `sequences` () VALUES ()"
        );
        assert!(
            MySqlDialect
                .sequence_floor_sql("`sequences`")
                .ends_with("ON DUPLICATE KEY UPDATE value = value")
        );
        assert_eq!(MySqlDialect.placeholder(3), "?");
    }
}
