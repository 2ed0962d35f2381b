//! PostgreSQL.

use super::{AfterCreate, DialectAdapter, checked_database_name, network_descriptor};
use crate::config::ConnectionOptions;
use crate::db::engine::Engine;
use crate::db::quote::IdentifierQuoter;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, ReturnMode};
use async_trait::async_trait;
use url::Url;

/// invalid_savepoint_specification
const SAVEPOINT_DOES_NOT_EXIST: &str = "3B001";

/// invalid_catalog_name
const UNKNOWN_DATABASE: &str = "3D000";

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

#[async_trait]
impl DialectAdapter for PostgresDialect {
    fn kind(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn driver(&self) -> &'static str {
        "pgsql"
    }

    fn quoter(&self) -> IdentifierQuoter {
        IdentifierQuoter::ANSI
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn descriptor(&self, options: &ConnectionOptions) -> DbResult<Url> {
        // libpq-style: a socket is given as the directory in `host`
        let mut extra = Vec::new();
        if let Some(socket) = options.unix_socket.as_deref() {
            extra.push(("host", socket));
        }
        network_descriptor(options, &extra)
    }

    fn init_statements(&self, options: &ConnectionOptions) -> Vec<String> {
        std::iter::once("SET NAMES 'UTF8'".to_string())
            .chain(
                options
                    .init_commands
                    .values()
                    .filter(|sql| !sql.trim().is_empty())
                    .cloned(),
            )
            .collect()
    }

    fn database_not_found_codes(&self) -> &'static [&'static str] {
        &[UNKNOWN_DATABASE]
    }

    fn maintenance_database(&self) -> Option<&'static str> {
        Some("postgres")
    }

    async fn create_database(
        &self,
        engine: &mut dyn Engine,
        name: &str,
    ) -> DbResult<AfterCreate> {
        let checked = checked_database_name(name)?;
        let not_found = |e: DbError| DbError::database_not_found(name, e.to_string());

        let existing = engine
            .run(
                "SELECT 1 FROM pg_database WHERE datname = $1",
                &[QueryParam::from(checked)],
                ReturnMode::Rows,
            )
            .await
            .map_err(not_found)?
            .into_rows();

        if existing.is_empty() {
            engine
                .run(
                    &format!("CREATE DATABASE {}", self.quote_identifier(checked)),
                    &[],
                    ReturnMode::Nothing,
                )
                .await
                .map_err(not_found)?;
        }
        Ok(AfterCreate::Reconnect)
    }

    fn is_missing_savepoint(&self, err: &DbError) -> bool {
        err.engine_code() == Some(SAVEPOINT_DOES_NOT_EXIST)
    }

    fn sequence_table_sql(&self, table: &str) -> String {
        format!("CREATE TABLE IF NOT EXISTS {table} (value BIGSERIAL PRIMARY KEY)")
    }

    fn sequence_insert_sql(&self, table: &str) -> String {
        format!("INSERT INTO {table} DEFAULT VALUES RETURNING value")
    }

    fn sequence_floor_sql(&self, table: &str) -> String {
        let sequence = format!("pg_get_serial_sequence('{}', 'value')", table.replace('\'', "''"));
        format!("SELECT setval({sequence}, GREATEST($1, nextval({sequence})))")
    }
}
