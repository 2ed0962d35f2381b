//! The client-facing connection.
//!
//! A [`Connection`] owns one engine handle and the dialect chosen for it.
//! Statements go through [`Connection::execute`]; SQL generation, error
//! classification and transaction bookkeeping are delegated to the dialect,
//! the [`TransactionManager`] and the [`SequenceGenerator`].
//!
//! Cleanup is explicit: call [`Connection::close`] when done. A connection
//! dropped with pending sequence cleanup logs a warning.

use crate::config::ConnectionOptions;
use crate::db::dialect::{
    AfterCreate, DialectAdapter, EXTENDED_CHARSET_TEST_TABLE, adapter_for,
};
use crate::db::engine::{Engine, SqlxEngine};
use crate::db::sequence::{SEQUENCE_TABLE, SequenceGenerator};
use crate::db::transaction::{TransactionLayer, TransactionManager};
use crate::error::{DbError, DbResult};
use crate::models::{
    Capabilities, ConnectionInfo, DatabaseType, QueryOptions, QueryOutput, QueryParam, ReturnMode,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Prefix of generated temporary table names.
const TEMPORARY_TABLE_PREFIX: &str = "db_temporary_";

/// One live database connection.
pub struct Connection {
    engine: Option<Box<dyn Engine>>,
    dialect: Box<dyn DialectAdapter>,
    options: ConnectionOptions,
    capabilities: Capabilities,
    transactions: TransactionManager,
    sequence: SequenceGenerator,
    /// Probed on first request, then reused.
    extended_charset: Option<bool>,
    temporary_tables: u32,
    connected_at: DateTime<Utc>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.dialect.driver())
            .field("database", &self.options.database)
            .field("capabilities", &self.capabilities)
            .field("transaction_depth", &self.transactions.depth())
            .field("closed", &self.engine.is_none())
            .finish_non_exhaustive()
    }
}

/// The engine handle, unless the connection was closed.
fn live(engine: &mut Option<Box<dyn Engine>>) -> DbResult<&mut dyn Engine> {
    match engine {
        Some(engine) => Ok(&mut **engine),
        None => Err(DbError::connection_failed(
            "Connection is closed",
            "Open a new connection",
        )),
    }
}

impl Connection {
    /// Open a connection with the dialect matching `options.driver`.
    pub async fn open(options: ConnectionOptions) -> DbResult<Self> {
        let dialect = adapter_for(options.driver);
        let descriptor = dialect.descriptor(&options)?;

        info!(
            driver = dialect.driver(),
            database = ?options.database,
            "Connecting to database"
        );

        let engine = SqlxEngine::connect(options.driver, &descriptor)
            .await
            .map_err(|e| dialect.classify_connect_error(e, &options))?;

        Self::with_engine(options, Box::new(engine)).await
    }

    /// Open a connection, creating the configured database first when the
    /// engine reports that it does not exist.
    pub async fn open_or_create(options: ConnectionOptions) -> DbResult<Self> {
        let database = match Self::open(options.clone()).await {
            Err(DbError::DatabaseNotFound { database, .. }) if !database.is_empty() => database,
            other => return other,
        };

        info!(database = %database, "Database missing, creating it");
        let dialect = adapter_for(options.driver);
        let mut bootstrap = options;
        bootstrap.database = dialect.maintenance_database().map(String::from);

        let mut connection = Self::open(bootstrap).await?;
        connection.create_database(&database).await?;
        Ok(connection)
    }

    /// Wrap an already open engine handle and run the init statements.
    pub async fn with_engine(
        options: ConnectionOptions,
        engine: Box<dyn Engine>,
    ) -> DbResult<Self> {
        if engine.database_type() != options.driver {
            return Err(DbError::invalid_input(format!(
                "Engine is {} but the options are for {}",
                engine.database_type(),
                options.driver
            )));
        }

        let dialect = adapter_for(options.driver);
        let capabilities = Capabilities {
            transactional_ddl: dialect.supports_transactional_ddl(),
            transactions: dialect.supports_transactions() && options.transactions,
        };
        let sequence_table = escaped_table(dialect.as_ref(), &options, SEQUENCE_TABLE);

        let mut connection = Self {
            engine: Some(engine),
            dialect,
            capabilities,
            transactions: TransactionManager::new(capabilities.transactions),
            sequence: SequenceGenerator::new(sequence_table),
            extended_charset: None,
            temporary_tables: 0,
            connected_at: Utc::now(),
            options,
        };
        connection.initialize().await?;

        info!(
            driver = connection.dialect.driver(),
            database = ?connection.options.database,
            transactions = capabilities.transactions,
            "Connected"
        );
        Ok(connection)
    }

    async fn initialize(&mut self) -> DbResult<()> {
        let statements = self.dialect.init_statements(&self.options);
        let engine = live(&mut self.engine)?;
        for sql in &statements {
            engine.run(sql, &[], ReturnMode::Nothing).await?;
        }
        debug!(count = statements.len(), "Init statements applied");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Identity and capabilities
    // -------------------------------------------------------------------------

    pub fn dialect(&self) -> &dyn DialectAdapter {
        self.dialect.as_ref()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn kind(&self) -> DatabaseType {
        self.dialect.kind()
    }

    /// `mysql`, `pgsql` or `sqlite`.
    pub fn driver(&self) -> &'static str {
        self.dialect.driver()
    }

    pub fn database_type(&self) -> &'static str {
        self.dialect.database_type()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn supports_transactions(&self) -> bool {
        self.capabilities.transactions
    }

    pub fn supports_transactional_ddl(&self) -> bool {
        self.capabilities.transactional_ddl
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_none()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            driver: self.dialect.driver(),
            database_type: self.dialect.kind(),
            database: self.options.database.clone(),
            charset: self.options.charset_or_default().to_string(),
            capabilities: self.capabilities,
            connected_at: self.connected_at,
        }
    }

    // -------------------------------------------------------------------------
    // Identifiers
    // -------------------------------------------------------------------------

    pub fn quote_identifier(&self, identifier: &str) -> String {
        self.dialect.quote_identifier(identifier)
    }

    pub fn escape_table(&self, name: &str) -> String {
        self.dialect.escape_table(name)
    }

    pub fn escape_field(&self, name: &str) -> String {
        self.dialect.escape_field(name)
    }

    pub fn escape_alias(&self, name: &str) -> String {
        self.dialect.escape_alias(name)
    }

    /// Prefixed and quoted name of `table`.
    pub fn table_name(&self, table: &str) -> String {
        escaped_table(self.dialect.as_ref(), &self.options, table)
    }

    /// Replace every `{table}` placeholder with the prefixed, quoted name.
    ///
    /// Braces around anything other than a bare identifier are left alone,
    /// so JSON or string literals pass through untouched.
    pub fn prefix_tables(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len() + 16);
        let mut rest = sql;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close)
                    if close > 0
                        && after[..close]
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
                {
                    out.push_str(&self.table_name(&after[..close]));
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    // -------------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------------

    /// Run one statement; the result shape follows `options.return_mode`.
    pub async fn execute(
        &mut self,
        query: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> DbResult<QueryOutput> {
        let sql = self.prefix_tables(query);
        if self.transactions.in_transaction() && self.dialect.implicitly_commits(&sql) {
            warn!(
                sql = %sql,
                depth = self.transactions.depth(),
                "Statement implicitly commits the open transaction"
            );
        }
        let engine = live(&mut self.engine)?;
        engine.run(&sql, params, options.return_mode).await
    }

    /// Run `query` restricted to `count` rows starting at row `from`.
    pub async fn query_range(
        &mut self,
        query: &str,
        from: u64,
        count: u64,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> DbResult<QueryOutput> {
        let ranged = format!("{query} {}", self.dialect.range_clause(from, count));
        self.execute(&ranged, params, options).await
    }

    /// Materialize `query` into a fresh temporary table and return the
    /// table's unprefixed name, for use as `{name}` in later statements.
    pub async fn query_temporary(
        &mut self,
        query: &str,
        params: &[QueryParam],
    ) -> DbResult<String> {
        let name = format!("{TEMPORARY_TABLE_PREFIX}{}", self.temporary_tables);
        self.temporary_tables += 1;

        let sql = self
            .dialect
            .temporary_table_sql(&self.table_name(&name), query);
        self.execute(&sql, params, QueryOptions::nothing()).await?;
        Ok(name)
    }

    /// Create database `name` and point this connection at it.
    pub async fn create_database(&mut self, name: &str) -> DbResult<()> {
        let engine = live(&mut self.engine)?;
        match self.dialect.create_database(engine, name).await? {
            AfterCreate::Active => {
                self.options.database = Some(name.to_string());
            }
            AfterCreate::Reconnect => {
                let mut options = self.options.clone();
                options.database = Some(name.to_string());
                let descriptor = self.dialect.descriptor(&options)?;
                engine
                    .reconnect(&descriptor)
                    .await
                    .map_err(|e| DbError::database_not_found(name, e.to_string()))?;
                self.options = options;
                self.transactions = TransactionManager::new(self.capabilities.transactions);
                self.initialize().await?;
            }
        }
        info!(database = %name, "Database created");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    pub fn in_transaction(&self) -> bool {
        self.transactions.in_transaction()
    }

    pub fn transaction_depth(&self) -> usize {
        self.transactions.depth()
    }

    pub fn transaction_layers(&self) -> &[TransactionLayer] {
        self.transactions.layers()
    }

    /// Open a layer named `name`, or a generated name when `None`.
    /// Returns the layer's name.
    pub async fn start_transaction(&mut self, name: Option<&str>) -> DbResult<String> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.transactions.next_name(),
        };
        self.push_transaction(&name).await?;
        Ok(name)
    }

    pub async fn push_transaction(&mut self, name: &str) -> DbResult<()> {
        let engine = live(&mut self.engine)?;
        self.transactions
            .push(engine, self.dialect.as_ref(), name)
            .await
    }

    /// Release the layer `name`; commits once the outermost layer goes.
    pub async fn pop_transaction(&mut self, name: &str) -> DbResult<()> {
        let engine = live(&mut self.engine)?;
        self.transactions
            .pop(engine, self.dialect.as_ref(), name)
            .await
    }

    /// Release the innermost active layer.
    pub async fn pop(&mut self) -> DbResult<()> {
        let engine = live(&mut self.engine)?;
        self.transactions
            .pop_innermost(engine, self.dialect.as_ref())
            .await
    }

    pub async fn rollback(&mut self, name: &str) -> DbResult<()> {
        let engine = live(&mut self.engine)?;
        self.transactions
            .rollback(engine, self.dialect.as_ref(), name)
            .await
    }

    // -------------------------------------------------------------------------
    // Sequences
    // -------------------------------------------------------------------------

    /// Create the sequence table when missing.
    pub async fn ensure_sequence_table(&mut self) -> DbResult<()> {
        let engine = live(&mut self.engine)?;
        self.sequence
            .ensure_table(engine, self.dialect.as_ref())
            .await
    }

    /// Mint a unique id strictly greater than `existing_floor`.
    pub async fn next_id(&mut self, existing_floor: i64) -> DbResult<i64> {
        let engine = live(&mut self.engine)?;
        self.sequence
            .next_id(engine, self.dialect.as_ref(), existing_floor)
            .await
    }

    pub fn needs_sequence_cleanup(&self) -> bool {
        self.sequence.needs_cleanup()
    }

    /// Delete surplus sequence rows now instead of at close.
    pub async fn cleanup_sequences(&mut self) {
        if let Some(engine) = self.engine.as_deref_mut() {
            self.sequence.cleanup(engine, self.dialect.as_ref()).await;
        }
    }

    // -------------------------------------------------------------------------
    // Extended charset
    // -------------------------------------------------------------------------

    /// Whether the configured charset is 4-byte UTF-8. Never queries.
    pub fn utf8mb4_is_active(&self) -> bool {
        self.dialect.extended_charset_active(&self.options)
    }

    pub fn utf8mb4_is_configurable(&self) -> bool {
        self.dialect.extended_charset_configurable()
    }

    /// Whether client and server support 4-byte UTF-8. Probed once.
    pub async fn utf8mb4_is_supported(&mut self) -> bool {
        if let Some(supported) = self.extended_charset {
            return supported;
        }
        let test_table = self.table_name(EXTENDED_CHARSET_TEST_TABLE);
        let Some(engine) = self.engine.as_deref_mut() else {
            return false;
        };
        let supported = self
            .dialect
            .probe_extended_charset(engine, &test_table)
            .await;
        debug!(supported = supported, "Extended charset probed");
        self.extended_charset = Some(supported);
        supported
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Run pending sequence cleanup, then close the engine handle.
    pub async fn close(mut self) -> DbResult<()> {
        if self.sequence.needs_cleanup() {
            self.cleanup_sequences().await;
        }
        if let Some(engine) = self.engine.take() {
            engine.close().await?;
        }
        info!(driver = self.dialect.driver(), "Connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.engine.is_some() && self.sequence.needs_cleanup() {
            warn!(
                driver = self.dialect.driver(),
                database = ?self.options.database,
                "Connection dropped without close(); sequence cleanup skipped"
            );
        }
    }
}

fn escaped_table(
    dialect: &dyn DialectAdapter,
    options: &ConnectionOptions,
    table: &str,
) -> String {
    dialect.escape_table(&format!("{}{}", options.prefix.for_table(table), table))
}
