//! Shared helpers for integration tests.
//!
//! `ScriptedEngine` stands in for a live server: it records every statement,
//! fails statements on request, answers canned row sets, and keeps a small
//! in-memory sequence table that several engines can share.

#![allow(dead_code)]

use async_trait::async_trait;
use portable_db::db::{ClientLibrary, Engine, TransactionTracker};
use portable_db::error::{DbError, DbResult};
use portable_db::models::{DatabaseType, QueryOutput, QueryParam, ReturnMode, Row};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use url::Url;

struct Failure {
    prefix: String,
    message: String,
    code: Option<String>,
    remaining: usize,
}

struct Response {
    prefix: String,
    rows: Vec<Row>,
}

#[derive(Default)]
struct ScriptState {
    statements: Vec<String>,
    failures: Vec<Failure>,
    responses: Vec<Response>,
    /// Prefixes answered with no output whatever the requested mode.
    silent: Vec<String>,
    reconnects: Vec<String>,
    closed: bool,
}

/// Test-side handle onto what a [`ScriptedEngine`] saw.
#[derive(Clone, Default)]
pub struct Script(Arc<Mutex<ScriptState>>);

impl Script {
    /// Every statement run so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.0.lock().unwrap().statements.clone()
    }

    /// Statements run since the first `skip` ones.
    pub fn statements_after(&self, skip: usize) -> Vec<String> {
        self.statements().into_iter().skip(skip).collect()
    }

    /// How many statements equal `sql` exactly.
    pub fn count(&self, sql: &str) -> usize {
        self.statements().iter().filter(|s| s.as_str() == sql).count()
    }

    /// How many statements start with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().statements.clear();
    }

    /// Fail the next statement starting with `prefix` with an engine error.
    pub fn fail_once(&self, prefix: &str, code: Option<&str>, message: &str) {
        self.fail_times(prefix, code, message, 1);
    }

    pub fn fail_times(&self, prefix: &str, code: Option<&str>, message: &str, times: usize) {
        self.0.lock().unwrap().failures.push(Failure {
            prefix: prefix.to_string(),
            message: message.to_string(),
            code: code.map(String::from),
            remaining: times,
        });
    }

    /// Answer statements starting with `prefix` with `rows`.
    pub fn respond(&self, prefix: &str, rows: Vec<Row>) {
        self.0.lock().unwrap().responses.push(Response {
            prefix: prefix.to_string(),
            rows,
        });
    }

    /// Answer statements starting with `prefix` with no output at all, the
    /// way an insert without a generated key reports nothing.
    pub fn return_nothing(&self, prefix: &str) {
        self.0.lock().unwrap().silent.push(prefix.to_string());
    }

    pub fn reconnects(&self) -> Vec<String> {
        self.0.lock().unwrap().reconnects.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

/// An auto-increment table shared by every engine attached to it, the way
/// connections share one server.
#[derive(Default)]
struct SequenceState {
    counter: i64,
    rows: BTreeSet<i64>,
}

#[derive(Clone, Default)]
pub struct SharedSequence(Arc<Mutex<SequenceState>>);

impl SharedSequence {
    /// Start the counter at `value`, as if that many ids were minted.
    pub fn starting_at(value: i64) -> Self {
        let seq = Self::default();
        {
            let mut state = seq.0.lock().unwrap();
            state.counter = value;
            state.rows.insert(value);
        }
        seq
    }

    pub fn rows(&self) -> Vec<i64> {
        self.0.lock().unwrap().rows.iter().copied().collect()
    }

    pub fn counter(&self) -> i64 {
        self.0.lock().unwrap().counter
    }
}

pub struct ScriptedEngine {
    database_type: DatabaseType,
    script: Script,
    sequence: SharedSequence,
    tracker: TransactionTracker,
    client: ClientLibrary,
}

impl ScriptedEngine {
    pub fn new(database_type: DatabaseType) -> (Box<Self>, Script) {
        Self::with_sequence(database_type, SharedSequence::default())
    }

    pub fn with_sequence(
        database_type: DatabaseType,
        sequence: SharedSequence,
    ) -> (Box<Self>, Script) {
        let script = Script::default();
        let engine = Box::new(Self {
            database_type,
            script: script.clone(),
            sequence,
            tracker: TransactionTracker::for_engine(database_type),
            client: ClientLibrary::Native("scripted"),
        });
        (engine, script)
    }

    pub fn with_client(mut self: Box<Self>, client: ClientLibrary) -> Box<Self> {
        self.client = client;
        self
    }

    fn scripted_failure(&self, sql: &str) -> Option<DbError> {
        let mut state = self.script.0.lock().unwrap();
        let failure = state
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.starts_with(&f.prefix))?;
        failure.remaining -= 1;
        Some(DbError::query_failed(
            failure.message.clone(),
            failure.code.clone(),
            sql,
        ))
    }

    fn scripted_rows(&self, sql: &str) -> Option<Vec<Row>> {
        let state = self.script.0.lock().unwrap();
        state
            .responses
            .iter()
            .find(|r| sql.starts_with(&r.prefix))
            .map(|r| r.rows.clone())
    }

    /// Sequence table statements, answered from the shared state.
    fn sequence_statement(&self, sql: &str, params: &[QueryParam]) -> Option<QueryOutput> {
        if !sql.contains("sequences") {
            return None;
        }
        let floor = match params.first() {
            Some(QueryParam::Int(v)) => Some(*v),
            _ => None,
        };
        let mut seq = self.sequence.0.lock().unwrap();

        if sql.contains("() VALUES ()") || sql.contains("DEFAULT VALUES") {
            seq.counter += 1;
            let id = seq.counter;
            seq.rows.insert(id);
            return Some(QueryOutput::InsertId(id));
        }
        if sql.contains("ON DUPLICATE KEY") || sql.contains("ON CONFLICT") {
            let floor = floor.unwrap_or_default();
            seq.rows.insert(floor);
            seq.counter = seq.counter.max(floor);
            return Some(QueryOutput::Nothing);
        }
        if sql.starts_with("SELECT setval(") {
            let next = seq.counter + 1;
            seq.counter = next.max(floor.unwrap_or_default());
            return Some(QueryOutput::Nothing);
        }
        if sql.starts_with("SELECT MAX(value)") {
            let mut row = Row::new();
            let max = seq.rows.iter().next_back().copied();
            row.insert(
                "MAX(value)".into(),
                max.map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null),
            );
            return Some(QueryOutput::Rows(vec![row]));
        }
        if sql.starts_with("DELETE FROM") {
            let below = floor.unwrap_or_default();
            seq.rows.retain(|v| *v >= below);
            return Some(QueryOutput::Nothing);
        }
        None
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn run(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        mode: ReturnMode,
    ) -> DbResult<QueryOutput> {
        self.script.0.lock().unwrap().statements.push(sql.to_string());

        if let Some(err) = self.scripted_failure(sql) {
            return Err(err);
        }
        self.tracker.observe(sql);

        let silent = {
            let state = self.script.0.lock().unwrap();
            state.silent.iter().any(|p| sql.starts_with(p))
        };
        if silent {
            return Ok(QueryOutput::Nothing);
        }

        if let Some(output) = self.sequence_statement(sql, params) {
            return Ok(output);
        }

        Ok(match mode {
            ReturnMode::Rows => QueryOutput::Rows(self.scripted_rows(sql).unwrap_or_default()),
            ReturnMode::InsertId => QueryOutput::InsertId(0),
            ReturnMode::AffectedRows => QueryOutput::AffectedRows(0),
            ReturnMode::Nothing => QueryOutput::Nothing,
        })
    }

    fn in_transaction(&self) -> bool {
        self.tracker.is_open()
    }

    fn client_library(&self) -> ClientLibrary {
        self.client.clone()
    }

    async fn reconnect(&mut self, descriptor: &Url) -> DbResult<()> {
        let mut state = self.script.0.lock().unwrap();
        state.reconnects.push(descriptor.path().to_string());
        self.tracker = TransactionTracker::for_engine(self.database_type);
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.script.0.lock().unwrap().closed = true;
        Ok(())
    }
}

/// A connection over a fresh scripted engine, with the init statements
/// already cleared from the script.
pub async fn scripted_connection(
    options: portable_db::ConnectionOptions,
) -> (portable_db::Connection, Script) {
    let (engine, script) = ScriptedEngine::new(options.driver);
    let conn = portable_db::Connection::with_engine(options, engine)
        .await
        .expect("scripted connection");
    script.clear();
    (conn, script)
}

/// A connection to a private in-memory SQLite database.
pub async fn sqlite_memory() -> portable_db::Connection {
    let options = portable_db::ConnectionOptions::new(DatabaseType::SQLite).with_database(":memory:");
    portable_db::Connection::open(options)
        .await
        .expect("in-memory sqlite")
}
