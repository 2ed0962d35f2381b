//! Integration tests for the sequence generator.

mod common;

use common::{ScriptedEngine, SharedSequence, sqlite_memory};
use portable_db::config::{ConnectionOptions, TablePrefix};
use portable_db::error::DbError;
use portable_db::models::{DatabaseType, QueryOptions};
use portable_db::Connection;
use std::collections::HashSet;

async fn attached(database_type: DatabaseType, sequence: &SharedSequence) -> Connection {
    let (engine, _script) = ScriptedEngine::with_sequence(database_type, sequence.clone());
    Connection::with_engine(ConnectionOptions::new(database_type), engine)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_connections_never_share_an_id() {
    let sequence = SharedSequence::default();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let mut conn = attached(DatabaseType::MySQL, &sequence).await;
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..25 {
                ids.push(conn.next_id(0).await.unwrap());
                tokio::task::yield_now().await;
            }
            conn.close().await.unwrap();
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "id {id} handed out twice");
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test]
async fn test_floor_above_counter() {
    for database_type in [
        DatabaseType::MySQL,
        DatabaseType::PostgreSQL,
        DatabaseType::SQLite,
    ] {
        let sequence = SharedSequence::starting_at(50);
        let mut conn = attached(database_type, &sequence).await;

        let id = conn.next_id(100).await.unwrap();
        assert!(id > 100, "{database_type}: got {id}");

        // The counter stays raised for later callers
        let next = conn.next_id(0).await.unwrap();
        assert!(next > id, "{database_type}: got {next} after {id}");
        conn.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_floor_below_counter_takes_one_insert() {
    let sequence = SharedSequence::starting_at(50);
    let (engine, script) = ScriptedEngine::with_sequence(DatabaseType::MySQL, sequence.clone());
    let mut conn = Connection::with_engine(ConnectionOptions::new(DatabaseType::MySQL), engine)
        .await
        .unwrap();
    script.clear();

    assert_eq!(conn.next_id(10).await.unwrap(), 51);
    assert_eq!(script.statements(), vec!["INSERT INTO `sequences` () VALUES ()"]);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_postgres_reads_id_from_returning_row() {
    let sequence = SharedSequence::default();
    let (engine, script) = ScriptedEngine::with_sequence(DatabaseType::PostgreSQL, sequence);
    let mut conn =
        Connection::with_engine(ConnectionOptions::new(DatabaseType::PostgreSQL), engine)
            .await
            .unwrap();
    script.clear();

    assert_eq!(conn.next_id(0).await.unwrap(), 1);
    assert_eq!(
        script.statements(),
        vec!["INSERT INTO \"sequences\" DEFAULT VALUES RETURNING value"]
    );
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_insert_without_id_is_an_error() {
    let sequence = SharedSequence::default();
    let (engine, script) = ScriptedEngine::with_sequence(DatabaseType::PostgreSQL, sequence.clone());
    let mut conn =
        Connection::with_engine(ConnectionOptions::new(DatabaseType::PostgreSQL), engine)
            .await
            .unwrap();

    script.return_nothing("INSERT INTO");
    let err = conn.next_id(0).await.unwrap_err();
    assert!(matches!(err, DbError::Internal { .. }), "{err}");
    assert!(!conn.needs_sequence_cleanup());
    assert!(sequence.rows().is_empty());

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_close_keeps_only_the_highest_row() {
    let sequence = SharedSequence::default();
    let mut conn = attached(DatabaseType::PostgreSQL, &sequence).await;

    for _ in 0..5 {
        conn.next_id(0).await.unwrap();
    }
    assert!(conn.needs_sequence_cleanup());
    assert_eq!(sequence.rows().len(), 5);

    conn.close().await.unwrap();
    assert_eq!(sequence.rows(), vec![5]);
}

#[tokio::test]
async fn test_cleanup_failure_is_swallowed() {
    let sequence = SharedSequence::default();
    let (engine, script) = ScriptedEngine::with_sequence(DatabaseType::MySQL, sequence.clone());
    let mut conn = Connection::with_engine(ConnectionOptions::new(DatabaseType::MySQL), engine)
        .await
        .unwrap();

    conn.next_id(0).await.unwrap();
    conn.next_id(0).await.unwrap();
    script.fail_once("DELETE FROM", Some("1205"), "Lock wait timeout exceeded");

    conn.cleanup_sequences().await;
    assert!(conn.needs_sequence_cleanup());
    assert_eq!(sequence.rows().len(), 2);

    conn.close().await.unwrap();
    assert_eq!(sequence.rows(), vec![2]);
}

#[tokio::test]
async fn test_sequence_table_honors_prefix() {
    let sequence = SharedSequence::default();
    let options = ConnectionOptions::new(DatabaseType::SQLite).with_prefix(TablePrefix::new("site_"));
    let (engine, script) = ScriptedEngine::with_sequence(DatabaseType::SQLite, sequence);
    let mut conn = Connection::with_engine(options, engine).await.unwrap();

    conn.ensure_sequence_table().await.unwrap();
    conn.next_id(0).await.unwrap();

    assert_eq!(script.count_prefix("CREATE TABLE IF NOT EXISTS \"site_sequences\""), 1);
    assert_eq!(script.count("INSERT INTO \"site_sequences\" DEFAULT VALUES"), 1);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_sequence() {
    let mut conn = sqlite_memory().await;
    conn.ensure_sequence_table().await.unwrap();
    // Creating it twice is harmless
    conn.ensure_sequence_table().await.unwrap();

    let first = conn.next_id(0).await.unwrap();
    let second = conn.next_id(0).await.unwrap();
    assert!(second > first);

    let raised = conn.next_id(1000).await.unwrap();
    assert!(raised > 1000);

    conn.cleanup_sequences().await;
    assert!(!conn.needs_sequence_cleanup());

    let rows = conn
        .execute("SELECT value FROM {sequences}", &[], QueryOptions::rows())
        .await
        .unwrap()
        .into_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], raised);

    conn.close().await.unwrap();
}
