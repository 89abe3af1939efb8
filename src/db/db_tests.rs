#![cfg(test)]
//! This module collects a bunch of tests that slam an actual database file,
//! to verify the gateway's end-to-end behaviors: visibility, durability,
//! writer serialization, and what the various failure modes look like.

use super::error::PoolRole;
use super::transaction::TxState;
use super::*;
use crate::params;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("scratch.db")
}

async fn open_at(path: &Path) -> Gateway {
    Gateway::open(path.to_str().unwrap(), DbOptions::default())
        .await
        .unwrap()
}

async fn count(db: &Gateway, table: &str) -> i64 {
    db.query_row(&format!("SELECT COUNT(*) FROM {};", table), params![])
        .scan_one::<i64>()
        .await
        .unwrap()
}

fn wal_size(path: &Path) -> u64 {
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    std::fs::metadata(wal).map(|m| m.len()).unwrap_or(0)
}

#[tokio::test]
async fn empty_path_is_rejected() {
    assert!(matches!(
        Gateway::open("", DbOptions::default()).await,
        Err(DbError::EmptyPath)
    ));
    assert!(matches!(
        Gateway::open("   ", DbOptions::default()).await,
        Err(DbError::EmptyPath)
    ));
}

#[tokio::test]
async fn unopenable_path_reports_writer_open_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no/such/dir/app.db");
    let res = Gateway::open(path.to_str().unwrap(), DbOptions::default()).await;
    match res {
        Err(DbError::Open { pool, .. }) => assert_eq!(pool, PoolRole::Writer),
        other => panic!("expected a writer open failure, got {:?}", other),
    }
}

#[tokio::test]
async fn in_memory_databases_are_refused() {
    for path in [
        ":memory:",
        "sqlite::memory:",
        "file::memory:?cache=shared",
        "file:scratch?mode=memory&cache=shared",
    ] {
        match Gateway::open(path, DbOptions::default()).await {
            Err(DbError::InMemory(p)) => assert_eq!(p, path),
            other => panic!("{} should have been refused, got {:?}", path, other),
        }
    }
}

#[tokio::test]
async fn reader_failure_releases_the_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let opts = DbOptions {
        reader_connections: Some(0),
        ..DbOptions::default()
    };
    match Gateway::open(path.to_str().unwrap(), opts).await {
        Err(DbError::Open { pool, .. }) => assert_eq!(pool, PoolRole::Reader),
        other => panic!("expected a reader open failure, got {:?}", other),
    }
    // The writer got far enough to create the file...
    assert!(path.exists());
    // ...and has let go of it again: leaving WAL mode needs the file to
    // ourselves, and we don't wait for anyone.
    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .busy_timeout(Duration::ZERO)
        .connect()
        .await
        .unwrap();
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode=DELETE")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(mode, "delete");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn exec_query_and_rollback_scenario() {
    let (_dir, db) = Gateway::new_test_db().await;

    db.exec(
        "CREATE TABLE items(id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        params![],
    )
    .await
    .unwrap();
    for i in 0..3 {
        let affected = db
            .exec("INSERT INTO items(name) VALUES(?1);", params![format!("n{}", i)])
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    let mut rows = db.query("SELECT COUNT(*) FROM items;", params![]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.scan_next::<(i64,)>().unwrap(), Some((3,)));
    assert!(rows.scan_next::<(i64,)>().unwrap().is_none());

    let name: String = db
        .query_row("SELECT name FROM items WHERE id = ?1;", params![2])
        .scan_one()
        .await
        .unwrap();
    assert_eq!(name, "n1");

    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO items(name) VALUES(?1);", params!["n3"])
        .await
        .unwrap();
    // read-your-writes inside the transaction...
    let inside: i64 = tx
        .query_row("SELECT COUNT(*) FROM items;", params![])
        .scan_one()
        .await
        .unwrap();
    assert_eq!(inside, 4);
    // ...but nobody else sees it.
    assert_eq!(count(&db, "items").await, 3);
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TxState::RolledBack);

    assert_eq!(count(&db, "items").await, 3);
    db.close().await;
}

#[tokio::test]
async fn committed_writes_are_visible() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE kv(k TEXT PRIMARY KEY, v TEXT NOT NULL);", params![])
        .await
        .unwrap();

    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO kv(k, v) VALUES(?1, ?2);", params!["a", "1"])
        .await
        .unwrap();
    let mut rows = tx.query("SELECT v FROM kv WHERE k = ?1;", params!["a"]).await.unwrap();
    assert_eq!(rows.scan_next::<(String,)>().unwrap(), Some(("1".to_string(),)));
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TxState::Committed);

    let v: String = db
        .query_row("SELECT v FROM kv WHERE k = ?1;", params!["a"])
        .scan_one()
        .await
        .unwrap();
    assert_eq!(v, "1");
    db.close().await;
}

#[tokio::test]
async fn resolved_transactions_stay_resolved() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE t(x INTEGER);", params![]).await.unwrap();

    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO t(x) VALUES (1);", params![]).await.unwrap();
    tx.commit().await.unwrap();
    // second commit is an error, not a second mutation
    assert!(matches!(tx.commit().await, Err(DbError::NoActiveTransaction)));
    // rollback after commit is a harmless no-op
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TxState::Committed);
    // and statements are refused
    assert!(matches!(
        tx.exec("INSERT INTO t(x) VALUES (2);", params![]).await,
        Err(DbError::NoActiveTransaction)
    ));
    assert!(matches!(
        tx.query_row("SELECT x FROM t;", params![]).row().await,
        Err(DbError::NoActiveTransaction)
    ));

    let mut tx2 = db.begin_transaction().await.unwrap();
    tx2.exec("INSERT INTO t(x) VALUES (3);", params![]).await.unwrap();
    tx2.rollback().await.unwrap();
    tx2.rollback().await.unwrap();
    assert!(matches!(tx2.commit().await, Err(DbError::NoActiveTransaction)));

    assert_eq!(count(&db, "t").await, 1);
    db.close().await;
}

#[tokio::test]
async fn failed_commit_rolls_back_and_frees_the_writer() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE parent(id INTEGER PRIMARY KEY);", params![])
        .await
        .unwrap();
    db.exec(
        r#"CREATE TABLE child(
            id INTEGER PRIMARY KEY,
            parent_id INTEGER NOT NULL
                REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
        );"#,
        params![],
    )
    .await
    .unwrap();

    // A deferred foreign key only gets checked at COMMIT.
    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO child(parent_id) VALUES (99);", params![])
        .await
        .unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Sql(_)));
    assert!(!err.is_retryable());
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(matches!(tx.commit().await, Err(DbError::NoActiveTransaction)));

    // Nothing leaked, and the writer is usable again.
    assert_eq!(count(&db, "child").await, 0);
    db.exec("INSERT INTO parent(id) VALUES (1);", params![]).await.unwrap();
    db.close().await;
}

#[tokio::test]
async fn dropped_transaction_is_rolled_back() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE t(x INTEGER);", params![]).await.unwrap();
    {
        let mut tx = db.begin_transaction().await.unwrap();
        tx.exec("INSERT INTO t(x) VALUES (1);", params![]).await.unwrap();
        // dropped without commit
    }
    db.exec("INSERT INTO t(x) VALUES (2);", params![]).await.unwrap();
    assert_eq!(count(&db, "t").await, 1);
    db.close().await;
}

#[tokio::test]
async fn error_kinds_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let opts = DbOptions {
        read_timeout: Duration::from_millis(250),
        ..DbOptions::default()
    };
    let db = Gateway::open(db_path(&dir).to_str().unwrap(), opts)
        .await
        .unwrap();
    db.exec("CREATE TABLE empty(x INTEGER);", params![]).await.unwrap();

    // zero rows
    let err = db
        .query_row("SELECT x FROM empty;", params![])
        .scan_one::<i64>()
        .await
        .unwrap_err();
    assert!(err.is_no_rows());
    assert!(!err.is_retryable());

    // bad SQL
    let err = db
        .query_row("SELEKT nonsense;", params![])
        .scan_one::<i64>()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Sql(_)));
    assert!(!err.is_no_rows());

    // too slow for the read budget
    let slow = r#"
        WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000)
        SELECT COUNT(*) FROM c;
    "#;
    let err = db.query_row(slow, params![]).scan_one::<i64>().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, DbError::Timeout { op: "query_row", .. }));
    let err = db.query(slow, params![]).await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { op: "query", .. }));
    // not closing: the abandoned statements would make close() wait them out.
}

#[tokio::test]
async fn constraint_errors_pass_through() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE u(name TEXT UNIQUE);", params![]).await.unwrap();
    db.exec("INSERT INTO u(name) VALUES ('a');", params![]).await.unwrap();
    let err = db
        .exec("INSERT INTO u(name) VALUES ('a');", params![])
        .await
        .unwrap_err();
    // SQLITE_CONSTRAINT_UNIQUE
    assert_eq!(err.sqlite_code().as_deref(), Some("2067"));
    db.close().await;
}

#[tokio::test]
async fn timed_row_scope_released_after_scan() {
    let (_dir, db) = Gateway::new_test_db().await;
    let mut row = db.query_row("SELECT 1;", params![]);
    assert!(!row.is_released());
    assert!(row.err().await.is_none());
    assert!(row.is_released());
    let one: i64 = row.scan_one().await.unwrap();
    assert_eq!(one, 1);
    db.close().await;
}

#[tokio::test]
async fn writer_serves_one_transaction_at_a_time() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE hits(n INTEGER);", params![]).await.unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..8 {
        let db = db.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let mut tx = db.begin_transaction().await.unwrap();
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tx.exec("INSERT INTO hits(n) VALUES (?1);", params![i])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            tx.commit().await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(count(&db, "hits").await, 8);

    // plain writes queue up behind each other too, and all land.
    let writes = (0..16).map(|i| {
        let db = db.clone();
        async move {
            db.exec("INSERT INTO hits(n) VALUES (?1);", params![i])
                .await
                .unwrap();
        }
    });
    futures_util::future::join_all(writes).await;
    assert_eq!(count(&db, "hits").await, 24);
    db.close().await;
}

#[tokio::test]
async fn concurrent_readers_alongside_a_writer() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE c(n INTEGER);", params![]).await.unwrap();

    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                db.exec("INSERT INTO c(n) VALUES (?1);", params![i])
                    .await
                    .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..db.reader_capacity())
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let n: i64 = db
                        .query_row("SELECT COUNT(*) FROM c;", params![])
                        .scan_one()
                        .await
                        .unwrap();
                    assert!((0..=50).contains(&n));
                }
            })
        })
        .collect();
    writer.await.unwrap();
    for r in readers {
        r.await.unwrap();
    }
    assert_eq!(count(&db, "c").await, 50);
    db.close().await;
}

#[tokio::test]
async fn query_on_writer_sees_committed_state_only() {
    let (_dir, db) = Gateway::new_test_db().await;
    db.exec("CREATE TABLE t(x INTEGER);", params![]).await.unwrap();
    db.exec("INSERT INTO t(x) VALUES (1);", params![]).await.unwrap();

    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO t(x) VALUES (2);", params![]).await.unwrap();

    // It has to wait for the writer slot, so with the transaction still open
    // it can only time out.
    let short = Gateway::clone(&db);
    let res = tokio::time::timeout(
        Duration::from_millis(100),
        short.query_on_writer("SELECT COUNT(*) FROM t;", params![]),
    )
    .await;
    assert!(res.is_err());

    tx.rollback().await.unwrap();
    let mut rows = db
        .query_on_writer("SELECT COUNT(*) FROM t;", params![])
        .await
        .unwrap();
    assert_eq!(rows.scan_next::<(i64,)>().unwrap(), Some((1,)));
    db.close().await;
}

#[tokio::test]
async fn checkpoint_truncates_wal_without_losing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let db = open_at(&path).await;
    db.exec("CREATE TABLE t(x INTEGER);", params![]).await.unwrap();
    for i in 0..100 {
        db.exec("INSERT INTO t(x) VALUES (?1);", params![i])
            .await
            .unwrap();
    }
    assert!(wal_size(&path) > 0);

    let stats = db.checkpoint().await.unwrap();
    assert!(!stats.busy);
    assert_eq!(wal_size(&path), 0);
    db.close().await;

    let db = open_at(&path).await;
    assert_eq!(count(&db, "t").await, 100);
    db.close().await;
}

#[tokio::test]
async fn committed_transaction_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let db = open_at(&path).await;
    db.exec("CREATE TABLE kv(k TEXT PRIMARY KEY, v TEXT NOT NULL);", params![])
        .await
        .unwrap();
    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO kv(k, v) VALUES (?1, ?2);", params!["durable", "yes"])
        .await
        .unwrap();
    tx.commit().await.unwrap();
    db.close().await;

    let db = open_at(&path).await;
    let v: String = db
        .query_row("SELECT v FROM kv WHERE k = ?1;", params!["durable"])
        .scan_one()
        .await
        .unwrap();
    assert_eq!(v, "yes");
    db.close().await;
}

#[tokio::test]
async fn close_gives_up_on_an_unfinished_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let opts = DbOptions {
        write_timeout: Duration::from_millis(300),
        read_timeout: Duration::from_millis(300),
        checkpoint_timeout: Duration::from_millis(200),
        ..DbOptions::default()
    };
    let db = Gateway::open(db_path(&dir).to_str().unwrap(), opts)
        .await
        .unwrap();
    db.exec("CREATE TABLE t(x INTEGER);", params![]).await.unwrap();
    let mut tx = db.begin_transaction().await.unwrap();
    tx.exec("INSERT INTO t(x) VALUES (1);", params![]).await.unwrap();

    // The checkpoint can't get the writer slot and the writer connection
    // never comes back, but shutdown still goes through.
    let closing = tokio::time::timeout(Duration::from_secs(10), db.clone().close()).await;
    assert!(closing.is_ok(), "close hung on the open transaction");
    assert!(db.is_closed());
    assert!(db.exec("INSERT INTO t(x) VALUES (2);", params![]).await.is_err());
    drop(tx);
}

#[tokio::test]
async fn close_is_idempotent_across_clones() {
    let (_dir, db) = Gateway::new_test_db().await;
    let other = db.clone();
    db.close().await;
    assert!(other.is_closed());
    other.clone().close().await;
    assert!(other.exec("SELECT 1;", params![]).await.is_err());
}
