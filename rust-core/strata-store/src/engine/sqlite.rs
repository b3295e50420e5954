// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SQLite engine for Strata.
//
// A single rusqlite `Connection` guarded by a mutex. rusqlite is blocking, so
// every call runs on the blocking pool via `spawn_blocking`. Upserts are a
// single `INSERT ... ON CONFLICT DO UPDATE` statement and batches run inside
// one rusqlite transaction, which rolls back when dropped uncommitted.
//
// The `:memory:` filename gives every connection its own empty database, so
// a replacement client after a lost connection starts from scratch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode};
use tracing::debug;

use crate::engine::{
    BatchStrategy, Connector, EngineClient, EngineTraits, Outcome, RawStatement, Statement,
    UpsertSupport,
};
use crate::error::EngineError;

/// How long a statement waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_STORE: &str = r#"CREATE TABLE "store" (
    "key" VARCHAR(100) NOT NULL PRIMARY KEY,
    "value" TEXT NOT NULL
)"#;
const SELECT: &str = r#"SELECT "value" FROM "store" WHERE "key" = ?1"#;
const UPDATE: &str = r#"UPDATE "store" SET "value" = ?2 WHERE "key" = ?1"#;
const INSERT: &str = r#"INSERT INTO "store" ("key", "value") VALUES (?1, ?2)"#;
const DELETE: &str = r#"DELETE FROM "store" WHERE "key" = ?1"#;
const UPSERT: &str = r#"INSERT INTO "store" ("key", "value") VALUES (?1, ?2)
    ON CONFLICT ("key") DO UPDATE SET "value" = excluded."value""#;

/// Map a rusqlite error onto the engine error kinds the adapter reacts to.
fn classify(err: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            ErrorCode::ConstraintViolation
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return EngineError::unique_violation(err.to_string());
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure => {
                return EngineError::connection(err.to_string());
            }
            _ => {}
        }
    }
    let message = err.to_string();
    if message.contains("already exists") {
        EngineError::already_exists(message)
    } else {
        EngineError::statement(message)
    }
}

fn run(conn: &Connection, statement: &Statement) -> Result<Outcome, EngineError> {
    let affected = match statement {
        Statement::Select { key } => {
            let mut stmt = conn.prepare_cached(SELECT).map_err(classify)?;
            let rows = stmt
                .query_map(params![key], |row| row.get::<_, String>(0))
                .map_err(classify)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?;
            return Ok(Outcome::Rows(rows));
        }
        Statement::Update { key, value } => conn.execute(UPDATE, params![key, value]),
        Statement::Insert { key, value } => conn.execute(INSERT, params![key, value]),
        Statement::Delete { key } => conn.execute(DELETE, params![key]),
        Statement::Upsert { key, value } => conn.execute(UPSERT, params![key, value]),
    }
    .map_err(classify)?;
    Ok(Outcome::Affected(affected as u64))
}

/// An engine client over one SQLite database.
pub struct SqliteEngine {
    filename: String,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteEngine {
    /// Create an unconnected client for `filename` (`:memory:` allowed).
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Run `work` against the open connection on the blocking pool.
    async fn with_conn<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let slot = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock();
            let conn = guard
                .as_mut()
                .ok_or_else(|| EngineError::connection("sqlite connection is not open"))?;
            work(conn)
        })
        .await
        .map_err(|e| EngineError::statement(format!("task join: {e}")))?
    }
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("filename", &self.filename)
            .finish()
    }
}

#[async_trait]
impl EngineClient for SqliteEngine {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn traits(&self) -> EngineTraits {
        EngineTraits {
            upsert: UpsertSupport::Native,
            batch: BatchStrategy::Composite,
            rollback_on_error: true,
        }
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let slot = Arc::clone(&self.conn);
        let filename = self.filename.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock();
            if guard.is_some() {
                return Ok(());
            }
            let conn = Connection::open(&filename)
                .map_err(|e| EngineError::connection(format!("open {filename}: {e}")))?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(|e| EngineError::connection(e.to_string()))?;
            debug!(filename = %filename, "opened sqlite engine");
            *guard = Some(conn);
            Ok(())
        })
        .await
        .map_err(|e| EngineError::connection(format!("task join: {e}")))?
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        let slot = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = slot.lock().take() {
                conn.close()
                    .map_err(|(_, e)| EngineError::connection(e.to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::connection(format!("task join: {e}")))?
    }

    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError> {
        let statement = statement.clone();
        self.with_conn(move |conn| run(conn, &statement)).await
    }

    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError> {
        match statement {
            RawStatement::CreateStore => {
                self.with_conn(|conn| conn.execute_batch(CREATE_STORE).map_err(classify))
                    .await
            }
            other => Err(EngineError::unsupported(format!(
                "sqlite engine has no {other:?} statement"
            ))),
        }
    }

    async fn execute_composite(&self, statements: &[Statement]) -> Result<(), EngineError> {
        let statements = statements.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(classify)?;
            for statement in &statements {
                run(&tx, statement)?;
            }
            tx.commit().map_err(classify)
        })
        .await
    }
}

/// Creates [`SqliteEngine`] clients for one database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    filename: String,
}

impl SqliteConnector {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

impl Connector for SqliteConnector {
    type Client = SqliteEngine;

    fn create(&self) -> SqliteEngine {
        SqliteEngine::new(self.filename.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StoreAdapter;
    use crate::config::{StoreConfig, SQLITE_IN_MEMORY};
    use crate::error::{EngineErrorKind, StoreError};
    use crate::record::Operation;
    use crate::store::KeyValueStore;

    async fn bootstrapped() -> SqliteEngine {
        let engine = SqliteEngine::new(SQLITE_IN_MEMORY);
        engine.connect().await.unwrap();
        engine.execute_raw(RawStatement::CreateStore).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_error_classification() {
        let engine = bootstrapped().await;

        let again = engine.execute_raw(RawStatement::CreateStore).await.unwrap_err();
        assert_eq!(again.kind(), EngineErrorKind::AlreadyExists);

        let insert = Statement::Insert {
            key: "k".into(),
            value: "v".into(),
        };
        engine.execute(&insert).await.unwrap();
        let dup = engine.execute(&insert).await.unwrap_err();
        assert_eq!(dup.kind(), EngineErrorKind::UniqueViolation);

        engine.disconnect().await.unwrap();
        let gone = engine
            .execute(&Statement::Select { key: "k".into() })
            .await
            .unwrap_err();
        assert!(gone.is_connection());
    }

    #[tokio::test]
    async fn test_update_reports_affected_rows() {
        let engine = bootstrapped().await;
        let update = Statement::Update {
            key: "k".into(),
            value: "v".into(),
        };
        assert_eq!(engine.execute(&update).await.unwrap(), Outcome::Affected(0));

        let upsert = Statement::Upsert {
            key: "k".into(),
            value: "first".into(),
        };
        engine.execute(&upsert).await.unwrap();
        assert_eq!(engine.execute(&update).await.unwrap(), Outcome::Affected(1));
        assert_eq!(
            engine
                .execute(&Statement::Select { key: "k".into() })
                .await
                .unwrap(),
            Outcome::Rows(vec!["v".into()])
        );
    }

    #[tokio::test]
    async fn test_composite_rolls_back() {
        let engine = bootstrapped().await;
        engine
            .execute(&Statement::Insert {
                key: "taken".into(),
                value: "x".into(),
            })
            .await
            .unwrap();

        let err = engine
            .execute_composite(&[
                Statement::Upsert {
                    key: "a".into(),
                    value: "1".into(),
                },
                Statement::Insert {
                    key: "taken".into(),
                    value: "y".into(),
                },
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::UniqueViolation);

        let rows = engine
            .execute(&Statement::Select { key: "a".into() })
            .await
            .unwrap();
        assert_eq!(rows, Outcome::Rows(vec![]));
    }

    #[tokio::test]
    async fn test_adapter_over_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("store.db").to_string_lossy().into_owned();
        let adapter = StoreAdapter::new(
            SqliteConnector::new(filename.clone()),
            StoreConfig::sqlite(filename.clone()),
        );
        adapter.init().await.unwrap();
        adapter.init().await.unwrap();

        adapter.set("c", "old").await.unwrap();
        adapter.set("c", "new").await.unwrap();
        assert_eq!(adapter.get("c").await.unwrap().as_deref(), Some("new"));

        adapter
            .do_bulk(&[Operation::set("a", "1"), Operation::remove("c")])
            .await
            .unwrap();
        assert_eq!(adapter.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(adapter.get("c").await.unwrap(), None);

        let long = "k".repeat(101);
        assert!(matches!(
            adapter.set(&long, "v").await,
            Err(StoreError::KeyTooLong { size: 101, max: 100 })
        ));
        adapter.close().await.unwrap();

        // Data is on disk for the next adapter.
        let reopened =
            StoreAdapter::new(SqliteConnector::new(filename.clone()), StoreConfig::sqlite(filename));
        reopened.init().await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap().as_deref(), Some("1"));
    }
}
