// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <j.d.a.jewell@open.ac.uk>
//
// redb-backed embedded engine for Strata.
//
// Uses redb (pure Rust, B-tree, ACID, single-file database) as the embedded
// file-based engine. No C/C++ dependencies; builds on any platform with a
// Rust toolchain.
//
// # Design
//
// - Single redb `Database` file containing the `store` table.
// - Read transactions for `Select` (concurrent, lock-free).
// - One write transaction per mutating statement (serialised by redb
//   internally), which makes every insert-or-update atomic: `Upsert` is
//   native.
// - Batches are composite: all statements run in one write transaction that
//   is committed only if every statement succeeds. A dropped write
//   transaction aborts, so a failed batch needs no explicit rollback.
// - "Connecting" opens the file; redb allows one open handle per file per
//   process, so `disconnect` must drop it before a replacement can connect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::{
    BatchStrategy, Connector, EngineClient, EngineTraits, Outcome, RawStatement, Statement,
    UpsertSupport,
};
use crate::error::EngineError;

/// Table definition for the store.
const STORE_TABLE: TableDefinition<&str, &str> = TableDefinition::new(super::STORE_TABLE);

type StoreTable<'txn> = Table<'txn, &'static str, &'static str>;

fn statement_error(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::statement(format!("{context}: {err}"))
}

/// Run one mutating statement inside an open write transaction.
fn apply(table: &mut StoreTable<'_>, statement: &Statement) -> Result<Outcome, EngineError> {
    let exists = |table: &StoreTable<'_>, key: &str| -> Result<bool, EngineError> {
        Ok(table
            .get(key)
            .map_err(|e| statement_error("get", e))?
            .is_some())
    };

    match statement {
        Statement::Select { key } => {
            let value = table
                .get(key.as_str())
                .map_err(|e| statement_error("get", e))?
                .map(|v| v.value().to_string());
            Ok(Outcome::Rows(value.into_iter().collect()))
        }
        Statement::Update { key, value } => {
            if !exists(table, key)? {
                return Ok(Outcome::Affected(0));
            }
            table
                .insert(key.as_str(), value.as_str())
                .map_err(|e| statement_error("update", e))?;
            Ok(Outcome::Affected(1))
        }
        Statement::Insert { key, value } => {
            if exists(table, key)? {
                return Err(EngineError::unique_violation(format!(
                    "key {key:?} already exists"
                )));
            }
            table
                .insert(key.as_str(), value.as_str())
                .map_err(|e| statement_error("insert", e))?;
            Ok(Outcome::Affected(1))
        }
        Statement::Delete { key } => {
            let removed = table
                .remove(key.as_str())
                .map_err(|e| statement_error("remove", e))?
                .is_some();
            Ok(Outcome::Affected(u64::from(removed)))
        }
        Statement::Upsert { key, value } => {
            table
                .insert(key.as_str(), value.as_str())
                .map_err(|e| statement_error("upsert", e))?;
            Ok(Outcome::Affected(1))
        }
    }
}

/// Run `statements` in one write transaction, committing only if all succeed.
fn write_all(db: &Database, statements: &[Statement]) -> Result<Vec<Outcome>, EngineError> {
    let txn = db
        .begin_write()
        .map_err(|e| EngineError::connection(format!("write txn: {e}")))?;
    let mut outcomes = Vec::with_capacity(statements.len());
    {
        let mut table = txn
            .open_table(STORE_TABLE)
            .map_err(|e| statement_error("open table", e))?;
        for statement in statements {
            outcomes.push(apply(&mut table, statement)?);
        }
    }
    txn.commit().map_err(|e| statement_error("commit", e))?;
    Ok(outcomes)
}

fn read_one(db: &Database, key: &str) -> Result<Outcome, EngineError> {
    let txn = db
        .begin_read()
        .map_err(|e| EngineError::connection(format!("read txn: {e}")))?;
    let table = match txn.open_table(STORE_TABLE) {
        Ok(t) => t,
        // Table doesn't exist yet, nothing has been written
        Err(_) => return Ok(Outcome::Rows(Vec::new())),
    };
    let value = table
        .get(key)
        .map_err(|e| statement_error("get", e))?
        .map(|v| v.value().to_string());
    Ok(Outcome::Rows(value.into_iter().collect()))
}

/// An embedded engine client over one redb file.
pub struct RedbEngine {
    /// Path to the database file.
    path: PathBuf,
    /// The open database handle, `None` while disconnected.
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbEngine {
    /// Create an unconnected client for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    /// Return the filesystem path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn database(&self) -> Result<Arc<Database>, EngineError> {
        self.db
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::connection("redb database is not open"))
    }
}

impl std::fmt::Debug for RedbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbEngine")
            .field("path", &self.path)
            .finish()
    }
}

async fn blocking<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::statement(format!("task join: {e}")))?
}

#[async_trait]
impl EngineClient for RedbEngine {
    fn name(&self) -> &str {
        "redb"
    }

    fn traits(&self) -> EngineTraits {
        EngineTraits {
            upsert: UpsertSupport::Native,
            batch: BatchStrategy::Composite,
            rollback_on_error: true,
        }
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let mut slot = self.db.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let db = blocking(move || {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::connection(format!("create {}: {e}", parent.display()))
                })?;
            }
            Database::create(&path).map_err(|e| {
                EngineError::connection(format!("failed to open redb at {}: {e}", path.display()))
            })
        })
        .await?;

        debug!(path = %self.path.display(), "opened redb engine");
        *slot = Some(Arc::new(db));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.db.write().await.take();
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError> {
        let db = self.database().await?;
        let statement = statement.clone();
        blocking(move || match &statement {
            Statement::Select { key } => read_one(&db, key),
            _ => write_all(&db, std::slice::from_ref(&statement))
                .map(|mut outcomes| outcomes.pop().unwrap_or(Outcome::Affected(0))),
        })
        .await
    }

    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError> {
        match statement {
            RawStatement::CreateStore => {
                let db = self.database().await?;
                // Opening the table in a write transaction creates it;
                // an existing table is simply reopened.
                blocking(move || write_all(&db, &[]).map(|_| ())).await
            }
            other => Err(EngineError::unsupported(format!(
                "redb engine has no {other:?} statement"
            ))),
        }
    }

    async fn execute_composite(&self, statements: &[Statement]) -> Result<(), EngineError> {
        let db = self.database().await?;
        let statements = statements.to_vec();
        blocking(move || write_all(&db, &statements).map(|_| ())).await
    }
}

/// Creates [`RedbEngine`] clients for one file.
#[derive(Debug, Clone)]
pub struct RedbConnector {
    path: PathBuf,
}

impl RedbConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for RedbConnector {
    type Client = RedbEngine;

    fn create(&self) -> RedbEngine {
        RedbEngine::new(self.path.clone())
    }
}
