// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory engine for Strata.
//
// `MemoryStore` plays the role of the backing database: a `BTreeMap` behind a
// tokio `RwLock`, shared by every client created from it, so several adapters
// over one store behave like several processes over one server. Each
// `MemoryEngine` is one connection to it, with its own transaction overlay.
//
// The engine enforces the same contracts a relational server would: the
// table must be created before use, a second `CreateStore` reports
// `AlreadyExists`, and an `Insert` of an existing key reports
// `UniqueViolation`. Upsert and batch capabilities are configurable so every
// adapter code path can be exercised without an external server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::engine::{
    BatchStrategy, Connector, EngineClient, EngineTraits, Outcome, RawStatement, Statement,
    UpsertSupport, UPSERT_ROUTINE,
};
use crate::error::EngineError;

#[derive(Debug, Default)]
struct StoreState {
    table_created: bool,
    routine_installed: bool,
    rows: BTreeMap<String, String>,
}

/// The shared backing data for [`MemoryEngine`] clients.
///
/// Cloning is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    /// Create a new, empty store with no table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the number of rows currently committed.
    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    /// Return true if no rows are committed.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rows.is_empty()
    }

    /// Whether the store table has been created.
    pub async fn is_bootstrapped(&self) -> bool {
        self.state.read().await.table_created
    }

    /// Committed value for `key`, bypassing any client.
    pub async fn committed(&self, key: &str) -> Option<String> {
        self.state.read().await.rows.get(key).cloned()
    }

    /// A copy of every committed row in key order.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.state.read().await.rows.clone()
    }

    /// Write a committed row directly, as an unrelated writer would.
    /// Creates the table if needed.
    pub async fn insert_committed(&self, key: &str, value: &str) {
        let mut state = self.state.write().await;
        state.table_created = true;
        state.rows.insert(key.to_string(), value.to_string());
    }
}

/// Capability switches for [`MemoryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    pub upsert: UpsertSupport,
    pub batch: BatchStrategy,
}

impl Default for MemoryOptions {
    /// The weakest engine: no upsert primitive, pipelined batches.
    fn default() -> Self {
        Self {
            upsert: UpsertSupport::ClientLoop,
            batch: BatchStrategy::Pipelined,
        }
    }
}

/// Row access shared by autocommit statements and transaction overlays.
trait Rows {
    fn get(&self, key: &str) -> Option<&str>;
    fn put(&mut self, key: &str, value: &str);
    fn delete(&mut self, key: &str) -> bool;
}

impl Rows for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key).map(String::as_str)
    }

    fn put(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }

    fn delete(&mut self, key: &str) -> bool {
        self.remove(key).is_some()
    }
}

/// Uncommitted writes layered over committed rows. `None` is a tombstone.
type Writes = BTreeMap<String, Option<String>>;

struct Overlay<'a> {
    base: &'a BTreeMap<String, String>,
    writes: &'a mut Writes,
}

impl Rows for Overlay<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.writes.get(key) {
            Some(pending) => pending.as_deref(),
            None => self.base.get(key).map(String::as_str),
        }
    }

    fn put(&mut self, key: &str, value: &str) {
        self.writes.insert(key.to_string(), Some(value.to_string()));
    }

    fn delete(&mut self, key: &str) -> bool {
        let existed = self.get(key).is_some();
        self.writes.insert(key.to_string(), None);
        existed
    }
}

fn merge(rows: &mut BTreeMap<String, String>, writes: Writes) {
    for (key, pending) in writes {
        match pending {
            Some(value) => {
                rows.insert(key, value);
            }
            None => {
                rows.remove(&key);
            }
        }
    }
}

/// One connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryEngine {
    store: MemoryStore,
    options: MemoryOptions,
    connected: AtomicBool,
    txn: Mutex<Option<Writes>>,
    drain_paused: AtomicBool,
}

impl MemoryEngine {
    /// Create an unconnected client over `store`.
    pub fn new(store: MemoryStore, options: MemoryOptions) -> Self {
        Self {
            store,
            options,
            connected: AtomicBool::new(false),
            txn: Mutex::new(None),
            drain_paused: AtomicBool::new(false),
        }
    }

    /// The store this client talks to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether drain signalling is currently suppressed.
    pub fn is_drain_paused(&self) -> bool {
        self.drain_paused.load(Ordering::SeqCst)
    }

    /// Whether this client has a transaction open.
    pub async fn in_transaction(&self) -> bool {
        self.txn.lock().await.is_some()
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::connection("memory engine is not connected"))
        }
    }

    fn ensure_table(state: &StoreState) -> Result<(), EngineError> {
        if state.table_created {
            Ok(())
        } else {
            Err(EngineError::statement("relation \"store\" does not exist"))
        }
    }

    fn apply(
        &self,
        rows: &mut impl Rows,
        state_has_routine: bool,
        statement: &Statement,
    ) -> Result<Outcome, EngineError> {
        match statement {
            Statement::Select { key } => Ok(Outcome::Rows(
                rows.get(key).map(str::to_string).into_iter().collect(),
            )),
            Statement::Update { key, value } => {
                if rows.get(key).is_some() {
                    rows.put(key, value);
                    Ok(Outcome::Affected(1))
                } else {
                    Ok(Outcome::Affected(0))
                }
            }
            Statement::Insert { key, value } => {
                if rows.get(key).is_some() {
                    return Err(EngineError::unique_violation(format!(
                        "duplicate key value violates unique constraint \"store_pkey\": {key}"
                    )));
                }
                rows.put(key, value);
                Ok(Outcome::Affected(1))
            }
            Statement::Delete { key } => Ok(Outcome::Affected(u64::from(rows.delete(key)))),
            Statement::Upsert { key, value } => {
                match self.options.upsert {
                    UpsertSupport::ClientLoop => {
                        return Err(EngineError::unsupported(
                            "memory engine configured without an upsert primitive",
                        ))
                    }
                    UpsertSupport::ServerRoutine if !state_has_routine => {
                        return Err(EngineError::statement(format!(
                            "function {UPSERT_ROUTINE}(character varying, text) does not exist"
                        )))
                    }
                    _ => {}
                }
                rows.put(key, value);
                Ok(Outcome::Affected(1))
            }
        }
    }
}

#[async_trait]
impl EngineClient for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn traits(&self) -> EngineTraits {
        EngineTraits {
            upsert: self.options.upsert,
            batch: self.options.batch,
            rollback_on_error: true,
        }
    }

    async fn connect(&self) -> Result<(), EngineError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.connected.store(false, Ordering::SeqCst);
        // An open transaction dies with its connection.
        self.txn.lock().await.take();
        self.drain_paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError> {
        self.ensure_connected()?;
        let mut txn = self.txn.lock().await;
        match txn.as_mut() {
            Some(writes) => {
                let state = self.store.state.read().await;
                Self::ensure_table(&state)?;
                let mut view = Overlay {
                    base: &state.rows,
                    writes,
                };
                self.apply(&mut view, state.routine_installed, statement)
            }
            None => {
                let mut guard = self.store.state.write().await;
                let state = &mut *guard;
                Self::ensure_table(state)?;
                self.apply(&mut state.rows, state.routine_installed, statement)
            }
        }
    }

    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError> {
        self.ensure_connected()?;
        match statement {
            RawStatement::CreateStore => {
                let mut state = self.store.state.write().await;
                if state.table_created {
                    return Err(EngineError::already_exists("relation \"store\" already exists"));
                }
                state.table_created = true;
                Ok(())
            }
            RawStatement::InstallUpsertRoutine => {
                let mut state = self.store.state.write().await;
                if state.routine_installed {
                    return Err(EngineError::already_exists(
                        "function \"upsert_key\" already exists with same argument types",
                    ));
                }
                state.routine_installed = true;
                Ok(())
            }
            RawStatement::Begin => {
                let mut txn = self.txn.lock().await;
                if txn.is_some() {
                    return Err(EngineError::statement("there is already a transaction in progress"));
                }
                *txn = Some(Writes::new());
                Ok(())
            }
            RawStatement::Commit => {
                let mut txn = self.txn.lock().await;
                let writes = txn
                    .take()
                    .ok_or_else(|| EngineError::statement("there is no transaction in progress"))?;
                let mut state = self.store.state.write().await;
                merge(&mut state.rows, writes);
                Ok(())
            }
            RawStatement::Rollback => {
                self.txn.lock().await.take();
                Ok(())
            }
        }
    }

    async fn execute_composite(&self, statements: &[Statement]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        let mut guard = self.store.state.write().await;
        let state = &mut *guard;
        Self::ensure_table(state)?;

        let mut writes = Writes::new();
        {
            let mut view = Overlay {
                base: &state.rows,
                writes: &mut writes,
            };
            for statement in statements {
                self.apply(&mut view, state.routine_installed, statement)?;
            }
        }
        merge(&mut state.rows, writes);
        Ok(())
    }

    fn pause_drain(&self) {
        self.drain_paused.store(true, Ordering::SeqCst);
    }

    fn resume_drain(&self) {
        self.drain_paused.store(false, Ordering::SeqCst);
    }
}

/// Creates [`MemoryEngine`] clients over one shared [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
    options: MemoryOptions,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            options: MemoryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MemoryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl Connector for MemoryConnector {
    type Client = MemoryEngine;

    fn create(&self) -> MemoryEngine {
        MemoryEngine::new(self.store.clone(), self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineErrorKind;

    async fn ready_engine(store: &MemoryStore) -> MemoryEngine {
        let engine = MemoryEngine::new(store.clone(), MemoryOptions::default());
        engine.connect().await.unwrap();
        if !store.is_bootstrapped().await {
            engine.execute_raw(RawStatement::CreateStore).await.unwrap();
        }
        engine
    }

    fn set(key: &str, value: &str) -> Statement {
        Statement::Insert {
            key: key.into(),
            value: value.into(),
        }
    }

    fn select(key: &str) -> Statement {
        Statement::Select { key: key.into() }
    }

    #[tokio::test]
    async fn test_basic_statements() {
        let store = MemoryStore::new();
        let engine = ready_engine(&store).await;

        assert_eq!(engine.execute(&select("k")).await.unwrap(), Outcome::Rows(vec![]));

        engine.execute(&set("k", "v1")).await.unwrap();
        assert_eq!(
            engine.execute(&select("k")).await.unwrap(),
            Outcome::Rows(vec!["v1".into()])
        );

        let updated = engine
            .execute(&Statement::Update {
                key: "k".into(),
                value: "v2".into(),
            })
            .await
            .unwrap();
        assert_eq!(updated.rows_affected(), 1);
        assert_eq!(store.committed("k").await.as_deref(), Some("v2"));

        let missing = engine
            .execute(&Statement::Update {
                key: "nope".into(),
                value: "x".into(),
            })
            .await
            .unwrap();
        assert_eq!(missing.rows_affected(), 0);

        let deleted = engine.execute(&Statement::Delete { key: "k".into() }).await.unwrap();
        assert_eq!(deleted.rows_affected(), 1);
        let deleted = engine.execute(&Statement::Delete { key: "k".into() }).await.unwrap();
        assert_eq!(deleted.rows_affected(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_of_existing_key_is_unique_violation() {
        let store = MemoryStore::new();
        let engine = ready_engine(&store).await;

        engine.execute(&set("k", "a")).await.unwrap();
        let err = engine.execute(&set("k", "b")).await.unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::UniqueViolation);
        assert_eq!(store.committed("k").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_bootstrap_reports_already_exists() {
        let store = MemoryStore::new();
        let engine = ready_engine(&store).await;

        let err = engine.execute_raw(RawStatement::CreateStore).await.unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::AlreadyExists);

        engine.execute_raw(RawStatement::InstallUpsertRoutine).await.unwrap();
        let err = engine
            .execute_raw(RawStatement::InstallUpsertRoutine)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_statements_before_bootstrap_fail() {
        let engine = MemoryEngine::new(MemoryStore::new(), MemoryOptions::default());
        engine.connect().await.unwrap();
        let err = engine.execute(&select("k")).await.unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::Statement);
    }

    #[tokio::test]
    async fn test_unconnected_client_reports_connection_error() {
        let engine = MemoryEngine::new(MemoryStore::new(), MemoryOptions::default());
        let err = engine.execute(&select("k")).await.unwrap_err();
        assert!(err.is_connection());

        engine.connect().await.unwrap();
        engine.disconnect().await.unwrap();
        assert!(engine.execute(&select("k")).await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_transaction_is_invisible_until_commit() {
        let store = MemoryStore::new();
        let writer = ready_engine(&store).await;
        let reader = ready_engine(&store).await;

        writer.begin().await.unwrap();
        writer.execute(&set("a", "1")).await.unwrap();
        // The writer sees its own pending row, nobody else does.
        assert_eq!(writer.execute(&select("a")).await.unwrap().rows_affected(), 1);
        assert_eq!(reader.execute(&select("a")).await.unwrap().rows_affected(), 0);

        writer.commit().await.unwrap();
        assert_eq!(
            reader.execute(&select("a")).await.unwrap(),
            Outcome::Rows(vec!["1".into()])
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_writes() {
        let store = MemoryStore::new();
        store.insert_committed("keep", "old").await;
        let engine = ready_engine(&store).await;

        engine.begin().await.unwrap();
        engine.execute(&set("new", "1")).await.unwrap();
        engine
            .execute(&Statement::Delete { key: "keep".into() })
            .await
            .unwrap();
        engine.rollback().await.unwrap();

        assert!(!engine.in_transaction().await);
        assert_eq!(store.committed("keep").await.as_deref(), Some("old"));
        assert_eq!(store.committed("new").await, None);
    }

    #[tokio::test]
    async fn test_nested_begin_is_rejected() {
        let engine = ready_engine(&MemoryStore::new()).await;
        engine.begin().await.unwrap();
        assert!(engine.begin().await.is_err());
    }

    #[tokio::test]
    async fn test_composite_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.insert_committed("dup", "x").await;
        let engine = ready_engine(&store).await;

        let err = engine
            .execute_composite(&[set("a", "1"), set("dup", "y")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::UniqueViolation);
        assert_eq!(store.committed("a").await, None);

        engine
            .execute_composite(&[set("a", "1"), Statement::Delete { key: "dup".into() }])
            .await
            .unwrap();
        assert_eq!(store.committed("a").await.as_deref(), Some("1"));
        assert_eq!(store.committed("dup").await, None);
    }

    #[tokio::test]
    async fn test_upsert_requires_capability() {
        let store = MemoryStore::new();
        let engine = ready_engine(&store).await;
        let upsert = Statement::Upsert {
            key: "k".into(),
            value: "v".into(),
        };
        assert_eq!(
            engine.execute(&upsert).await.unwrap_err().kind(),
            EngineErrorKind::Unsupported
        );

        let routine = MemoryEngine::new(
            store.clone(),
            MemoryOptions {
                upsert: UpsertSupport::ServerRoutine,
                batch: BatchStrategy::Pipelined,
            },
        );
        routine.connect().await.unwrap();
        assert!(routine.execute(&upsert).await.is_err());
        routine
            .execute_raw(RawStatement::InstallUpsertRoutine)
            .await
            .unwrap();
        routine.execute(&upsert).await.unwrap();
        assert_eq!(store.committed("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_drain_flag_and_disconnect_reset() {
        let engine = ready_engine(&MemoryStore::new()).await;
        engine.pause_drain();
        assert!(engine.is_drain_paused());
        engine.resume_drain();
        assert!(!engine.is_drain_paused());

        engine.begin().await.unwrap();
        engine.pause_drain();
        engine.disconnect().await.unwrap();
        assert!(!engine.in_transaction().await);
        assert!(!engine.is_drain_paused());
    }

    #[tokio::test]
    async fn test_connector_clients_share_store() {
        let connector = MemoryConnector::new(MemoryStore::new());
        let first = connector.create();
        let second = connector.create();
        first.connect().await.unwrap();
        second.connect().await.unwrap();
        first.execute_raw(RawStatement::CreateStore).await.unwrap();

        first.execute(&set("shared", "data")).await.unwrap();
        assert_eq!(
            second.execute(&select("shared")).await.unwrap(),
            Outcome::Rows(vec!["data".into()])
        );
        assert_eq!(connector.store().len().await, 1);
    }
}
