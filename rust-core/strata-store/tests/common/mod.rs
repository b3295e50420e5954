// SPDX-License-Identifier: PMPL-1.0-or-later
//! Test doubles shared by the integration tests.
//!
//! `FaultyConnector` produces memory-engine clients whose failures are
//! scripted through a shared [`Faults`] handle, either over one shared
//! [`MemoryStore`] or over a fresh store per client, the way a per-connection
//! in-memory database behaves. `UnreachableConnector`
//! produces clients that panic if a statement ever reaches them.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_store::engine::memory::MemoryOptions;
use strata_store::engine::{
    BatchStrategy, EngineTraits, Outcome, RawStatement, Statement, UpsertSupport,
};
use strata_store::{Connector, EngineClient, EngineError, MemoryEngine, MemoryStore};

const HEALTHY: usize = usize::MAX;

/// Failure script and call counters shared by every client of a connector.
#[derive(Debug)]
pub struct Faults {
    /// Mutating statements on this key fail with a statement error.
    fail_key: Mutex<Option<String>>,
    /// The next statement fails with a connection error.
    drop_next: AtomicBool,
    /// The next mutating statement on this key never completes.
    stall_key: Mutex<Option<String>>,
    /// Selects answer every row twice.
    duplicate_rows: AtomicBool,
    /// A competing writer commits this row just before the first insert of its key.
    race: Mutex<Option<(String, String)>>,
    /// Id of the client that reports itself unhealthy.
    sick: AtomicUsize,
    pub created: AtomicUsize,
    pub statements: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub drain_pauses: AtomicUsize,
    pub drain_resumes: AtomicUsize,
    pub drain_paused: AtomicBool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            fail_key: Mutex::new(None),
            drop_next: AtomicBool::new(false),
            stall_key: Mutex::new(None),
            duplicate_rows: AtomicBool::new(false),
            race: Mutex::new(None),
            sick: AtomicUsize::new(HEALTHY),
            created: AtomicUsize::new(0),
            statements: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            drain_pauses: AtomicUsize::new(0),
            drain_resumes: AtomicUsize::new(0),
            drain_paused: AtomicBool::new(false),
        }
    }
}

impl Faults {
    pub fn fail_on_key(&self, key: &str) {
        *self.fail_key.lock() = Some(key.to_string());
    }

    pub fn drop_next_connection(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    pub fn stall_on_key(&self, key: &str) {
        *self.stall_key.lock() = Some(key.to_string());
    }

    pub fn return_duplicate_rows(&self) {
        self.duplicate_rows.store(true, Ordering::SeqCst);
    }

    pub fn race_insert(&self, key: &str, value: &str) {
        *self.race.lock() = Some((key.to_string(), value.to_string()));
    }

    /// Mark the most recently created client unhealthy.
    pub fn sicken_current(&self) {
        let current = self.created.load(Ordering::SeqCst) - 1;
        self.sick.store(current, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn fails(&self, statement: &Statement) -> bool {
        !matches!(statement, Statement::Select { .. })
            && self.fail_key.lock().as_deref() == Some(statement.key())
    }
}

/// A memory-engine client with scripted failures.
pub struct FaultyEngine {
    inner: MemoryEngine,
    faults: Arc<Faults>,
    id: usize,
}

impl FaultyEngine {
    async fn inject(&self, statement: &Statement) -> Result<(), EngineError> {
        self.faults.statements.fetch_add(1, Ordering::SeqCst);
        if self.faults.drop_next.swap(false, Ordering::SeqCst) {
            self.inner.disconnect().await?;
            return Err(EngineError::connection("server closed the connection unexpectedly"));
        }
        let stalled = {
            let mut stall = self.faults.stall_key.lock();
            let mutating = !matches!(statement, Statement::Select { .. });
            match stall.as_deref() {
                Some(k) if mutating && k == statement.key() => stall.take(),
                _ => None,
            }
        };
        if stalled.is_some() {
            std::future::pending::<()>().await;
        }
        if let Statement::Insert { key, .. } = statement {
            let raced = {
                let mut race = self.faults.race.lock();
                match race.as_ref() {
                    Some((k, _)) if k == key => race.take(),
                    _ => None,
                }
            };
            if let Some((k, v)) = raced {
                self.inner.store().insert_committed(&k, &v).await;
            }
        }
        if self.faults.fails(statement) {
            return Err(EngineError::statement(format!(
                "injected failure for key {:?}",
                statement.key()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for FaultyEngine {
    fn name(&self) -> &str {
        "faulty"
    }

    fn traits(&self) -> EngineTraits {
        self.inner.traits()
    }

    async fn connect(&self) -> Result<(), EngineError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.inner.disconnect().await
    }

    fn is_healthy(&self) -> bool {
        self.faults.sick.load(Ordering::SeqCst) != self.id
    }

    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError> {
        self.inject(statement).await?;
        match self.inner.execute(statement).await? {
            Outcome::Rows(mut rows) if self.faults.duplicate_rows.load(Ordering::SeqCst) => {
                rows.extend(rows.clone());
                Ok(Outcome::Rows(rows))
            }
            outcome => Ok(outcome),
        }
    }

    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError> {
        if statement == RawStatement::Rollback {
            self.faults.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.execute_raw(statement).await
    }

    async fn execute_composite(&self, statements: &[Statement]) -> Result<(), EngineError> {
        for statement in statements {
            self.inject(statement).await?;
        }
        self.inner.execute_composite(statements).await
    }

    fn pause_drain(&self) {
        self.faults.drain_pauses.fetch_add(1, Ordering::SeqCst);
        self.faults.drain_paused.store(true, Ordering::SeqCst);
        self.inner.pause_drain();
    }

    fn resume_drain(&self) {
        self.faults.drain_resumes.fetch_add(1, Ordering::SeqCst);
        self.faults.drain_paused.store(false, Ordering::SeqCst);
        self.inner.resume_drain();
    }
}

/// Creates [`FaultyEngine`] clients.
#[derive(Clone)]
pub struct FaultyConnector {
    store: MemoryStore,
    /// Every client gets its own empty store.
    ephemeral: bool,
    options: MemoryOptions,
    faults: Arc<Faults>,
}

impl FaultyConnector {
    pub fn new(store: &MemoryStore, options: MemoryOptions) -> (Self, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        let connector = Self {
            store: store.clone(),
            ephemeral: false,
            options,
            faults: Arc::clone(&faults),
        };
        (connector, faults)
    }

    /// Clients whose data lives and dies with their connection.
    pub fn ephemeral(options: MemoryOptions) -> (Self, Arc<Faults>) {
        let (mut connector, faults) = Self::new(&MemoryStore::new(), options);
        connector.ephemeral = true;
        (connector, faults)
    }
}

impl Connector for FaultyConnector {
    type Client = FaultyEngine;

    fn create(&self) -> FaultyEngine {
        let id = self.faults.created.fetch_add(1, Ordering::SeqCst);
        let store = if self.ephemeral {
            MemoryStore::new()
        } else {
            self.store.clone()
        };
        FaultyEngine {
            inner: MemoryEngine::new(store, self.options),
            faults: Arc::clone(&self.faults),
            id,
        }
    }
}

/// A client that bootstraps but panics on any data statement.
pub struct UnreachableEngine;

#[async_trait]
impl EngineClient for UnreachableEngine {
    fn name(&self) -> &str {
        "unreachable"
    }

    fn traits(&self) -> EngineTraits {
        EngineTraits {
            upsert: UpsertSupport::ClientLoop,
            batch: BatchStrategy::Pipelined,
            rollback_on_error: true,
        }
    }

    async fn connect(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError> {
        panic!("statement reached the engine: {statement:?}");
    }

    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError> {
        match statement {
            RawStatement::CreateStore | RawStatement::InstallUpsertRoutine => Ok(()),
            other => panic!("statement reached the engine: {other:?}"),
        }
    }

    async fn execute_composite(&self, statements: &[Statement]) -> Result<(), EngineError> {
        panic!("batch reached the engine: {statements:?}");
    }
}

#[derive(Clone, Copy)]
pub struct UnreachableConnector;

impl Connector for UnreachableConnector {
    type Client = UnreachableEngine;

    fn create(&self) -> UnreachableEngine {
        UnreachableEngine
    }
}
