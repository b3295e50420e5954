// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! The store adapter.
//!
//! [`StoreAdapter`] implements [`KeyValueStore`] on top of one engine client
//! obtained from a [`Connector`]. It owns the client's lifecycle, dispatches
//! `set` to the upsert procedure and `do_bulk` to the batch controller, and
//! recovers from connection loss.
//!
//! # Connection Slot
//!
//! The client sits in an async read-write slot. Point operations share it;
//! a batch, `init`, `close` and recovery take it exclusively, so nothing else
//! issued through this adapter interleaves with an open batch.
//!
//! # Recovery
//!
//! When a statement fails with a connection error, the adapter disconnects
//! the failed client, asks the connector for a fresh one, and returns the
//! error. The fresh client is connected by the next operation (or `init`),
//! which also re-runs the idempotent bootstrap once the store has been
//! initialized, so an engine whose data lives in the connection (SQLite
//! `:memory:`) is usable again straight away. The failed operation is never
//! replayed.
//!
//! A batch whose future is dropped before it finishes (a caller-side timeout,
//! say) may leave `BEGIN` open on the client. The slot remembers that, and the
//! client is discarded before anything else runs on it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::batch;
use crate::config::StoreConfig;
use crate::engine::{Connector, EngineClient, RawStatement, Statement, UpsertSupport};
use crate::error::{EngineError, EngineErrorKind, StoreError, StoreResult};
use crate::metrics::{MetricEvent, MetricKind, MetricsObserver, NoopObserver};
use crate::record::{validate_batch, validate_key, Operation};
use crate::store::KeyValueStore;
use crate::upsert;

/// The adapter's view of its current engine client.
struct Connection<E> {
    client: Arc<E>,
    connected: bool,
    /// Bootstrap has completed at least once.
    ready: bool,
    closed: bool,
    /// A batch started on this client and never finished; its transaction
    /// may still be open.
    batch_open: bool,
    /// Number of clients replaced so far.
    generation: u64,
}

impl<E> Connection<E> {
    fn new(client: E) -> Self {
        Self {
            client: Arc::new(client),
            connected: false,
            ready: false,
            closed: false,
            batch_open: false,
            generation: 0,
        }
    }

    fn check_usable(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else if !self.ready {
            Err(StoreError::NotInitialized)
        } else {
            Ok(())
        }
    }
}

/// A [`KeyValueStore`] over any engine a [`Connector`] can produce.
pub struct StoreAdapter<C: Connector> {
    connector: C,
    config: StoreConfig,
    engine_name: String,
    conn: RwLock<Connection<C::Client>>,
    observer: Arc<dyn MetricsObserver>,
}

impl<C: Connector> StoreAdapter<C> {
    /// Build an adapter. Nothing is connected until [`KeyValueStore::init`].
    pub fn new(connector: C, config: StoreConfig) -> Self {
        let client = connector.create();
        let engine_name = client.name().to_string();
        Self {
            connector,
            config,
            engine_name,
            conn: RwLock::new(Connection::new(client)),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Send timing events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn MetricsObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// How many times the engine client has been replaced.
    pub async fn client_generation(&self) -> u64 {
        self.conn.read().await.generation
    }

    /// Whether the current client holds a live connection.
    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.connected
    }

    fn observe<T>(&self, kind: MetricKind, started: Instant, result: &StoreResult<T>) {
        self.observer.record(MetricEvent {
            kind,
            elapsed: started.elapsed(),
            succeeded: result.is_ok(),
        });
    }

    /// Drop the current client and install a fresh, unconnected one.
    async fn replace_client(&self, conn: &mut Connection<C::Client>) {
        if let Err(err) = conn.client.disconnect().await {
            warn!(engine = %self.engine_name, error = %err, "failed to release stale connection");
        }
        conn.client = Arc::new(self.connector.create());
        conn.connected = false;
        conn.batch_open = false;
        conn.generation += 1;
        warn!(
            engine = %self.engine_name,
            generation = conn.generation,
            "connection lost, engine client recreated"
        );
    }

    /// Replace `failed` unless another task already did.
    async fn recover(&self, failed: &Arc<C::Client>) {
        let mut conn = self.conn.write().await;
        if !conn.closed && Arc::ptr_eq(&conn.client, failed) {
            self.replace_client(&mut conn).await;
        }
    }

    /// Pass a point-operation result through, recovering on connection loss.
    async fn settle<T>(
        &self,
        client: &Arc<C::Client>,
        result: Result<T, EngineError>,
    ) -> StoreResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_connection() {
                    self.recover(client).await;
                }
                Err(StoreError::from_statement(err))
            }
        }
    }

    async fn ensure_connected(&self, conn: &mut Connection<C::Client>) -> StoreResult<()> {
        if conn.batch_open {
            warn!(
                engine = %self.engine_name,
                generation = conn.generation,
                "batch abandoned mid-transaction, discarding client"
            );
            self.replace_client(conn).await;
        } else if conn.connected && !conn.client.is_healthy() {
            self.replace_client(conn).await;
        }
        if !conn.connected {
            if let Err(err) = conn.client.connect().await {
                self.replace_client(conn).await;
                return Err(StoreError::Connection(err.to_string()));
            }
            if conn.ready {
                let bootstrapped = bootstrap(conn.client.as_ref()).await;
                if let Err(err) = bootstrapped {
                    self.replace_client(conn).await;
                    return Err(StoreError::from_bootstrap(err));
                }
            }
            conn.connected = true;
            debug!(engine = %self.engine_name, generation = conn.generation, "engine connected");
        }
        Ok(())
    }

    /// Shared access to a connected client.
    async fn shared(&self) -> StoreResult<RwLockReadGuard<'_, Connection<C::Client>>> {
        {
            let conn = self.conn.read().await;
            conn.check_usable()?;
            if conn.connected && !conn.batch_open && conn.client.is_healthy() {
                return Ok(conn);
            }
        }
        Ok(self.exclusive().await?.downgrade())
    }

    /// Exclusive access to a connected client.
    async fn exclusive(&self) -> StoreResult<RwLockWriteGuard<'_, Connection<C::Client>>> {
        let mut conn = self.conn.write().await;
        conn.check_usable()?;
        self.ensure_connected(&mut conn).await?;
        Ok(conn)
    }

    async fn run_init(&self) -> StoreResult<()> {
        let mut conn = self.conn.write().await;
        if conn.closed {
            return Err(StoreError::Closed);
        }
        self.ensure_connected(&mut conn).await?;

        let client = Arc::clone(&conn.client);
        if let Err(err) = bootstrap(client.as_ref()).await {
            if err.is_connection() {
                self.replace_client(&mut conn).await;
            }
            return Err(StoreError::from_bootstrap(err));
        }

        conn.ready = true;
        info!(engine = %self.engine_name, "store initialized");
        Ok(())
    }

    async fn run_get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.shared().await?;
        let client = Arc::clone(&conn.client);
        let result = client
            .execute(&Statement::Select {
                key: key.to_string(),
            })
            .await;
        drop(conn);

        let mut rows = self.settle(&client, result).await?.into_rows();
        match rows.len() {
            0 | 1 => Ok(rows.pop()),
            n => Err(StoreError::InvariantViolation(format!(
                "{n} rows for primary key {key:?}"
            ))),
        }
    }

    async fn run_set(&self, key: &str, value: &str) -> StoreResult<()> {
        validate_key(key)?;
        let conn = self.shared().await?;
        let client = Arc::clone(&conn.client);
        let result = upsert::upsert(
            client.as_ref(),
            key,
            value,
            self.config.upsert_backoff.as_ref(),
        )
        .await;
        drop(conn);

        self.settle(&client, result).await
    }

    async fn run_remove(&self, key: &str) -> StoreResult<()> {
        let conn = self.shared().await?;
        let client = Arc::clone(&conn.client);
        let result = client
            .execute(&Statement::Delete {
                key: key.to_string(),
            })
            .await;
        drop(conn);

        self.settle(&client, result).await.map(|_| ())
    }

    async fn run_bulk(&self, ops: &[Operation]) -> StoreResult<()> {
        validate_batch(ops)?;
        if ops.is_empty() {
            return self.conn.read().await.check_usable();
        }

        let mut conn = self.exclusive().await?;
        let client = Arc::clone(&conn.client);
        // Cleared only if the batch runs to completion.
        conn.batch_open = true;
        let result = batch::apply(client.as_ref(), ops, self.config.upsert_backoff.as_ref()).await;
        conn.batch_open = false;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                if err.is_connection() {
                    self.replace_client(&mut conn).await;
                }
                Err(StoreError::from_batch(err))
            }
        }
    }
}

/// Create the store table and, where the engine needs it, the upsert routine.
/// Objects that already exist count as created.
async fn bootstrap<E: EngineClient + ?Sized>(client: &E) -> Result<(), EngineError> {
    let mut steps = vec![RawStatement::CreateStore];
    if client.traits().upsert == UpsertSupport::ServerRoutine {
        steps.push(RawStatement::InstallUpsertRoutine);
    }

    for step in steps {
        match client.execute_raw(step).await {
            Ok(()) => {}
            Err(err) if err.kind() == EngineErrorKind::AlreadyExists => {
                debug!(?step, "bootstrap object already exists");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[async_trait]
impl<C: Connector> KeyValueStore for StoreAdapter<C> {
    async fn init(&self) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.run_init().await;
        self.observe(MetricKind::Init, started, &result);
        result
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let started = Instant::now();
        let result = self.run_get(key).await;
        self.observe(MetricKind::Get, started, &result);
        result
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.run_set(key, value).await;
        self.observe(MetricKind::Set, started, &result);
        result
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.run_remove(key).await;
        self.observe(MetricKind::Remove, started, &result);
        result
    }

    async fn do_bulk(&self, batch: &[Operation]) -> StoreResult<()> {
        let started = Instant::now();
        let result = self.run_bulk(batch).await;
        self.observe(MetricKind::Bulk, started, &result);
        result
    }

    async fn close(&self) -> StoreResult<()> {
        let mut conn = self.conn.write().await;
        if conn.closed {
            return Ok(());
        }
        if conn.connected {
            if let Err(err) = conn.client.disconnect().await {
                warn!(engine = %self.engine_name, error = %err, "disconnect failed during close");
            }
        }
        conn.connected = false;
        conn.closed = true;
        info!(engine = %self.engine_name, "store closed");
        Ok(())
    }

    fn engine_name(&self) -> &str {
        &self.engine_name
    }
}
