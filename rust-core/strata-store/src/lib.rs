// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Strata Store Adapter
//
// This crate provides a uniform key-value interface over interchangeable
// backing engines. The `KeyValueStore` trait defines the contract callers
// program against; `StoreAdapter` implements it on top of any engine client,
// and `open` picks the engine from configuration.
//
// # Modules
//
// - [`store`] -- The `KeyValueStore` trait.
// - [`adapter`] -- `StoreAdapter`: lifecycle, dispatch and connection recovery.
// - [`engine`] -- The `EngineClient`/`Connector` traits and the engines.
// - [`upsert`] -- Insert-or-update, including the client-side race loop.
// - [`batch`] -- All-or-nothing batches and the drain guard.
// - [`metrics`] -- Timing events and observers.
// - [`config`] -- Immutable store configuration.
// - [`record`] -- Records, operations and key validation.
// - [`typed`] -- A serde-based typed wrapper with namespace prefixing.
// - [`error`] -- `StoreError` and `EngineError`.
//
// # Example
//
// ```rust
// use strata_store::{open, KeyValueStore, Operation, StoreConfig};
//
// # tokio_test::block_on(async {
// let store = open(&StoreConfig::memory()).unwrap();
// store.init().await.unwrap();
//
// store.set("greeting", "hello").await.unwrap();
// store
//     .do_bulk(&[Operation::set("a", "1"), Operation::remove("greeting")])
//     .await
//     .unwrap();
//
// assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
// assert_eq!(store.get("greeting").await.unwrap(), None);
// store.close().await.unwrap();
// # });
// ```

pub mod adapter;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod record;
pub mod store;
pub mod typed;
pub mod upsert;

use std::sync::Arc;

pub use adapter::StoreAdapter;
pub use config::{EngineConfig, StoreConfig, TuningHints, ValueEncoding};
pub use engine::memory::{MemoryConnector, MemoryEngine, MemoryStore};
pub use engine::{Connector, EngineClient};
pub use error::{EngineError, EngineErrorKind, StoreError, StoreResult};
pub use metrics::{
    BackendStats, ChannelObserver, MetricEvent, MetricKind, MetricsObserver, NoopObserver,
    StatsObserver, TracingObserver,
};
pub use record::{Operation, Record, MAX_KEY_LEN};
pub use store::KeyValueStore;
pub use typed::TypedStore;

#[cfg(feature = "redb-backend")]
pub use engine::redb::{RedbConnector, RedbEngine};

#[cfg(feature = "sqlite")]
pub use engine::sqlite::{SqliteConnector, SqliteEngine};

#[cfg(feature = "postgres")]
pub use engine::postgres::{PostgresConnector, PostgresEngine};

/// Open a store for the configured engine, reporting timings to `tracing`.
///
/// The store still needs [`KeyValueStore::init`] before use.
pub fn open(config: &StoreConfig) -> StoreResult<Box<dyn KeyValueStore>> {
    open_with_observer(config, Arc::new(TracingObserver))
}

/// Open a store for the configured engine with a custom metrics observer.
pub fn open_with_observer(
    config: &StoreConfig,
    observer: Arc<dyn MetricsObserver>,
) -> StoreResult<Box<dyn KeyValueStore>> {
    config.validate()?;
    tracing::debug!(engine = config.engine.name(), "opening store");

    match &config.engine {
        EngineConfig::Memory => Ok(Box::new(
            StoreAdapter::new(MemoryConnector::new(MemoryStore::new()), config.clone())
                .with_observer(observer),
        )),

        #[cfg(feature = "redb-backend")]
        EngineConfig::Redb { path } => Ok(Box::new(
            StoreAdapter::new(RedbConnector::new(path.clone()), config.clone())
                .with_observer(observer),
        )),

        #[cfg(feature = "sqlite")]
        EngineConfig::Sqlite { filename } => Ok(Box::new(
            StoreAdapter::new(SqliteConnector::new(filename.clone()), config.clone())
                .with_observer(observer),
        )),

        #[cfg(feature = "postgres")]
        EngineConfig::Postgres { url } => Ok(Box::new(
            StoreAdapter::new(PostgresConnector::new(url.clone()), config.clone())
                .with_observer(observer),
        )),

        #[allow(unreachable_patterns)]
        other => Err(StoreError::Config(format!(
            "engine '{}' is not compiled in; enable the matching cargo feature",
            other.name()
        ))),
    }
}
