// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PostgreSQL engine for Strata.
//
// One tokio-postgres client per engine. The connection future runs on its own
// task and flips a `broken` flag when it ends, which `is_healthy` reports so
// the adapter can swap the client before the next operation.
//
// Upserts go through a server-side plpgsql routine installed during `init`.
// Batches are pipelined inside explicit BEGIN/COMMIT; a failed transaction is
// left aborted by the server, so the caller must issue ROLLBACK itself.

use std::error::Error as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::engine::{
    BatchStrategy, Connector, EngineClient, EngineTraits, Outcome, RawStatement, Statement,
    UpsertSupport,
};
use crate::error::{EngineError, EngineErrorKind};

const CREATE_STORE: &str = r#"CREATE TABLE "store" (
    "key" VARCHAR(100) NOT NULL PRIMARY KEY,
    "value" TEXT NOT NULL
)"#;

// Retries UPDATE then INSERT until one of them lands; a concurrent insert of
// the same key surfaces as unique_violation and sends it round again.
const CREATE_UPSERT_ROUTINE: &str = r#"CREATE FUNCTION upsert_key(_key VARCHAR, data TEXT) RETURNS VOID AS $$
BEGIN
    LOOP
        UPDATE "store" SET "value" = data WHERE "key" = _key;
        IF found THEN
            RETURN;
        END IF;
        BEGIN
            INSERT INTO "store" ("key", "value") VALUES (_key, data);
            RETURN;
        EXCEPTION WHEN unique_violation THEN
        END;
    END LOOP;
END;
$$ LANGUAGE plpgsql"#;

const SELECT: &str = r#"SELECT "value" FROM "store" WHERE "key" = $1"#;
const UPDATE: &str = r#"UPDATE "store" SET "value" = $2 WHERE "key" = $1"#;
const INSERT: &str = r#"INSERT INTO "store" ("key", "value") VALUES ($1, $2)"#;
const DELETE: &str = r#"DELETE FROM "store" WHERE "key" = $1"#;
const UPSERT: &str = "SELECT upsert_key($1, $2)";

/// Map a tokio-postgres error onto the engine error kinds the adapter reacts to.
fn classify(err: tokio_postgres::Error) -> EngineError {
    let transport =
        err.is_closed() || err.source().is_some_and(|source| source.is::<std::io::Error>());
    EngineError::new(error_kind(err.code(), transport), err.to_string())
}

/// `transport` marks a closed client or a failed socket.
fn error_kind(code: Option<&SqlState>, transport: bool) -> EngineErrorKind {
    if transport {
        return EngineErrorKind::Connection;
    }
    match code {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => EngineErrorKind::UniqueViolation,
        Some(code)
            if *code == SqlState::DUPLICATE_TABLE
                || *code == SqlState::DUPLICATE_FUNCTION
                || *code == SqlState::DUPLICATE_OBJECT =>
        {
            EngineErrorKind::AlreadyExists
        }
        // Parameter encoding and row decoding fail client-side, without a SQLSTATE.
        _ => EngineErrorKind::Statement,
    }
}

/// An engine client over one PostgreSQL connection.
pub struct PostgresEngine {
    url: String,
    client: RwLock<Option<Arc<Client>>>,
    broken: Arc<AtomicBool>,
}

impl PostgresEngine {
    /// Create an unconnected client for a libpq-style connection string or URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn client(&self) -> Result<Arc<Client>, EngineError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::connection("postgres client is not connected"))
    }
}

impl std::fmt::Debug for PostgresEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The url may carry a password.
        f.debug_struct("PostgresEngine")
            .field("broken", &self.broken.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EngineClient for PostgresEngine {
    fn name(&self) -> &str {
        "postgres"
    }

    fn traits(&self) -> EngineTraits {
        EngineTraits {
            upsert: UpsertSupport::ServerRoutine,
            batch: BatchStrategy::Pipelined,
            rollback_on_error: false,
        }
    }

    async fn connect(&self) -> Result<(), EngineError> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| EngineError::connection(e.to_string()))?;

        self.broken.store(false, Ordering::SeqCst);
        let broken = Arc::clone(&self.broken);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection ended with error");
            }
            broken.store(true, Ordering::SeqCst);
        });

        debug!("connected postgres engine");
        *slot = Some(Arc::new(client));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        // Dropping the last client handle ends the connection task.
        self.client.write().await.take();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError> {
        let client = self.client().await?;
        let affected = match statement {
            Statement::Select { key } => {
                let rows = client.query(SELECT, &[key]).await.map_err(classify)?;
                let values = rows
                    .iter()
                    .map(|row| row.try_get::<_, String>(0))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| EngineError::statement(e.to_string()))?;
                return Ok(Outcome::Rows(values));
            }
            Statement::Update { key, value } => client.execute(UPDATE, &[key, value]).await,
            Statement::Insert { key, value } => client.execute(INSERT, &[key, value]).await,
            Statement::Delete { key } => client.execute(DELETE, &[key]).await,
            Statement::Upsert { key, value } => client.execute(UPSERT, &[key, value]).await,
        }
        .map_err(classify)?;
        Ok(Outcome::Affected(affected))
    }

    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError> {
        let sql = match statement {
            RawStatement::CreateStore => CREATE_STORE,
            RawStatement::InstallUpsertRoutine => CREATE_UPSERT_ROUTINE,
            RawStatement::Begin => "BEGIN",
            RawStatement::Commit => "COMMIT",
            RawStatement::Rollback => "ROLLBACK",
        };
        let client = self.client().await?;
        client.batch_execute(sql).await.map_err(classify)
    }
}

/// Creates [`PostgresEngine`] clients for one server.
#[derive(Clone)]
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector").finish_non_exhaustive()
    }
}

impl Connector for PostgresConnector {
    type Client = PostgresEngine;

    fn create(&self) -> PostgresEngine {
        PostgresEngine::new(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StoreAdapter;
    use crate::config::StoreConfig;
    use crate::error::StoreError;
    use crate::record::Operation;
    use crate::store::KeyValueStore;

    /// Server tests run only when `STRATA_TEST_POSTGRES_URL` points at a
    /// disposable database.
    fn test_url() -> Option<String> {
        std::env::var("STRATA_TEST_POSTGRES_URL").ok()
    }

    #[test]
    fn test_traits() {
        let engine = PostgresEngine::new("host=localhost");
        let traits = engine.traits();
        assert_eq!(traits.upsert, UpsertSupport::ServerRoutine);
        assert_eq!(traits.batch, BatchStrategy::Pipelined);
        assert!(!traits.rollback_on_error);
        assert!(engine.is_healthy());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            error_kind(Some(&SqlState::UNIQUE_VIOLATION), false),
            EngineErrorKind::UniqueViolation
        );
        assert_eq!(
            error_kind(Some(&SqlState::DUPLICATE_FUNCTION), false),
            EngineErrorKind::AlreadyExists
        );
        assert_eq!(
            error_kind(Some(&SqlState::SYNTAX_ERROR), false),
            EngineErrorKind::Statement
        );
        // A client-side failure keeps the connection.
        assert_eq!(error_kind(None, false), EngineErrorKind::Statement);
        assert_eq!(error_kind(None, true), EngineErrorKind::Connection);
        assert_eq!(
            error_kind(Some(&SqlState::UNIQUE_VIOLATION), true),
            EngineErrorKind::Connection
        );
    }

    #[tokio::test]
    async fn test_unconnected_client_reports_connection_error() {
        let engine = PostgresEngine::new("host=127.0.0.1 port=1 user=strata connect_timeout=1");
        let err = engine
            .execute(&Statement::Select { key: "k".into() })
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert!(engine.connect().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_init_failure_is_connection_error() {
        let url = "host=127.0.0.1 port=1 user=strata connect_timeout=1";
        let adapter = StoreAdapter::new(PostgresConnector::new(url), StoreConfig::postgres(url));
        assert!(matches!(adapter.init().await, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_round_trip_against_server() {
        let Some(url) = test_url() else {
            return;
        };
        let adapter = StoreAdapter::new(PostgresConnector::new(&url), StoreConfig::postgres(&url));
        adapter.init().await.unwrap();
        // Routine and table already exist the second time round.
        adapter.init().await.unwrap();

        adapter.set("strata-test:c", "old").await.unwrap();
        adapter.set("strata-test:c", "new").await.unwrap();
        assert_eq!(
            adapter.get("strata-test:c").await.unwrap().as_deref(),
            Some("new")
        );

        adapter
            .do_bulk(&[
                Operation::set("strata-test:a", "1"),
                Operation::remove("strata-test:c"),
            ])
            .await
            .unwrap();
        assert_eq!(
            adapter.get("strata-test:a").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(adapter.get("strata-test:c").await.unwrap(), None);

        adapter.remove("strata-test:a").await.unwrap();
        adapter.close().await.unwrap();
    }
}
