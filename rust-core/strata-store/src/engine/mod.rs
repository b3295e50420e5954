// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine client abstraction.
//
// An engine client is the opaque driver capability the store adapter is built
// on. It executes parameterized statements against the single `store` table,
// executes raw statements (bootstrap DDL and transaction control), connects
// and disconnects, and optionally exposes drain pause/resume on its transport.
//
// Statements are typed values rather than SQL text. Each engine renders them
// in its own dialect with bound parameters, so no key or value is ever
// interpolated into statement text.
//
// # Engines
//
// - [`memory`] -- in-process engine over a shared `MemoryStore` (always built).
// - `redb` -- embedded single-file engine (feature `redb-backend`).
// - `sqlite` -- embedded SQLite engine (feature `sqlite`).
// - `postgres` -- relational server with a server-side upsert routine
//   (feature `postgres`).

use async_trait::async_trait;

use crate::error::EngineError;

pub mod memory;

#[cfg(feature = "redb-backend")]
pub mod redb;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Name of the table every engine stores records in.
pub const STORE_TABLE: &str = "store";

/// Name of the server-side upsert routine installed by engines that
/// advertise [`UpsertSupport::ServerRoutine`].
pub const UPSERT_ROUTINE: &str = "upsert_key";

/// A parameterized statement against the store table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Read the value column for `key`. Returns rows.
    Select { key: String },
    /// Overwrite the value of an existing row. Returns rows affected.
    Update { key: String, value: String },
    /// Insert a new row; fails with `UniqueViolation` if `key` exists.
    Insert { key: String, value: String },
    /// Delete the row for `key` if present. Returns rows affected.
    Delete { key: String },
    /// Atomic insert-or-update, only valid on engines whose
    /// [`EngineTraits::upsert`] is not [`UpsertSupport::ClientLoop`].
    Upsert { key: String, value: String },
}

impl Statement {
    /// The key this statement is bound to.
    pub fn key(&self) -> &str {
        match self {
            Statement::Select { key }
            | Statement::Update { key, .. }
            | Statement::Insert { key, .. }
            | Statement::Delete { key }
            | Statement::Upsert { key, .. } => key,
        }
    }
}

/// A statement with no bound parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatement {
    /// Create the store table. Engines report `AlreadyExists` (or succeed)
    /// when it is already there.
    CreateStore,
    /// Install the server-side upsert routine.
    InstallUpsertRoutine,
    Begin,
    Commit,
    Rollback,
}

/// What an executed statement produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Value column of every matching row.
    Rows(Vec<String>),
    /// Number of rows written or deleted.
    Affected(u64),
}

impl Outcome {
    /// Rows affected; a row set counts its rows.
    pub fn rows_affected(&self) -> u64 {
        match self {
            Outcome::Rows(rows) => rows.len() as u64,
            Outcome::Affected(n) => *n,
        }
    }

    /// The returned rows; an affected count yields none.
    pub fn into_rows(self) -> Vec<String> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Affected(_) => Vec::new(),
        }
    }
}

/// How an engine supports insert-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertSupport {
    /// No native primitive: the adapter runs the update/insert retry loop.
    ClientLoop,
    /// A single atomic statement handled by the engine itself.
    Native,
    /// A routine installed during `init` and called per `set`.
    ServerRoutine,
}

/// How an engine applies a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// All statements submitted in one call and run in one transaction.
    Composite,
    /// `BEGIN`, one call per statement, then `COMMIT` or `ROLLBACK`.
    Pipelined,
}

/// Static capabilities advertised by an engine client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTraits {
    pub upsert: UpsertSupport,
    pub batch: BatchStrategy,
    /// True when a failed composite call leaves no open transaction behind,
    /// so the adapter need not issue its own `ROLLBACK`.
    pub rollback_on_error: bool,
}

/// Driver capability for one connection to a backing engine.
///
/// A client object is single-use with respect to connections: once its
/// transport fails the adapter disconnects it and asks its [`Connector`] for
/// a new one rather than reconnecting the old object.
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    /// A human-readable engine name, used in logging.
    fn name(&self) -> &str;

    /// Capabilities of this engine.
    fn traits(&self) -> EngineTraits;

    /// Establish the connection.
    async fn connect(&self) -> Result<(), EngineError>;

    /// Release the connection and its transport. Must be safe to call on a
    /// client whose connection has already failed.
    async fn disconnect(&self) -> Result<(), EngineError>;

    /// False once the engine has signalled that its transport died in the
    /// background.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Execute one parameterized statement.
    async fn execute(&self, statement: &Statement) -> Result<Outcome, EngineError>;

    /// Execute one raw statement.
    async fn execute_raw(&self, statement: RawStatement) -> Result<(), EngineError>;

    /// Execute `statements` as one transaction in a single call.
    ///
    /// Only engines advertising [`BatchStrategy::Composite`] implement this.
    async fn execute_composite(&self, statements: &[Statement]) -> Result<(), EngineError> {
        let _ = statements;
        Err(EngineError::unsupported(format!(
            "{} does not execute composite statements",
            self.name()
        )))
    }

    async fn begin(&self) -> Result<(), EngineError> {
        self.execute_raw(RawStatement::Begin).await
    }

    async fn commit(&self) -> Result<(), EngineError> {
        self.execute_raw(RawStatement::Commit).await
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        self.execute_raw(RawStatement::Rollback).await
    }

    /// Suppress drain/flow-control signalling on the transport.
    fn pause_drain(&self) {}

    /// Restore drain/flow-control signalling on the transport.
    fn resume_drain(&self) {}
}

/// Builds fresh, unconnected engine clients.
pub trait Connector: Send + Sync + 'static {
    type Client: EngineClient;

    /// Construct a new client. Connecting is left to the adapter.
    fn create(&self) -> Self::Client;
}
