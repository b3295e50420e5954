// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Batch transaction controller.
//!
//! Applies an ordered list of [`Operation`]s so that either all of them take
//! effect or none do. The engine's [`BatchStrategy`] picks how:
//!
//! - **Composite**: every operation becomes one parameterized statement and
//!   the whole list is handed to the engine in a single call, which runs it
//!   inside one transaction. If the call fails and the engine does not roll
//!   back on its own, an explicit `ROLLBACK` follows.
//! - **Pipelined**: `BEGIN`, one call per operation, stopping at the first
//!   failure, then `ROLLBACK`; or `COMMIT` when every operation succeeded.
//!
//! In both strategies the connection's drain signalling is paused for the
//! duration of the batch by a [`DrainGuard`], whose `Drop` resumes it on
//! every exit path, including a dropped future. A dropped pipelined batch
//! can still leave its transaction open on the client; the adapter marks the
//! slot before calling [`apply`] and discards the client if the mark is never
//! cleared.
//!
//! # Batch State Machine
//!
//! ```text
//! ┌──────┐  begin   ┌─────────────────┐  all ok   ┌────────────┐     ┌───────────┐
//! │ Idle │ ───────> │ TransactionOpen │ ────────> │ Committing │ ──> │ Committed │
//! └──────┘          └─────────────────┘           └────────────┘     └───────────┘
//!                            │ first failure            │ commit failed
//!                            ▼                          ▼
//!                     ┌─────────────┐            ┌────────────┐
//!                     │ RollingBack │ ─────────> │ RolledBack │
//!                     └─────────────┘            └────────────┘
//! ```

use tracing::{debug, warn};

use crate::engine::{BatchStrategy, EngineClient, Statement, UpsertSupport};
use crate::error::EngineError;
use crate::record::Operation;
use crate::upsert::{self, UpsertBackoff};

/// Where a batch currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    TransactionOpen,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl BatchPhase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: BatchPhase) -> bool {
        use BatchPhase::*;
        matches!(
            (self, next),
            (Idle, TransactionOpen)
                | (TransactionOpen, Committing)
                | (TransactionOpen, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchPhase::Committed | BatchPhase::RolledBack)
    }
}

/// Tracks the phase of one batch and rejects illegal transitions.
#[derive(Debug)]
struct PhaseTracker {
    phase: BatchPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: BatchPhase::Idle,
        }
    }

    fn advance(&mut self, next: BatchPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal batch transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }
}

/// Pauses drain signalling on construction and resumes it on drop.
pub struct DrainGuard<'a, E: EngineClient + ?Sized> {
    client: &'a E,
}

impl<'a, E: EngineClient + ?Sized> DrainGuard<'a, E> {
    pub fn pause(client: &'a E) -> Self {
        client.pause_drain();
        Self { client }
    }
}

impl<E: EngineClient + ?Sized> Drop for DrainGuard<'_, E> {
    fn drop(&mut self) {
        self.client.resume_drain();
    }
}

/// Render an operation as the statement a composite batch submits.
fn composite_statement(op: &Operation) -> Statement {
    match op {
        Operation::Set { key, value } => upsert::upsert_statement(key, value),
        Operation::Remove { key } => Statement::Delete { key: key.clone() },
    }
}

/// Apply `batch` atomically through `client`.
///
/// Returns the first error encountered; in that case no operation of the
/// batch is visible afterwards.
pub(crate) async fn apply<E>(
    client: &E,
    batch: &[Operation],
    backoff: Option<&UpsertBackoff>,
) -> Result<BatchPhase, EngineError>
where
    E: EngineClient + ?Sized,
{
    let _drain = DrainGuard::pause(client);
    let traits = client.traits();

    // A composite call renders sets as upserts, which needs an engine-side
    // primitive. Engines without one fall back to the pipelined path.
    let strategy = match (traits.batch, traits.upsert) {
        (BatchStrategy::Composite, UpsertSupport::ClientLoop) => BatchStrategy::Pipelined,
        (strategy, _) => strategy,
    };

    debug!(
        engine = client.name(),
        operations = batch.len(),
        ?strategy,
        "applying batch"
    );

    match strategy {
        BatchStrategy::Composite => apply_composite(client, batch, traits.rollback_on_error).await,
        BatchStrategy::Pipelined => apply_pipelined(client, batch, backoff).await,
    }
}

async fn apply_composite<E>(
    client: &E,
    batch: &[Operation],
    rollback_on_error: bool,
) -> Result<BatchPhase, EngineError>
where
    E: EngineClient + ?Sized,
{
    let mut tracker = PhaseTracker::new();
    let statements: Vec<Statement> = batch.iter().map(composite_statement).collect();

    tracker.advance(BatchPhase::TransactionOpen);
    match client.execute_composite(&statements).await {
        Ok(()) => {
            tracker.advance(BatchPhase::Committing);
            tracker.advance(BatchPhase::Committed);
            Ok(tracker.phase)
        }
        Err(err) => {
            tracker.advance(BatchPhase::RollingBack);
            if !rollback_on_error && !err.is_connection() {
                if let Err(rollback_err) = client.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed batch also failed");
                }
            }
            tracker.advance(BatchPhase::RolledBack);
            Err(err)
        }
    }
}

async fn apply_pipelined<E>(
    client: &E,
    batch: &[Operation],
    backoff: Option<&UpsertBackoff>,
) -> Result<BatchPhase, EngineError>
where
    E: EngineClient + ?Sized,
{
    let mut tracker = PhaseTracker::new();

    client.begin().await?;
    tracker.advance(BatchPhase::TransactionOpen);

    let mut failure = None;
    for (index, op) in batch.iter().enumerate() {
        let result = match op {
            Operation::Set { key, value } => upsert::upsert(client, key, value, backoff).await,
            Operation::Remove { key } => client
                .execute(&Statement::Delete { key: key.clone() })
                .await
                .map(|_| ()),
        };
        if let Err(err) = result {
            debug!(index, key = op.key(), error = %err, "batch operation failed, skipping the rest");
            failure = Some(err);
            break;
        }
    }

    let err = match failure {
        None => {
            tracker.advance(BatchPhase::Committing);
            match client.commit().await {
                Ok(()) => {
                    tracker.advance(BatchPhase::Committed);
                    return Ok(tracker.phase);
                }
                Err(err) => err,
            }
        }
        Some(err) => err,
    };

    tracker.advance(BatchPhase::RollingBack);
    if !err.is_connection() {
        if let Err(rollback_err) = client.rollback().await {
            warn!(error = %rollback_err, "rollback after failed batch also failed");
        }
    }
    tracker.advance(BatchPhase::RolledBack);
    Err(err)
}
