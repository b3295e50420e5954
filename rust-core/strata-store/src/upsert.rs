// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Insert-or-update against engines with and without an upsert primitive.
//
// Engines with a native statement or a server-side routine get a single
// `Statement::Upsert`. Everything else runs the client-side loop:
//
// ```text
//   UPDATE ──affected 1──> done
//     │ affected 0
//     ▼
//   INSERT ──ok──> done
//     │ unique violation (a concurrent writer inserted first)
//     └──────> back to UPDATE
// ```
//
// The loop has no attempt cap: under contention it repeats only when another
// writer wins the insert race, and each repeat finds the row on its UPDATE
// unless that row was deleted again in between.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{EngineClient, Statement, UpsertSupport};
use crate::error::{EngineError, EngineErrorKind};

/// Optional delay between insert-race retries.
///
/// The delay for retry `n` (1-based) is `base * 2^(n-1)`, capped at `max`.
/// It never bounds the number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertBackoff {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_ms: u64,
}

impl UpsertBackoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let scaled = self.base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(scaled.min(self.max_ms))
    }
}

impl Default for UpsertBackoff {
    fn default() -> Self {
        Self {
            base_ms: 1,
            max_ms: 50,
        }
    }
}

/// Build the single-statement upsert for `key`/`value`.
pub(crate) fn upsert_statement(key: &str, value: &str) -> Statement {
    Statement::Upsert {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Insert `value` under `key`, or overwrite the existing row.
///
/// Never returns a `UniqueViolation`.
pub(crate) async fn upsert<E>(
    client: &E,
    key: &str,
    value: &str,
    backoff: Option<&UpsertBackoff>,
) -> Result<(), EngineError>
where
    E: EngineClient + ?Sized,
{
    if client.traits().upsert != UpsertSupport::ClientLoop {
        client.execute(&upsert_statement(key, value)).await?;
        return Ok(());
    }

    let update = Statement::Update {
        key: key.to_string(),
        value: value.to_string(),
    };
    let insert = Statement::Insert {
        key: key.to_string(),
        value: value.to_string(),
    };

    let mut races: u32 = 0;
    loop {
        if client.execute(&update).await?.rows_affected() > 0 {
            return Ok(());
        }

        match client.execute(&insert).await {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == EngineErrorKind::UniqueViolation => {
                races = races.saturating_add(1);
                debug!(key, races, "insert lost a race with a concurrent writer, retrying update");
                if let Some(backoff) = backoff {
                    tokio::time::sleep(backoff.delay(races)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
