// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The uniform key-value interface.
//
// Callers program against `KeyValueStore` only. The engine behind it is
// chosen by configuration (see `crate::open`) and can be swapped without
// touching caller code.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::Operation;

/// A key-value store with point operations and atomic batches.
///
/// Keys are at most [`crate::MAX_KEY_LEN`] bytes; values are opaque strings.
/// Implementations must be safe to share across threads and tokio tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Connect and make sure the schema exists. Safe to call again on an
    /// already-bootstrapped store.
    async fn init(&self) -> Result<(), StoreError>;

    /// Retrieve the value associated with `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist, rather than an error.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a key-value pair, overwriting any previous value for `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete the value associated with `key`. Deleting an absent key
    /// succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Apply every operation in `batch`, or none of them.
    async fn do_bulk(&self, batch: &[Operation]) -> Result<(), StoreError>;

    /// Release the connection. No further operations may be issued.
    async fn close(&self) -> Result<(), StoreError>;

    /// A human-readable name for the backing engine.
    fn engine_name(&self) -> &str;
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
    async fn init(&self) -> Result<(), StoreError> {
        (**self).init().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key).await
    }

    async fn do_bulk(&self, batch: &[Operation]) -> Result<(), StoreError> {
        (**self).do_bulk(batch).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }

    fn engine_name(&self) -> &str {
        (**self).engine_name()
    }
}
