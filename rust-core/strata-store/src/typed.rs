// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Typed wrapper for Strata stores.
//
// Provides a serde-based interface on top of any `KeyValueStore`. Values are
// serialized as JSON and all keys are automatically prefixed with a
// configurable namespace, so several logical stores can share one engine
// without key collisions. The prefix counts toward the key length limit.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::record::Operation;
use crate::store::KeyValueStore;

/// A typed wrapper around a [`KeyValueStore`] that handles serialization
/// and namespace prefixing automatically.
///
/// Keys are prefixed with `"{namespace}:"` before being passed to the
/// underlying store. Values are serialized to JSON on write and
/// deserialized on read.
///
/// # Example
///
/// ```rust
/// use strata_store::{MemoryConnector, MemoryStore, StoreAdapter, StoreConfig, KeyValueStore};
/// use strata_store::typed::TypedStore;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Serialize, Deserialize, PartialEq)]
/// struct User { name: String, age: u32 }
///
/// # tokio_test::block_on(async {
/// let adapter = StoreAdapter::new(MemoryConnector::new(MemoryStore::new()), StoreConfig::memory());
/// adapter.init().await.unwrap();
/// let store = TypedStore::new(adapter, "users");
///
/// let alice = User { name: "Alice".into(), age: 30 };
/// store.put("alice", &alice).await.unwrap();
///
/// let retrieved: User = store.get("alice").await.unwrap().unwrap();
/// assert_eq!(retrieved, alice);
/// # });
/// ```
pub struct TypedStore<S: KeyValueStore> {
    store: S,
    namespace: String,
}

impl<S: KeyValueStore> TypedStore<S> {
    /// Create a new typed store wrapping `store` with the given namespace.
    pub fn new(store: S, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
        }
    }

    /// Return a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Return the namespace prefix used by this store.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
        serde_json::to_string(value).map_err(|err| {
            StoreError::Serialization(format!(
                "failed to serialize value for key '{}': {}",
                key, err
            ))
        })
    }

    /// Retrieve and deserialize a value by its logical key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(&self.prefixed_key(key)).await? {
            Some(text) => {
                let value: T = serde_json::from_str(&text).map_err(|err| {
                    StoreError::Serialization(format!(
                        "failed to deserialize value for key '{}': {}",
                        key, err
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serialize and store a value under the given logical key.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let text = Self::encode(key, value)?;
        self.store.set(&self.prefixed_key(key), &text).await
    }

    /// Store several values atomically: all of them land or none do.
    pub async fn put_all<T: Serialize>(&self, entries: &[(&str, T)]) -> Result<(), StoreError> {
        let batch = entries
            .iter()
            .map(|(key, value)| Ok(Operation::set(self.prefixed_key(key), Self::encode(key, value)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.store.do_bulk(&batch).await
    }

    /// Delete a value by its logical key. Deleting an absent key succeeds.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(&self.prefixed_key(key)).await
    }
}
