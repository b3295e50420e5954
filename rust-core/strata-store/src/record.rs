// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Records, operations and key validation.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Maximum key length in bytes, matching the `VARCHAR(100)` key column.
pub const MAX_KEY_LEN: usize = 100;

/// A single stored key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: String,
}

/// One mutation, either on its own or as an element of a batch.
///
/// Serialized as `{"type": "set", "key": ..., "value": ...}` or
/// `{"type": "remove", "key": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Set { key: String, value: String },
    Remove { key: String },
}

impl Operation {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Operation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Operation::Remove { key: key.into() }
    }

    /// The key this operation targets.
    pub fn key(&self) -> &str {
        match self {
            Operation::Set { key, .. } | Operation::Remove { key } => key,
        }
    }
}

/// Reject keys longer than [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLong {
            size: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

/// Validate every key a batch would write.
///
/// Remove keys are not checked: deleting a key that could never have been
/// stored is a no-op.
pub fn validate_batch(batch: &[Operation]) -> StoreResult<()> {
    batch.iter().try_for_each(|op| match op {
        Operation::Set { key, .. } => validate_key(key),
        Operation::Remove { .. } => Ok(()),
    })
}
