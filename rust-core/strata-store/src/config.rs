// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Store configuration.
//
// A `StoreConfig` is built once (in code or from JSON) and handed to the
// adapter by value; nothing mutates it afterwards. Tuning hints are resolved
// from the selected engine: in-memory databases get no cache and no write
// interval, everything else gets a 1000-entry cache and a 100 ms write
// interval. Values are JSON encoded unless configured otherwise.
//
// ```json
// {
//   "engine": { "type": "postgres", "url": "host=localhost user=strata" },
//   "hints": { "cache": 500 },
//   "upsert_backoff": { "base_ms": 1, "max_ms": 20 }
// }
// ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::upsert::UpsertBackoff;

/// SQLite filename that keeps the database in memory.
pub const SQLITE_IN_MEMORY: &str = ":memory:";

fn sqlite_in_memory() -> String {
    SQLITE_IN_MEMORY.to_string()
}

/// Which engine backs the store, and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineConfig {
    /// Process-local memory engine.
    Memory,
    /// Embedded redb file.
    Redb { path: PathBuf },
    /// Embedded SQLite database; `:memory:` when no filename is given.
    Sqlite {
        #[serde(default = "sqlite_in_memory")]
        filename: String,
    },
    /// Relational server, addressed by a libpq-style connection string or URL.
    Postgres { url: String },
}

impl EngineConfig {
    /// Short engine name used in logs and CLI flags.
    pub fn name(&self) -> &'static str {
        match self {
            EngineConfig::Memory => "memory",
            EngineConfig::Redb { .. } => "redb",
            EngineConfig::Sqlite { .. } => "sqlite",
            EngineConfig::Postgres { .. } => "postgres",
        }
    }

    /// Whether the data lives only as long as the process.
    pub fn is_ephemeral(&self) -> bool {
        match self {
            EngineConfig::Memory => true,
            EngineConfig::Sqlite { filename } => filename == SQLITE_IN_MEMORY,
            EngineConfig::Redb { .. } | EngineConfig::Postgres { .. } => false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Memory
    }
}

/// How callers encode values before storing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueEncoding {
    /// Structured values serialized as JSON.
    Json,
    /// Values stored as given.
    Opaque,
}

/// Advisory hints for the layer above the adapter. The adapter itself does
/// not enforce any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningHints {
    /// Suggested number of cached entries.
    pub cache: usize,
    /// Suggested write-behind interval in milliseconds.
    pub write_interval_ms: u64,
    pub encoding: ValueEncoding,
}

/// Per-field overrides of the engine's default [`TuningHints`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintOverrides {
    pub cache: Option<usize>,
    pub write_interval_ms: Option<u64>,
    pub encoding: Option<ValueEncoding>,
}

/// Immutable configuration for one store adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub hints: HintOverrides,
    /// Delay between upsert insert-race retries. `None` retries at once.
    #[serde(default)]
    pub upsert_backoff: Option<UpsertBackoff>,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn redb(path: impl Into<PathBuf>) -> Self {
        Self::for_engine(EngineConfig::Redb { path: path.into() })
    }

    pub fn sqlite(filename: impl Into<String>) -> Self {
        Self::for_engine(EngineConfig::Sqlite {
            filename: filename.into(),
        })
    }

    pub fn postgres(url: impl Into<String>) -> Self {
        Self::for_engine(EngineConfig::Postgres { url: url.into() })
    }

    fn for_engine(engine: EngineConfig) -> Self {
        Self {
            engine,
            ..Self::default()
        }
    }

    /// Set the upsert retry backoff.
    pub fn with_upsert_backoff(mut self, backoff: UpsertBackoff) -> Self {
        self.upsert_backoff = Some(backoff);
        self
    }

    /// Override the resolved tuning hints.
    pub fn with_hints(mut self, hints: HintOverrides) -> Self {
        self.hints = hints;
        self
    }

    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> StoreResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| StoreError::Config(format!("invalid store configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Reject configurations no engine could open.
    pub fn validate(&self) -> StoreResult<()> {
        match &self.engine {
            EngineConfig::Redb { path } if path.as_os_str().is_empty() => {
                Err(StoreError::Config("redb engine needs a path".into()))
            }
            EngineConfig::Sqlite { filename } if filename.is_empty() => {
                Err(StoreError::Config("sqlite engine needs a filename".into()))
            }
            EngineConfig::Postgres { url } if url.trim().is_empty() => {
                Err(StoreError::Config("postgres engine needs a connection url".into()))
            }
            _ => Ok(()),
        }
    }

    /// Engine defaults with any configured overrides applied.
    pub fn hints(&self) -> TuningHints {
        let (cache, write_interval_ms) = if self.engine.is_ephemeral() {
            (0, 0)
        } else {
            (1000, 100)
        };
        TuningHints {
            cache: self.hints.cache.unwrap_or(cache),
            write_interval_ms: self.hints.write_interval_ms.unwrap_or(write_interval_ms),
            encoding: self.hints.encoding.unwrap_or(ValueEncoding::Json),
        }
    }
}
