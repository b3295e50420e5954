// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Argument parsing and command dispatch for the `strata` binary.
//
// Every invocation opens the configured store, runs `init`, performs one
// command and closes the store again.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use strata_store::{KeyValueStore, Operation, StoreConfig};
use tracing::info;

/// Strata version string, pulled from Cargo.toml at compile time.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

/// strata: read and write a Strata key-value store.
#[derive(Parser, Debug)]
#[command(name = "strata", version = VERSION, about = "Key-value access to a Strata store")]
pub struct Cli {
    /// JSON store configuration file. Overrides --engine, --path and --url.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Engine to open when no configuration file is given.
    #[arg(long, value_enum, default_value_t = EngineKind::Sqlite)]
    pub engine: EngineKind,

    /// Database file for the redb and sqlite engines.
    #[arg(long, default_value = "strata.db")]
    pub path: PathBuf,

    /// Connection string for the postgres engine.
    #[arg(long, env = "STRATA_POSTGRES_URL")]
    pub url: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    Memory,
    Redb,
    Sqlite,
    Postgres,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the store schema if it does not exist yet.
    Init,
    /// Print the value stored under KEY.
    Get { key: String },
    /// Store VALUE under KEY.
    Set { key: String, value: String },
    /// Delete KEY.
    Remove { key: String },
    /// Apply a JSON array of operations atomically; `-` reads stdin.
    Bulk { file: PathBuf },
}

impl Cli {
    /// Resolve the store configuration from the file or the flags.
    pub fn store_config(&self) -> anyhow::Result<StoreConfig> {
        if let Some(path) = &self.config {
            return StoreConfig::from_path(path)
                .with_context(|| format!("loading configuration from {}", path.display()));
        }

        let config = match self.engine {
            EngineKind::Memory => StoreConfig::memory(),
            EngineKind::Redb => StoreConfig::redb(&self.path),
            EngineKind::Sqlite => StoreConfig::sqlite(self.path.to_string_lossy()),
            EngineKind::Postgres => match &self.url {
                Some(url) => StoreConfig::postgres(url.as_str()),
                None => bail!("the postgres engine needs --url or STRATA_POSTGRES_URL"),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Open the store, run the command and close the store.
pub async fn run(cli: &Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let config = cli.store_config()?;
    let store = strata_store::open(&config).context("opening store")?;
    store.init().await.context("initialising store")?;

    let result = execute(store.as_ref(), &cli.command, out).await;
    store.close().await.context("closing store")?;
    result
}

async fn execute(
    store: &dyn KeyValueStore,
    command: &Command,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Command::Init => {
            info!(engine = store.engine_name(), "store initialised");
        }
        Command::Get { key } => match store.get(key).await? {
            Some(value) => writeln!(out, "{value}")?,
            None => bail!("key {key:?} not found"),
        },
        Command::Set { key, value } => store.set(key, value).await?,
        Command::Remove { key } => store.remove(key).await?,
        Command::Bulk { file } => {
            let batch = read_batch(file)?;
            store.do_bulk(&batch).await?;
            info!(operations = batch.len(), "batch applied");
        }
    }
    Ok(())
}

fn read_batch(file: &PathBuf) -> anyhow::Result<Vec<Operation>> {
    let text = if file.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading batch from stdin")?;
        text
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("reading batch from {}", file.display()))?
    };
    serde_json::from_str(&text).context("batch must be a JSON array of operations")
}
