//! Command-line front end for a plugos store.
//!
//! Every subcommand is executed as a `store.*` syscall dispatched through a
//! [`System`], so the CLI sees the same registry, policy and error handling
//! a plugin would.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use plugos_host::syscalls::store_syscalls;
use plugos_host::{PolicyEngine, System};
use plugos_storage::KvStore;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Plugin name the CLI's syscalls are resolved for.
pub const CLI_PLUGIN: &str = "plugos-cli";

#[derive(Parser, Debug)]
#[command(name = "plugos")]
#[command(about = "Inspect and edit a plugos key/value store")]
pub struct Args {
    /// SQLite database file
    #[arg(long, default_value = "plugos.db")]
    pub db: PathBuf,

    /// Table holding the key/value records
    #[arg(long, default_value = "store")]
    pub table: String,

    /// Policy file (defaults to ~/.plugos/policy.toml)
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the value stored under a key
    Get { key: String },
    /// Store a value; parsed as JSON, or taken as a plain string otherwise
    Set { key: String, value: String },
    /// Remove a key
    Delete { key: String },
    /// Remove every record
    DeleteAll,
    /// Store every `{key, value}` pair from a JSON array file
    Import { file: PathBuf },
    /// Print records matching a query spec (all records without one)
    Query {
        #[arg(long)]
        spec: Option<String>,
    },
    /// Remove records matching a query spec
    DeleteQuery {
        #[arg(long)]
        spec: String,
    },
}

/// Opens the store, registers the store syscalls and runs `args.command`.
pub async fn run(args: &Args) -> Result<Value> {
    let policy = match &args.policy {
        Some(path) => PolicyEngine::load_from(path.clone()),
        None => PolicyEngine::load(),
    };

    let store = KvStore::open(&args.db, &args.table)
        .with_context(|| format!("failed to open store {:?}", args.db))?;
    let system = System::with_policy(policy);
    system
        .register_syscalls(vec![], store_syscalls(Arc::new(store)))
        .await?;

    let (syscall, call_args) = match &args.command {
        Command::Get { key } => ("store.get", vec![json!(key)]),
        Command::Set { key, value } => ("store.set", vec![json!(key), parse_value(value)]),
        Command::Delete { key } => ("store.delete", vec![json!(key)]),
        Command::DeleteAll => ("store.deleteAll", vec![]),
        Command::Import { file } => {
            let pairs = read_import(file).await?;
            let count = pairs.as_array().map_or(0, Vec::len);
            dispatch(&system, "store.batchSet", vec![pairs]).await?;
            return Ok(json!({ "imported": count }));
        }
        Command::Query { spec } => {
            let call_args = match spec {
                Some(spec) => vec![parse_spec(spec)?],
                None => vec![],
            };
            ("store.query", call_args)
        }
        Command::DeleteQuery { spec } => ("store.deleteQuery", vec![parse_spec(spec)?]),
    };

    dispatch(&system, syscall, call_args).await
}

async fn dispatch(system: &System, syscall: &str, args: Vec<Value>) -> Result<Value> {
    debug!(syscall = %syscall, "Dispatching from CLI");
    system
        .dispatch_syscall(CLI_PLUGIN, syscall, args)
        .await
        .with_context(|| format!("{syscall} failed"))
}

/// Formats a syscall result for printing; `null` prints nothing.
pub fn render(output: &Value) -> Result<Option<String>> {
    if output.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string_pretty(output)?))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_spec(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("--spec is not valid JSON")
}

async fn read_import(file: &Path) -> Result<Value> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {:?}", file))?;
    let pairs: Value = serde_json::from_str(&contents)
        .with_context(|| format!("{:?} is not valid JSON", file))?;
    if !pairs.is_array() {
        bail!("{:?} must contain a JSON array of {{key, value}} objects", file);
    }
    Ok(pairs)
}
