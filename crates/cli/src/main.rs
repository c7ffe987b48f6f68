//! # indexctl - operator tool for index tables and catalogs
//!
//! Works on files at rest: a single `.ptable` file or a catalog directory
//! holding an `indexmap` descriptor. Nothing here talks to a running log;
//! `merge` therefore treats every entry as live and keeps every duplicate.
//!
//! ## Commands
//!
//! ```text
//! inspect <table> [--skip-verify]            Header, counts, digest and bloom status
//! dump <table> [--reverse] [--limit N]       Print entries in table order
//! levels <dir>                               Checkpoints and tables per level
//! lookup <dir> <hash> [--event N]            Latest entry, or exact key candidates
//!        [--from A --to B]                   Inclusive event-number range
//! merge <dir>                                One manual merge of the capped levels
//! ```
//!
//! ## Configuration
//!
//! Catalog settings come from the `INDEX_*` environment variables (see the
//! `config` crate). Log output goes to stderr:
//!
//! ```text
//! RUST_LOG       tracing filter            (takes precedence)
//! INDEXCTL_LOG   fallback tracing filter   (default: "warn")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ indexctl levels data/index
//! checkpoint: prepare=4096 commit=4096
//! L0  1 table(s)
//!     ptable-00000000000000000012-1708600002000.ptable  entries=512
//! L2  1 table(s)
//!     ptable-00000000000000000009-1708600001000.ptable  entries=2048
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::IndexConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "indexctl", version, about = "Inspect and maintain leveled index tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open one table and print what its header, footer and digest say.
    Inspect {
        table: PathBuf,
        /// Only run the structural checks.
        #[arg(long)]
        skip_verify: bool,
    },
    /// Print the entries of one table.
    Dump {
        table: PathBuf,
        /// Lowest key first.
        #[arg(long)]
        reverse: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the catalog in a directory, level by level.
    Levels { dir: PathBuf },
    /// Look up a stream hash across the catalog in a directory.
    Lookup {
        dir: PathBuf,
        /// Decimal or 0x-prefixed hex.
        #[arg(value_parser = parse_hash)]
        hash: u64,
        /// Exact event number; prints every candidate for the key.
        #[arg(long, conflicts_with_all = ["from", "to"])]
        event: Option<i64>,
        #[arg(long, requires = "to")]
        from: Option<i64>,
        #[arg(long, requires = "from")]
        to: Option<i64>,
    },
    /// Run one manual merge of the capped levels and persist the result.
    Merge { dir: PathBuf },
}

fn parse_hash(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid stream hash {:?}: {}", raw, e))
}

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(env_or("INDEXCTL_LOG", "warn"))),
        )
        .init();

    let config = IndexConfig::from_env()?;

    match cli.command {
        Command::Inspect { table, skip_verify } => commands::inspect(&table, skip_verify, &config),
        Command::Dump {
            table,
            reverse,
            limit,
        } => commands::dump(&table, reverse, limit, &config),
        Command::Levels { dir } => commands::levels(&dir, &config),
        Command::Lookup {
            dir,
            hash,
            event,
            from,
            to,
        } => {
            let query = match (event, from.zip(to)) {
                (Some(event), _) => commands::Query::Exact(event),
                (None, Some((from, to))) => commands::Query::Range(from, to),
                (None, None) => commands::Query::Latest,
            };
            commands::lookup(&dir, hash, query, &config)
        }
        Command::Merge { dir } => commands::merge(&dir, config),
    }
}
