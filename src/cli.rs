//! Admin CLI surface: a small operational convenience over `FileBackend`
//! for operators who aren't themselves the host process. Scoped to the
//! file backend only — the shared backend is reachable only through
//! whatever external store backs it, which is outside this crate's
//! concern.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::backend::StorageBackend;
use crate::backend::file::{FileBackend, FileBackendConfig, Layout};
use crate::error::{Error, Result};

/// `recall`: inspect and administer a file-backed memoization cache.
#[derive(Parser, Debug)]
#[command(name = "recall")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Cache root directory (defaults to the platform cache dir, same as
    /// the library's own `FileBackendConfig::default_root`).
    #[arg(long, env = "RECALL_ROOT")]
    pub root: Option<PathBuf>,

    /// On-disk layout to assume when opening the function directory.
    #[arg(long, value_enum, default_value = "single-file")]
    pub layout: LayoutArg,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RECALL_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json).
    #[arg(long, env = "RECALL_LOG_FORMAT")]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Clap-friendly mirror of [`crate::backend::file::Layout`].
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LayoutArg {
    /// One file holds every entry for the function.
    SingleFile,
    /// One file per key.
    PerEntry,
}

impl From<LayoutArg> for Layout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::SingleFile => Layout::SingleFile,
            LayoutArg::PerEntry => Layout::PerEntry,
        }
    }
}

/// Subcommands operating on one function's on-disk cache directory.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remove every entry for a function (`clear_all`).
    Clear {
        /// The function's directory name (a `FunctionId::slug()`).
        #[arg(long)]
        function: String,
    },
    /// Remove a single entry (`clear`).
    ClearKey {
        /// The function's directory name (a `FunctionId::slug()`).
        #[arg(long)]
        function: String,
        /// The fingerprint (hex digest) to remove.
        #[arg(long)]
        key: String,
    },
    /// Print entry count and oldest/newest timestamp for a function.
    Stats {
        /// The function's directory name (a `FunctionId::slug()`).
        #[arg(long)]
        function: String,
    },
    /// Insert an entry without invoking any function.
    Precache {
        /// The function's directory name (a `FunctionId::slug()`).
        #[arg(long)]
        function: String,
        /// The fingerprint (hex digest) to insert under.
        #[arg(long)]
        key: String,
        /// The value to store, as a JSON literal.
        #[arg(long = "value-json")]
        value_json: String,
    },
}

/// Run the parsed CLI invocation to completion.
///
/// # Errors
///
/// Returns an error if the function directory can't be opened, or (for
/// `precache`) if `value_json` doesn't parse as JSON.
pub fn run(cli: &Cli) -> Result<()> {
    let root = cli
        .root
        .clone()
        .unwrap_or_else(FileBackendConfig::default_root);
    let layout = cli.layout.into();

    match &cli.command {
        Command::Clear { function } => {
            let backend = open(&root, layout, function)?;
            backend.clear_all()?;
            println!("cleared all entries for {function}");
        }
        Command::ClearKey { function, key } => {
            let backend = open(&root, layout, function)?;
            backend.clear(&recall_wire::Fingerprint(key.clone()))?;
            println!("cleared {key} for {function}");
        }
        Command::Stats { function } => {
            let backend = open(&root, layout, function)?;
            let entries = backend.entries()?;
            let total = entries.len();
            let oldest = entries.iter().filter_map(|(_, e)| e.timestamp).min();
            let newest = entries.iter().filter_map(|(_, e)| e.timestamp).max();
            let in_flight = entries.iter().filter(|(_, e)| e.in_flight).count();
            println!("function: {function}");
            println!("entries: {total}");
            println!("in_flight: {in_flight}");
            match (oldest, newest) {
                (Some(o), Some(n)) => {
                    println!("oldest: {o}");
                    println!("newest: {n}");
                }
                _ => println!("no published values yet"),
            }
        }
        Command::Precache { function, key, value_json } => {
            let backend = open(&root, layout, function)?;
            let value: serde_json::Value = serde_json::from_str(value_json)?;
            let now = chrono::Utc::now();
            backend.put(&recall_wire::Fingerprint(key.clone()), value, now, now)?;
            println!("precached {key} for {function}");
        }
    }

    Ok(())
}

fn open(root: &std::path::Path, layout: Layout, function: &str) -> Result<FileBackend> {
    let config = FileBackendConfig {
        root: root.to_path_buf(),
        layout,
        watch: false,
    };
    FileBackend::open_by_slug(function, &config).map_err(|e| match e {
        Error::Io(io) => Error::BackendUnavailable(format!("failed to open {function}: {io}")),
        other => other,
    })
}
