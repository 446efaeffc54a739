//! `recall`: persistent, stale-aware function memoization with pluggable
//! storage backends.
//!
//! A caller wraps a pure (or expensive) function in a [`orchestrator::Memoizer`]
//! scoped to a [`recall_wire::FunctionId`]. The memoizer derives a stable
//! fingerprint from the call arguments, returns a previously stored result
//! when available and fresh, and otherwise invokes the wrapped function,
//! persists the result, and coalesces concurrent callers onto a single
//! in-flight computation.
//!
//! # Modules
//!
//! - [`fingerprint`] — argument fingerprinting (C1)
//! - [`entry`] — entry lifecycle helpers over the wire envelope (C2)
//! - [`backend`] — the storage-backend contract (C3) plus the file (C4) and
//!   shared-state (C5) implementations
//! - [`orchestrator`] — the memoization decision state machine (C6)
//! - [`config`] — the process-wide configuration registry (C7)
//! - [`worker_pool`] — the background worker pool for stale recomputation (C8)
//! - [`error`] — the error hierarchy (§7)
//!
//! The host-language annotation/macro surface is realized here as an
//! explicit constructor: there is no `#[recall]` attribute macro. Callers
//! build a `Memoizer` and call `.call(..)` themselves.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cli;
pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod worker_pool;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Set up process-wide structured logging. Honors `RUST_LOG` if set,
/// otherwise falls back to `level`. `format` of `Some("json")` emits
/// structured JSON events; anything else uses the default text formatter.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
