//! Entry lifecycle helpers (C2).
//!
//! The stored record type itself lives in `recall-wire` (so the backends can
//! depend on it without pulling in the orchestrator); this module adds the
//! staleness and lifecycle queries the orchestrator needs and re-exports the
//! wire type under the name the rest of this crate uses.

use chrono::{DateTime, Duration, Utc};

pub use recall_wire::EntryEnvelope as Entry;

/// Whether `entry`'s value is old enough to be considered stale relative to
/// `now`, given a `stale_after` threshold.
///
/// An entry with no value, or no recorded `timestamp`, is never "stale" in
/// this sense — it's simply missing, which the orchestrator treats as a
/// cache miss rather than a stale hit.
#[must_use]
pub fn is_stale(entry: &Entry, stale_after: Duration, now: DateTime<Utc>) -> bool {
    match (entry.has_value(), entry.timestamp) {
        (true, Some(ts)) => now.signed_duration_since(ts) > stale_after,
        _ => false,
    }
}

/// Whether an in-flight claim recorded at `claimed_at` has outlived `lease`
/// and should be treated as abandoned (producer crashed or was killed
/// without releasing the marker).
#[must_use]
pub fn lease_expired(claimed_at: DateTime<Utc>, lease: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(claimed_at) > lease
}
