//! The storage-backend abstraction (C3) and its two non-trivial
//! implementations: [`file`] (C4) and [`shared`] (C5).

pub mod file;
pub mod shared;

#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

use recall_wire::{EntryEnvelope as Entry, Fingerprint};

use crate::error::Result;

/// Outcome of [`StorageBackend::wait_until_ready`].
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The in-flight marker cleared before the timeout; carries the entry
    /// observed immediately after.
    Ready(Entry),
    /// The timeout elapsed while the marker was still set.
    TimedOut,
}

/// Storage operations consumed by the orchestrator (C6).
///
/// A backend instance is scoped to one function identity at construction;
/// every method below operates within that scope. Implementations must
/// uphold linearizability of `put` and `mark_in_flight` per key — `get` may
/// observe a slightly stale record but never a torn one.
pub trait StorageBackend: Send + Sync {
    /// Returns the latest published state visible to this process, if any.
    /// May return a record whose `in_flight` is true.
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>>;

    /// Atomic replace: the entry becomes `(value, ts, in_flight=false, stale=false)`,
    /// unless a `clear`/`clear_all` tombstoned this key at or after `since` —
    /// in which case the write is silently dropped, letting clear win a race
    /// against an abandoned producer's late publish. `since` should be the
    /// instant the producer's claim (or, for a cacheless write, the call)
    /// began.
    fn put(
        &self,
        key: &Fingerprint,
        value: serde_json::Value,
        ts: chrono::DateTime<chrono::Utc>,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;

    /// Atomically sets `in_flight=true` iff no other producer currently
    /// holds it. Returns whether the caller acquired the claim.
    fn mark_in_flight(&self, key: &Fingerprint) -> Result<bool>;

    /// Clears `in_flight` unconditionally; used after abandonment (the
    /// producer errored or its claim expired).
    fn clear_in_flight(&self, key: &Fingerprint) -> Result<()>;

    /// Sets `stale=true` iff not already set. True means the caller should
    /// dispatch fire-and-forget recomputation.
    fn mark_stale(&self, key: &Fingerprint) -> Result<bool>;

    /// Clears `stale` unconditionally; used once the dispatched recomputation
    /// has run (successfully, erred, or was skipped) so a later transition
    /// back to stale can dispatch again.
    fn clear_stale(&self, key: &Fingerprint) -> Result<()>;

    /// Removes the entry for `key`, leaving a tombstone so a late `put` from
    /// a producer that claimed before the clear is dropped rather than
    /// resurrecting the entry.
    fn clear(&self, key: &Fingerprint) -> Result<()>;

    /// Removes every entry under this backend's scope, tombstoning each.
    fn clear_all(&self) -> Result<()>;

    /// Blocks until `in_flight` becomes false for `key` or `timeout` elapses.
    fn wait_until_ready(&self, key: &Fingerprint, timeout: Duration) -> Result<WaitOutcome>;
}

/// Lets `Memoizer::from_registry` erase the concrete backend type — the
/// registry picks `FileBackend` or `SharedBackend` at runtime, so the
/// resulting `Memoizer` has to be generic over a trait object rather than a
/// compile-time-fixed backend.
impl StorageBackend for Box<dyn StorageBackend> {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>> {
        (**self).get(key)
    }

    fn put(
        &self,
        key: &Fingerprint,
        value: serde_json::Value,
        ts: chrono::DateTime<chrono::Utc>,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        (**self).put(key, value, ts, since)
    }

    fn mark_in_flight(&self, key: &Fingerprint) -> Result<bool> {
        (**self).mark_in_flight(key)
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<()> {
        (**self).clear_in_flight(key)
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool> {
        (**self).mark_stale(key)
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<()> {
        (**self).clear_stale(key)
    }

    fn clear(&self, key: &Fingerprint) -> Result<()> {
        (**self).clear(key)
    }

    fn clear_all(&self) -> Result<()> {
        (**self).clear_all()
    }

    fn wait_until_ready(&self, key: &Fingerprint, timeout: Duration) -> Result<WaitOutcome> {
        (**self).wait_until_ready(key, timeout)
    }
}
