//! Shared-state (distributed) backend (C5).
//!
//! Scope: a collection/namespace in an external document store, keyed by
//! the pair `(function_id, key)`. The backend is handed a
//! [`SharedStoreConnector`] at construction; the connector may be invoked
//! lazily on first use (the reference implementation, [`HttpSharedStore`],
//! dials out on the first operation, not at construction time).

use std::time::Duration as StdDuration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Duration, Utc};
use recall_wire::{EntryEnvelope as Entry, Fingerprint, FunctionId, SharedDocument};

use super::{StorageBackend, WaitOutcome};
use crate::error::{Error, Result};

/// A handle with read/write permission to the external store, scoped to one
/// function identity. Implementations are responsible for their own
/// transport-level retry; the backend only retries the logical operation
/// (the `wait_until_ready` poll loop), never the connection itself.
pub trait SharedStore: Send + Sync {
    /// Fetch the document for `key`, if any.
    fn fetch(&self, key: &Fingerprint) -> Result<Option<SharedDocument>>;

    /// Atomically claim `key`: succeeds if no document exists, or if the
    /// existing document is not in flight, or if it is in flight but its
    /// lease (if any) has expired as of `now`. The lease check and the
    /// write must happen as a single atomic operation at the store —
    /// performing it as a separate fetch-then-upsert from the caller would
    /// let two callers both observe the same expired lease and both claim.
    fn try_claim(&self, key: &Fingerprint, now: DateTime<Utc>, lease: Option<Duration>) -> Result<bool>;

    /// Unconditional replace of the document at `key`.
    fn upsert(&self, doc: &SharedDocument) -> Result<()>;

    /// Tombstone the document at `key`: future reads observe an empty entry
    /// with `cleared_at` set, so a `put` from a producer that claimed before
    /// this call can detect and drop its write.
    fn clear(&self, key: &Fingerprint, cleared_at: DateTime<Utc>) -> Result<()>;

    /// Tombstone every document under this store's function scope.
    fn clear_all(&self, cleared_at: DateTime<Utc>) -> Result<()>;
}

/// Lazily constructs a [`SharedStore`] handle for a given function identity.
///
/// Presence of a non-null connector factory in the configuration registry
/// is what selects the shared-doc backend over the file backend.
pub trait SharedStoreConnector: Send + Sync {
    /// Build (or look up) the store handle for `function_id`.
    fn connect(&self, function_id: &FunctionId) -> Result<Box<dyn SharedStore>>;
}

/// The shared-state backend, scoped to one function identity.
pub struct SharedBackend {
    function_id: FunctionId,
    store: Box<dyn SharedStore>,
    /// Lease duration: an in-flight marker older than this is forcibly
    /// reclaimable by a subsequent caller. `None` means unbounded (wait
    /// indefinitely), matching `wait_for_calc_timeout = 0`'s semantics.
    lease: Option<Duration>,
}

impl SharedBackend {
    /// Connect to the store for `function_id` via `connector`.
    pub fn connect(
        function_id: FunctionId,
        connector: &dyn SharedStoreConnector,
        lease: Option<Duration>,
    ) -> Result<Self> {
        let store = connector.connect(&function_id)?;
        Ok(Self { function_id, store, lease })
    }

    fn doc(&self, key: &Fingerprint, entry: Entry) -> SharedDocument {
        SharedDocument {
            function_id: self.function_id.clone(),
            key: key.clone(),
            entry,
        }
    }
}

impl StorageBackend for SharedBackend {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>> {
        Ok(self.store.fetch(key)?.map(|doc| doc.entry))
    }

    fn put(
        &self,
        key: &Fingerprint,
        value: serde_json::Value,
        ts: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(existing) = self.store.fetch(key)? {
            if existing.entry.superseded_by_clear(since) {
                return Ok(());
            }
        }
        self.store.upsert(&self.doc(key, Entry::published(value, ts)))
    }

    /// Delegates the lease check and claim write to the store as one
    /// atomic call, so two callers racing on the same expired lease cannot
    /// both succeed.
    fn mark_in_flight(&self, key: &Fingerprint) -> Result<bool> {
        self.store.try_claim(key, Utc::now(), self.lease)
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<()> {
        if let Some(mut doc) = self.store.fetch(key)? {
            doc.entry.in_flight = false;
            doc.entry.claimed_at = None;
            self.store.upsert(&doc)?;
        }
        Ok(())
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool> {
        let Some(mut doc) = self.store.fetch(key)? else {
            return Ok(false);
        };
        if doc.entry.stale == Some(true) {
            return Ok(false);
        }
        doc.entry.stale = Some(true);
        self.store.upsert(&doc)?;
        Ok(true)
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<()> {
        if let Some(mut doc) = self.store.fetch(key)? {
            doc.entry.stale = None;
            self.store.upsert(&doc)?;
        }
        Ok(())
    }

    fn clear(&self, key: &Fingerprint) -> Result<()> {
        self.store.clear(key, Utc::now())
    }

    fn clear_all(&self) -> Result<()> {
        self.store.clear_all(Utc::now())
    }

    /// Polls at a bounded cadence; the store is not assumed to offer a
    /// native blocking subscription. `timeout == 0` means wait
    /// indefinitely.
    fn wait_until_ready(&self, key: &Fingerprint, timeout: StdDuration) -> Result<WaitOutcome> {
        let mut backoff = ExponentialBackoff {
            initial_interval: StdDuration::from_millis(20),
            max_interval: StdDuration::from_secs(2),
            max_elapsed_time: if timeout.is_zero() { None } else { Some(timeout) },
            ..ExponentialBackoff::default()
        };

        loop {
            match self.store.fetch(key)? {
                Some(doc) if !doc.entry.in_flight => return Ok(WaitOutcome::Ready(doc.entry)),
                None => return Ok(WaitOutcome::Ready(Entry::empty())),
                _ => {}
            }
            match backoff.next_backoff() {
                Some(delay) => std::thread::sleep(delay),
                None => return Ok(WaitOutcome::TimedOut),
            }
        }
    }
}

/// Reference [`SharedStore`] implementation backed by a plain HTTP document
/// API (`GET/PUT/DELETE /{function_slug}/{key}`), using `reqwest`'s blocking
/// client so the rest of this crate's public surface stays synchronous (see
/// the crate-level note on why the orchestrator is not async).
pub struct HttpSharedStore {
    client: reqwest::blocking::Client,
    base_url: String,
    function_slug: String,
}

impl HttpSharedStore {
    /// Build a store handle pointed at `base_url` for `function_id`.
    pub fn new(base_url: impl Into<String>, function_id: &FunctionId) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            function_slug: function_id.slug(),
        })
    }

    fn url(&self, key: &Fingerprint) -> String {
        format!("{}/{}/{}", self.base_url, self.function_slug, key.as_str())
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, self.function_slug)
    }
}

impl SharedStore for HttpSharedStore {
    fn fetch(&self, key: &Fingerprint) -> Result<Option<SharedDocument>> {
        let resp = self.client.get(self.url(key)).send().map_err(Error::Http)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(Error::Http)?;
        Ok(Some(resp.json().map_err(Error::Http)?))
    }

    /// POSTs the lease alongside the claim timestamp so the server can
    /// perform the expiry check and the write as one atomic operation
    /// instead of this client doing a racy fetch-then-upsert.
    fn try_claim(&self, key: &Fingerprint, now: DateTime<Utc>, lease: Option<Duration>) -> Result<bool> {
        let resp = self
            .client
            .post(format!("{}/claim", self.url(key)))
            .json(&serde_json::json!({
                "claimed_at": now,
                "lease_seconds": lease.map(Duration::num_seconds),
            }))
            .send()
            .map_err(Error::Http)?;
        match resp.status() {
            reqwest::StatusCode::OK | reqwest::StatusCode::CREATED => Ok(true),
            reqwest::StatusCode::CONFLICT => Ok(false),
            _ => Err(Error::BackendUnavailable(format!(
                "unexpected status from claim: {}",
                resp.status()
            ))),
        }
    }

    fn upsert(&self, doc: &SharedDocument) -> Result<()> {
        self.client
            .put(self.url(&doc.key))
            .json(doc)
            .send()
            .map_err(Error::Http)?
            .error_for_status()
            .map_err(Error::Http)?;
        Ok(())
    }

    /// PUTs a tombstone marker rather than issuing a DELETE, so the server
    /// keeps the document around with `cleared_at` set for late publishers
    /// to observe.
    fn clear(&self, key: &Fingerprint, cleared_at: DateTime<Utc>) -> Result<()> {
        self.client
            .put(self.url(key))
            .json(&serde_json::json!({ "cleared_at": cleared_at }))
            .send()
            .map_err(Error::Http)?
            .error_for_status()
            .map_err(Error::Http)?;
        Ok(())
    }

    fn clear_all(&self, cleared_at: DateTime<Utc>) -> Result<()> {
        self.client
            .put(format!("{}/clear", self.collection_url()))
            .json(&serde_json::json!({ "cleared_at": cleared_at }))
            .send()
            .map_err(Error::Http)?
            .error_for_status()
            .map_err(Error::Http)?;
        Ok(())
    }
}
