//! Memoization orchestrator (C6): the decision state machine that turns a
//! backend, a fingerprinter, and a user function into a memoized call.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use recall_wire::{EntryEnvelope as Entry, Fingerprint, FunctionId};
use tracing::{debug, warn};

use crate::backend::file::{FileBackend, FileBackendConfig, HasDirectory};
use crate::backend::shared::SharedBackend;
use crate::backend::{StorageBackend, WaitOutcome};
use crate::config::{BackendKind, CallPolicy, ConfigRegistry};
use crate::error::{Error, Result};
use crate::fingerprint::{CallArgs, Fingerprinter};
use crate::worker_pool::{LeaseSweeper, WorkerPool};

/// Cadence the `LeaseSweeper` a file-backed `Memoizer::from_registry` spawns
/// sweeps at, and the lease duration it reclaims against. Not yet exposed as
/// registry fields — see DESIGN.md's Open Question decisions.
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);
const DEFAULT_LEASE_SECS: i64 = 300;

/// Per-call overrides. Reserved keywords the orchestrator consumes itself —
/// never forwarded to the wrapped function.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallOverrides {
    /// Bypass read and write entirely; just invoke and return.
    pub ignore_cache: bool,
    /// Invoke, then unconditionally replace the stored entry on success.
    pub overwrite_cache: bool,
    /// Emit a structured trace of the decision taken, via `tracing`.
    pub verbose_cache: bool,
    /// Per-call override of the configured allow-null policy.
    pub allow_none: Option<bool>,
}

/// The outcome of running the decision state machine for one call, used
/// only for `verbose_cache` tracing and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No entry existed; this call became the producer.
    MissProduced,
    /// No entry existed and another producer was already computing;
    /// this call waited for it.
    MissWaited,
    /// Another producer was computing and the wait timed out; this call
    /// invoked directly without storing its result.
    MissWaitTimedOut,
    /// A fresh value was already stored.
    Hit,
    /// A stale value was returned immediately; recomputation was
    /// dispatched (or was already in flight from an earlier call).
    StaleReturnedOld,
    /// A stale value triggered synchronous recomputation (no
    /// return-old-value-on-stale policy configured).
    StaleRecomputed,
    /// `ignore_cache` was set; the backend was not consulted at all.
    Bypassed,
}

type Invoke = dyn Fn(&CallArgs) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync;

/// Generic memoizer over any [`StorageBackend`] implementation.
///
/// Owns the backend, the fingerprinter, and a handle to the background
/// worker pool used for fire-and-forget stale recomputation. One instance
/// exists per wrapped function. Cheap to clone: every field is an `Arc`.
pub struct Memoizer<B: StorageBackend> {
    backend: Arc<B>,
    fingerprinter: Arc<dyn Fingerprinter>,
    is_method: bool,
    workers: Arc<WorkerPool>,
    /// Kept alive only so its background thread keeps running for as long
    /// as this memoizer (and its clones) exist. Populated by
    /// [`Memoizer::from_registry`] for file-backed instances.
    lease_sweeper: Option<Arc<LeaseSweeper>>,
}

impl<B: StorageBackend> Clone for Memoizer<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            fingerprinter: Arc::clone(&self.fingerprinter),
            is_method: self.is_method,
            workers: Arc::clone(&self.workers),
            lease_sweeper: self.lease_sweeper.clone(),
        }
    }
}

impl<B: StorageBackend + 'static> Memoizer<B> {
    /// Build a memoizer over `backend` for a function whose calls carry a
    /// receiver iff `is_method`.
    pub fn new(backend: B, fingerprinter: Arc<dyn Fingerprinter>, is_method: bool, workers: Arc<WorkerPool>) -> Self {
        Self {
            backend: Arc::new(backend),
            fingerprinter,
            is_method,
            workers,
            lease_sweeper: None,
        }
    }

    /// The directory path backing this memoizer, when its backend is a
    /// file backend. Returns `None` for any other backend kind.
    pub fn cache_dpath(&self) -> Option<&std::path::Path>
    where
        B: HasDirectory,
    {
        Some(self.backend.directory())
    }

    /// Remove every entry for this function.
    pub fn clear_cache(&self) -> Result<()> {
        self.backend.clear_all()
    }

    /// Remove the single entry addressed by `args`.
    pub fn clear_cache_by_key(&self, args: &CallArgs) -> Result<()> {
        let key = self.fingerprinter.fingerprint(args, self.is_method)?;
        self.backend.clear(&key)
    }

    /// Insert an entry without invoking the function. Timestamp is `now`.
    pub fn precache(&self, args: &CallArgs, value: serde_json::Value) -> Result<()> {
        let key = self.fingerprinter.fingerprint(args, self.is_method)?;
        let now = Utc::now();
        self.backend.put(&key, value, now, now)
    }

    /// Run the decision state machine for one call.
    ///
    /// `invoke` is the wrapped function; it's called at most once
    /// synchronously by this method (recomputation dispatched to the
    /// worker pool runs `invoke` again, later, on a pool thread).
    pub fn call(
        &self,
        args: &CallArgs,
        overrides: CallOverrides,
        policy: CallPolicy,
        invoke: Arc<Invoke>,
    ) -> Result<serde_json::Value> {
        if overrides.ignore_cache {
            self.trace(overrides, Decision::Bypassed, None);
            return invoke(args).map_err(Error::UserFunction);
        }

        let key = self.fingerprinter.fingerprint(args, self.is_method)?;
        let allow_none = overrides.allow_none.unwrap_or(policy.allow_none);

        if overrides.overwrite_cache {
            let since = Utc::now();
            let value = invoke(args).map_err(Error::UserFunction)?;
            self.store_if_allowed(&key, &value, allow_none, since);
            self.trace(overrides, Decision::Hit, Some(&key));
            return Ok(value);
        }

        let existing = self.backend.get(&key).unwrap_or_else(|e| {
            warn!(error = %e, "backend get failed; treating as miss");
            None
        });

        match existing {
            None => self.handle_miss(&key, args, overrides, policy, allow_none, &invoke),
            Some(entry) if entry.in_flight && !entry.has_value() => {
                self.wait_or_fall_through(&key, args, overrides, policy, &invoke)
            }
            Some(entry) => {
                if crate::entry::is_stale(&entry, policy.stale_after, Utc::now()) {
                    self.handle_stale(&key, args, overrides, policy, allow_none, entry, &invoke)
                } else {
                    self.trace(overrides, Decision::Hit, Some(&key));
                    Ok(entry.value.unwrap_or(serde_json::Value::Null))
                }
            }
        }
    }

    fn store_if_allowed(&self, key: &Fingerprint, value: &serde_json::Value, allow_none: bool, since: chrono::DateTime<Utc>) {
        if value.is_null() && !allow_none {
            debug!("result is null and allow_none is off; not storing");
            return;
        }
        if let Err(e) = self.backend.put(key, value.clone(), Utc::now(), since) {
            warn!(error = %e, "failed to store result; returning it to the caller anyway");
        }
    }

    fn handle_miss(
        &self,
        key: &Fingerprint,
        args: &CallArgs,
        overrides: CallOverrides,
        policy: CallPolicy,
        allow_none: bool,
        invoke: &Arc<Invoke>,
    ) -> Result<serde_json::Value> {
        let since = Utc::now();
        let acquired = self.backend.mark_in_flight(key).unwrap_or_else(|e| {
            warn!(error = %e, "mark_in_flight failed; falling through to uncoordinated invocation");
            true
        });

        if acquired {
            match invoke(args) {
                Ok(value) => {
                    self.store_if_allowed(key, &value, allow_none, since);
                    self.trace(overrides, Decision::MissProduced, Some(key));
                    Ok(value)
                }
                Err(e) => {
                    if let Err(clear_err) = self.backend.clear_in_flight(key) {
                        warn!(error = %clear_err, "failed to release in-flight marker after user function error");
                    }
                    Err(Error::UserFunction(e))
                }
            }
        } else {
            self.wait_or_fall_through(key, args, overrides, policy, invoke)
        }
    }

    fn wait_or_fall_through(
        &self,
        key: &Fingerprint,
        args: &CallArgs,
        overrides: CallOverrides,
        policy: CallPolicy,
        invoke: &Arc<Invoke>,
    ) -> Result<serde_json::Value> {
        match self.backend.wait_until_ready(key, policy.wait_for_calc_timeout)? {
            WaitOutcome::Ready(entry) => {
                self.trace(overrides, Decision::MissWaited, Some(key));
                Ok(entry.value.unwrap_or(serde_json::Value::Null))
            }
            WaitOutcome::TimedOut => {
                // The owning producer will `put` the result; we do not.
                self.trace(overrides, Decision::MissWaitTimedOut, Some(key));
                invoke(args).map_err(Error::UserFunction)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_stale(
        &self,
        key: &Fingerprint,
        args: &CallArgs,
        overrides: CallOverrides,
        policy: CallPolicy,
        allow_none: bool,
        entry: Entry,
        invoke: &Arc<Invoke>,
    ) -> Result<serde_json::Value> {
        if policy.return_old_value_on_stale {
            let dispatch = self.backend.mark_stale(key).unwrap_or(false);
            if dispatch {
                self.dispatch_recompute(key.clone(), args.clone(), allow_none, Arc::clone(invoke));
            }
            self.trace(overrides, Decision::StaleReturnedOld, Some(key));
            Ok(entry.value.unwrap_or(serde_json::Value::Null))
        } else {
            // Same as "no entry": claim in-flight and recompute synchronously.
            let since = Utc::now();
            let acquired = self.backend.mark_in_flight(key).unwrap_or(true);
            if acquired {
                match invoke(args) {
                    Ok(value) => {
                        self.store_if_allowed(key, &value, allow_none, since);
                        self.trace(overrides, Decision::StaleRecomputed, Some(key));
                        Ok(value)
                    }
                    Err(e) => {
                        let _ = self.backend.clear_in_flight(key);
                        Err(Error::UserFunction(e))
                    }
                }
            } else {
                self.wait_or_fall_through(key, args, overrides, policy, invoke)
            }
        }
    }

    /// Runs the recomputation on a worker-pool thread. Whatever happens —
    /// success, a user-function error, or a skipped null result — the
    /// `stale` marker is cleared afterward, since `mark_stale` only
    /// dispatches again on its next `false -> true` transition; leaving it
    /// set would silently stop all future recomputation for this key.
    fn dispatch_recompute(&self, key: Fingerprint, args: CallArgs, allow_none: bool, invoke: Arc<Invoke>) {
        let backend = Arc::clone(&self.backend);
        self.workers.submit(move || {
            let since = Utc::now();
            match invoke(&args) {
                Ok(value) => {
                    if !value.is_null() || allow_none {
                        if let Err(e) = backend.put(&key, value, Utc::now(), since) {
                            warn!(error = %e, "stale recomputation failed to store its result");
                        }
                    }
                    if let Err(e) = backend.clear_stale(&key) {
                        warn!(error = %e, "failed to clear stale marker after recomputation");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stale recomputation's user function failed");
                    if let Err(e) = backend.clear_stale(&key) {
                        warn!(error = %e, "failed to clear stale marker after a failed recomputation");
                    }
                }
            }
        });
    }

    fn trace(&self, overrides: CallOverrides, decision: Decision, key: Option<&Fingerprint>) {
        if overrides.verbose_cache {
            debug!(?decision, key = ?key.map(Fingerprint::as_str), "recall decision");
        }
    }
}

impl Memoizer<Box<dyn StorageBackend>> {
    /// Build a memoizer for `function_id` from `registry`'s live backend
    /// selection: `BackendKind::SharedDoc` whenever a shared-backend
    /// connector factory is installed (overriding whatever `backend` says),
    /// `BackendKind::File` otherwise. This is the only place the registry's
    /// backend-selector field actually gets consulted — constructors that
    /// already hold a concrete backend should keep using [`Memoizer::new`].
    ///
    /// A file-backed memoizer built this way owns a background
    /// [`LeaseSweeper`] for the lifetime of the memoizer (and its clones),
    /// reclaiming abandoned in-flight leases without a separately-run
    /// maintenance process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the registry selects the shared-doc
    /// backend but no connector factory has been installed, or whatever
    /// error the chosen backend's construction produces.
    pub fn from_registry(
        registry: &ConfigRegistry,
        function_id: FunctionId,
        is_method: bool,
        workers: Arc<WorkerPool>,
    ) -> Result<Self> {
        let snapshot = registry.snapshot();
        match registry.effective_backend() {
            BackendKind::File => {
                let file_config = FileBackendConfig {
                    root: snapshot.file_root.clone(),
                    layout: snapshot.file_layout,
                    watch: snapshot.file_watch,
                };
                // A second, independent handle on the same on-disk
                // directory: the file backend's correctness relies on
                // filesystem locking, not on sharing one in-process
                // instance, so this is safe and keeps the sweeper's
                // lifetime decoupled from the memoizer's own backend field.
                let sweep_target = FileBackend::open(&function_id, &file_config)?;
                let sweeper = LeaseSweeper::spawn(SWEEP_INTERVAL, move || {
                    if let Err(e) = sweep_target.sweep_expired_leases(chrono::Duration::seconds(DEFAULT_LEASE_SECS)) {
                        warn!(error = %e, "lease sweep failed");
                    }
                });
                let backend: Box<dyn StorageBackend> = Box::new(FileBackend::open(&function_id, &file_config)?);
                let mut memoizer = Self::new(backend, registry.fingerprinter(), is_method, workers);
                memoizer.lease_sweeper = Some(Arc::new(sweeper));
                Ok(memoizer)
            }
            BackendKind::SharedDoc => {
                let connector = registry.shared_connector().ok_or_else(|| {
                    Error::Config(
                        "backend selection resolved to shared-doc but no shared-backend connector factory is installed"
                            .into(),
                    )
                })?;
                let backend: Box<dyn StorageBackend> =
                    Box::new(SharedBackend::connect(function_id, connector.as_ref(), None)?);
                Ok(Self::new(backend, registry.fingerprinter(), is_method, workers))
            }
        }
    }
}
