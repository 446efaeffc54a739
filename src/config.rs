//! Process-wide configuration registry (C7).
//!
//! `ConfigRegistry` distinguishes two classes of field:
//!
//! - **Decorator-time-bound**: backend selector, fingerprint producer,
//!   file-backend root/layout/watch flag, shared-backend connector factory.
//!   These are read once when a [`crate::orchestrator::Memoizer`] is
//!   constructed; mutating the registry afterward has no effect on already
//!   built wrappers.
//! - **Live**: caching enabled, stale-after, return-old-value-on-stale,
//!   wait-timeout, allow-null. These are re-read from the registry on every
//!   call, so a mutation is visible to every wrapper immediately.
//!
//! Construction layers defaults, an optional YAML file, and environment
//! variables via `figment`: `Figment::new()` -> optional `Yaml::file(path)`
//! -> `Env::prefixed(..)`.

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use chrono::Duration;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::file::Layout;
use crate::backend::shared::SharedStoreConnector;
use crate::error::{Error, Result};
use crate::fingerprint::{DefaultFingerprinter, Fingerprinter};

/// The environment variable that caps the C8 background worker pool size.
pub const MAX_BACKGROUND_WORKERS_ENV: &str = "MAX_BACKGROUND_WORKERS";

const ENV_PREFIX: &str = "RECALL_";

/// Backend identifiers selectable by string. Presence of a non-null
/// shared-backend connector factory overrides the selector to `SharedDoc`
/// regardless of what this field says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The local file backend (C4).
    File,
    /// The shared-state / distributed backend (C5).
    SharedDoc,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::File
    }
}

/// Serializable, figment-layered configuration fields.
///
/// This is the deserialized shape; it excludes fields that can't round-trip
/// through YAML/env (the fingerprint producer and the shared-backend
/// connector factory), which are set programmatically via
/// [`ConfigRegistry`]'s setters instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryFields {
    /// Global kill switch: when false, every wrapper short-circuits to
    /// direct invocation without consulting any backend.
    pub caching_enabled: bool,
    /// Which backend kind new wrappers bind to.
    pub backend: BackendKind,
    /// File-backend root directory.
    pub file_root: PathBuf,
    /// File-backend on-disk layout.
    pub file_layout: Layout,
    /// Whether the file backend registers a filesystem watch.
    pub file_watch: bool,
    /// Default staleness window, in seconds. `None` means infinite (never
    /// goes stale).
    pub stale_after_secs: Option<i64>,
    /// Whether a stale hit returns the old value and dispatches
    /// fire-and-forget recomputation (`next_time` policy) instead of
    /// recomputing synchronously.
    pub return_old_value_on_stale: bool,
    /// How long a caller waits for another producer's in-flight claim
    /// before falling through to an uncoordinated direct invocation.
    /// `0` means: file backend's built-in bounded poll; shared backend's
    /// unbounded wait.
    pub wait_for_calc_timeout_secs: u64,
    /// Whether a function result of JSON `null` is cached at all.
    pub allow_none: bool,
    /// Size of the C8 background worker pool. Overridden by
    /// `MAX_BACKGROUND_WORKERS` if that variable is set.
    pub background_workers: usize,
}

impl Default for RegistryFields {
    fn default() -> Self {
        Self {
            caching_enabled: true,
            backend: BackendKind::default(),
            file_root: crate::backend::file::FileBackendConfig::default_root(),
            file_layout: Layout::SingleFile,
            file_watch: true,
            stale_after_secs: None,
            return_old_value_on_stale: false,
            wait_for_calc_timeout_secs: 0,
            allow_none: false,
            background_workers: 8,
        }
    }
}

impl RegistryFields {
    /// `stale_after_secs` as a `chrono::Duration`, treating `None` as an
    /// effectively-infinite window.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        match self.stale_after_secs {
            Some(secs) => Duration::seconds(secs),
            None => Duration::weeks(52 * 100),
        }
    }

    /// `wait_for_calc_timeout_secs` as a `std::time::Duration`.
    #[must_use]
    pub fn wait_for_calc_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.wait_for_calc_timeout_secs)
    }
}

/// A live snapshot of the fields [`crate::orchestrator::Memoizer::call`]
/// consults on every invocation (the "live" field class).
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    /// Staleness window.
    pub stale_after: Duration,
    /// Return-old-value-on-stale policy.
    pub return_old_value_on_stale: bool,
    /// Null-caching policy.
    pub allow_none: bool,
    /// How long to wait for another producer's in-flight claim before
    /// falling through to an uncoordinated direct invocation. Threaded
    /// straight from [`RegistryFields::wait_for_calc_timeout`] so a live
    /// mutation of the registry is visible to in-progress calls.
    pub wait_for_calc_timeout: StdDuration,
}

/// Process-wide configuration registry.
///
/// Guarded by a single `parking_lot::RwLock` over the fields, a mutex over
/// the fields rather than per-field atomics, since most fields aren't
/// primitive-atomic types.
pub struct ConfigRegistry {
    inner: RwLock<RegistryFields>,
    fingerprinter: RwLock<Arc<dyn Fingerprinter>>,
    /// Decorator-time-bound: when set, overrides `inner.backend` to
    /// `BackendKind::SharedDoc` for wrappers built from now on, and supplies
    /// the connector `Memoizer::from_registry` uses to reach the store.
    shared_connector: RwLock<Option<Arc<dyn SharedStoreConnector>>>,
}

impl ConfigRegistry {
    /// Build a registry from layered defaults, an optional YAML file, and
    /// `RECALL_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an explicit `path` doesn't exist, or if
    /// the YAML file or environment variables fail to deserialize into
    /// [`RegistryFields`], or if `MAX_BACKGROUND_WORKERS` is set but not a
    /// positive integer.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!("config file not found: {}", path.display())));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut fields: RegistryFields = figment
            .extract()
            .map_err(|e| Error::Config(format!("failed to load configuration: {e}")))?;

        if let Ok(raw) = env::var(MAX_BACKGROUND_WORKERS_ENV) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => fields.background_workers = n,
                _ => {
                    return Err(Error::Config(format!(
                        "{MAX_BACKGROUND_WORKERS_ENV} must be a positive integer, got {raw:?}"
                    )));
                }
            }
        }

        Ok(Self {
            inner: RwLock::new(fields),
            fingerprinter: RwLock::new(Arc::new(DefaultFingerprinter)),
            shared_connector: RwLock::new(None),
        })
    }

    /// The process-wide singleton, built from defaults alone on first
    /// access (falling back to bare defaults if layered loading fails).
    /// Prefer [`ConfigRegistry::load`] directly when a config file path is
    /// known; this is for code that only needs the ambient registry.
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<ConfigRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            Self::load(None).unwrap_or_else(|_| Self {
                inner: RwLock::new(RegistryFields::default()),
                fingerprinter: RwLock::new(Arc::new(DefaultFingerprinter)),
                shared_connector: RwLock::new(None),
            })
        })
    }

    /// A snapshot of the decorator-time-bound fields, read once at
    /// `Memoizer::new` and baked into the wrapper.
    #[must_use]
    pub fn snapshot(&self) -> RegistryFields {
        self.inner.read().clone()
    }

    /// The fingerprint producer in effect for new wrappers.
    #[must_use]
    pub fn fingerprinter(&self) -> Arc<dyn Fingerprinter> {
        Arc::clone(&self.fingerprinter.read())
    }

    /// Replace the fingerprint producer used by wrappers created from now on.
    pub fn set_fingerprinter(&self, fingerprinter: Arc<dyn Fingerprinter>) {
        *self.fingerprinter.write() = fingerprinter;
    }

    /// The live call policy, re-read fresh on every call.
    #[must_use]
    pub fn call_policy(&self) -> CallPolicy {
        let fields = self.inner.read();
        CallPolicy {
            stale_after: fields.stale_after(),
            return_old_value_on_stale: fields.return_old_value_on_stale,
            allow_none: fields.allow_none,
            wait_for_calc_timeout: fields.wait_for_calc_timeout(),
        }
    }

    /// Whether caching is enabled process-wide. When false, every wrapper
    /// short-circuits to direct invocation.
    #[must_use]
    pub fn caching_enabled(&self) -> bool {
        self.inner.read().caching_enabled
    }

    /// Enable or disable caching process-wide. Visible to all wrappers
    /// immediately (a live field).
    pub fn set_caching_enabled(&self, enabled: bool) {
        self.inner.write().caching_enabled = enabled;
    }

    /// Set the default staleness window. `None` means infinite.
    pub fn set_stale_after(&self, stale_after: Option<Duration>) {
        self.inner.write().stale_after_secs = stale_after.map(Duration::num_seconds);
    }

    /// Set the return-old-value-on-stale policy.
    pub fn set_return_old_value_on_stale(&self, enabled: bool) {
        self.inner.write().return_old_value_on_stale = enabled;
    }

    /// Set the wait-for-calc timeout. `0` restores the backend-specific
    /// default behavior.
    pub fn set_wait_for_calc_timeout(&self, timeout: StdDuration) {
        self.inner.write().wait_for_calc_timeout_secs = timeout.as_secs();
    }

    /// Set the allow-null policy.
    pub fn set_allow_none(&self, allow_none: bool) {
        self.inner.write().allow_none = allow_none;
    }

    /// Decorator-time-bound: select the file-backend root for wrappers
    /// created from now on.
    pub fn set_file_root(&self, root: PathBuf) {
        self.inner.write().file_root = root;
    }

    /// Decorator-time-bound: select the file-backend layout for wrappers
    /// created from now on.
    pub fn set_file_layout(&self, layout: Layout) {
        self.inner.write().file_layout = layout;
    }

    /// Decorator-time-bound: toggle the file-backend filesystem watch for
    /// wrappers created from now on.
    pub fn set_file_watch(&self, watch: bool) {
        self.inner.write().file_watch = watch;
    }

    /// Decorator-time-bound: select the backend kind for wrappers created
    /// from now on.
    pub fn set_backend(&self, backend: BackendKind) {
        self.inner.write().backend = backend;
    }

    /// The shared-backend connector factory in effect for new wrappers, if any.
    #[must_use]
    pub fn shared_connector(&self) -> Option<Arc<dyn SharedStoreConnector>> {
        self.shared_connector.read().clone()
    }

    /// Decorator-time-bound: install a shared-backend connector factory.
    /// Its presence overrides [`RegistryFields::backend`] to
    /// `BackendKind::SharedDoc` for wrappers built from now on.
    pub fn set_shared_connector(&self, connector: Arc<dyn SharedStoreConnector>) {
        *self.shared_connector.write() = Some(connector);
    }

    /// Remove any installed shared-backend connector factory, reverting
    /// backend selection to whatever [`RegistryFields::backend`] says.
    pub fn clear_shared_connector(&self) {
        *self.shared_connector.write() = None;
    }

    /// The backend kind new wrappers actually bind to: `SharedDoc` whenever
    /// a connector factory is installed, regardless of `RegistryFields::backend`.
    #[must_use]
    pub fn effective_backend(&self) -> BackendKind {
        if self.shared_connector.read().is_some() {
            BackendKind::SharedDoc
        } else {
            self.inner.read().backend
        }
    }
}
