//! Local file backend (C4).
//!
//! Scope: a per-function directory beneath a configurable root (default: a
//! well-known per-user cache location, via `dirs::cache_dir`). The directory
//! name is `FunctionId::slug()`.
//!
//! Two layouts are supported, selected at construction:
//! - [`Layout::SingleFile`]: one binary file under the function directory
//!   holds the whole `K -> E` mapping, guarded by a sidecar lock file.
//! - [`Layout::PerEntry`]: one file per key, named by the fingerprint's hex
//!   digest, each guarded by its own lock (the file itself).
//!
//! Every record is a length-prefixed `bincode` encoding of a
//! [`recall_wire::EntryEnvelope`]. Writes are atomic-by-rename: encode to a
//! temporary file in the same directory, `sync_all`, then rename over the
//! target — so a reader never observes a partial write.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use recall_wire::{EntryEnvelope as Entry, Fingerprint, FunctionId};
use tempfile::NamedTempFile;

use super::{StorageBackend, WaitOutcome};
use crate::error::{Error, Result};

/// Marker trait implemented by backends that are backed by an on-disk
/// directory, so `Memoizer::cache_dpath` can expose it generically without
/// downcasting.
pub trait HasDirectory {
    /// The directory this backend stores its entries under.
    fn directory(&self) -> &Path;
}

/// How entries are laid out on disk under a function's directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// One file holds every entry for the function.
    SingleFile,
    /// One file per key.
    PerEntry,
}

/// Construction parameters for [`FileBackend`].
pub struct FileBackendConfig {
    /// Root directory all function subdirectories are created under.
    pub root: PathBuf,
    /// On-disk layout.
    pub layout: Layout,
    /// Whether to watch the function directory for external modifications.
    /// When disabled, the backend only learns of cross-process writes on
    /// its own poll cadence inside `wait_until_ready`.
    pub watch: bool,
}

impl FileBackendConfig {
    /// A config rooted at the platform cache directory (falling back to
    /// `.recall-cache` in the current directory if no cache dir is known).
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recall")
    }
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            layout: Layout::SingleFile,
            watch: true,
        }
    }
}

/// An in-memory mirror of the single-file mapping, re-read when the
/// directory watch (or a poll) observes a change.
#[derive(Default)]
struct SingleFileCache {
    entries: HashMap<Fingerprint, Entry>,
    loaded: bool,
}

/// The local file backend, scoped to one function identity.
pub struct FileBackend {
    dir: PathBuf,
    layout: Layout,
    /// Sidecar lock used in single-file mode; also used to serialize
    /// directory-level operations (`clear_all`) in per-entry mode.
    dir_lock_path: PathBuf,
    cache: RwLock<SingleFileCache>,
    _watcher: Option<notify::RecommendedWatcher>,
    change_rx: Option<Arc<std::sync::Mutex<mpsc::Receiver<()>>>>,
}

const SINGLE_FILE_NAME: &str = "entries.bin";
const LOCK_FILE_NAME: &str = ".recall.lock";

impl FileBackend {
    /// Open (creating if absent) the on-disk directory for `function_id`.
    pub fn open(function_id: &FunctionId, config: &FileBackendConfig) -> Result<Self> {
        Self::open_by_slug(&function_id.slug(), config)
    }

    /// Open (creating if absent) the on-disk directory for a raw function
    /// slug, bypassing `FunctionId` construction. Used by the admin CLI,
    /// which only knows the directory name an operator passed in, not the
    /// `(module, qualifier, name)` tuple that produced it.
    pub fn open_by_slug(slug: &str, config: &FileBackendConfig) -> Result<Self> {
        let dir = config.root.join(slug);
        fs::create_dir_all(&dir)?;

        let dir_lock_path = dir.join(LOCK_FILE_NAME);
        if !dir_lock_path.exists() {
            File::create(&dir_lock_path)?;
        }

        let (watcher, change_rx) = if config.watch {
            match Self::spawn_watch(&dir) {
                Ok((w, rx)) => (Some(w), Some(Arc::new(std::sync::Mutex::new(rx)))),
                // Watch registration can fail (e.g. inotify instance limit
                // reached). Degrade to poll-only rather than fail construction.
                Err(_) => (None, None),
            }
        } else {
            (None, None)
        };

        Ok(Self {
            dir,
            layout: config.layout,
            dir_lock_path,
            cache: RwLock::new(SingleFileCache::default()),
            _watcher: watcher,
            change_rx,
        })
    }

    fn spawn_watch(dir: &Path) -> notify::Result<(notify::RecommendedWatcher, mpsc::Receiver<()>)> {
        use notify::{RecursiveMode, Watcher};

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok((watcher, rx))
    }

    fn has_pending_change(&self) -> bool {
        match &self.change_rx {
            Some(rx) => rx.lock().unwrap().try_recv().is_ok(),
            None => false,
        }
    }

    fn lock_path_for(&self, key: &Fingerprint) -> PathBuf {
        match self.layout {
            Layout::SingleFile => self.dir_lock_path.clone(),
            Layout::PerEntry => self.entry_path(key),
        }
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.bin", key.as_str()))
    }

    fn single_file_path(&self) -> PathBuf {
        self.dir.join(SINGLE_FILE_NAME)
    }

    /// Acquire the advisory lock appropriate to `key`, run `f`, then release.
    fn with_lock<T>(&self, key: &Fingerprint, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_path = self.lock_path_for(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        file.lock_exclusive()
            .map_err(|e| Error::BackendUnavailable(format!("failed to acquire file lock: {e}")))?;
        let result = f();
        fs2::FileExt::unlock(&file)
            .map_err(|e| Error::BackendUnavailable(format!("failed to release file lock: {e}")))?;
        result
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn encode(entry: &Entry) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        bincode::serde::encode_to_vec(entry, config)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Option<Entry> {
        let config = bincode::config::standard();
        bincode::serde::decode_from_slice::<Entry, _>(bytes, config)
            .ok()
            .map(|(entry, _)| entry)
    }

    /// Read one entry file. A missing, truncated, or corrupt file is a miss,
    /// never an error — the orchestrator must not crash on unreadable state.
    fn read_entry_file(path: &Path) -> Option<Entry> {
        let mut file = File::open(path).ok()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).ok()?;
        Self::decode(&buf)
    }

    fn read_single_file(&self) -> HashMap<Fingerprint, Entry> {
        let path = self.single_file_path();
        let Ok(mut file) = File::open(&path) else {
            return HashMap::new();
        };
        let mut buf = Vec::new();
        if file.read_to_end(&mut buf).is_err() {
            return HashMap::new();
        }
        let config = bincode::config::standard();
        bincode::serde::decode_from_slice::<HashMap<Fingerprint, Entry>, _>(&buf, config)
            .ok()
            .map(|(map, _)| map)
            .unwrap_or_default()
    }

    fn write_single_file(&self, map: &HashMap<Fingerprint, Entry>) -> Result<()> {
        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(map, config)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Self::write_atomic(&self.single_file_path(), &bytes)
    }

    fn refresh_single_file_cache_if_needed(&self) {
        let needs_reload = {
            let cache = self.cache.read().unwrap();
            !cache.loaded || self.has_pending_change()
        };
        if needs_reload {
            let map = self.read_single_file();
            let mut cache = self.cache.write().unwrap();
            cache.entries = map;
            cache.loaded = true;
        }
    }

    fn get_locked(&self, key: &Fingerprint) -> Result<Option<Entry>> {
        match self.layout {
            Layout::SingleFile => {
                self.refresh_single_file_cache_if_needed();
                Ok(self.cache.read().unwrap().entries.get(key).cloned())
            }
            Layout::PerEntry => Ok(Self::read_entry_file(&self.entry_path(key))),
        }
    }

    fn put_locked(&self, key: &Fingerprint, entry: Entry) -> Result<()> {
        match self.layout {
            Layout::SingleFile => {
                let mut map = self.read_single_file();
                map.insert(key.clone(), entry);
                self.write_single_file(&map)?;
                let mut cache = self.cache.write().unwrap();
                cache.entries = map;
                cache.loaded = true;
                Ok(())
            }
            Layout::PerEntry => {
                let bytes = Self::encode(&entry)?;
                Self::write_atomic(&self.entry_path(key), &bytes)
            }
        }
    }

    /// A snapshot of every entry currently stored under this function's
    /// directory. Used by the admin CLI's `stats` subcommand; not part of
    /// the `StorageBackend` contract, which never requires enumeration.
    pub fn entries(&self) -> Result<Vec<(Fingerprint, Entry)>> {
        match self.layout {
            Layout::SingleFile => {
                self.refresh_single_file_cache_if_needed();
                Ok(self.cache.read().unwrap().entries.clone().into_iter().collect())
            }
            Layout::PerEntry => {
                let mut out = Vec::new();
                for dirent in fs::read_dir(&self.dir)?.flatten() {
                    let path = dirent.path();
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
                    let Some(ext) = path.extension().and_then(|s| s.to_str()) else { continue };
                    if ext != "bin" {
                        continue;
                    }
                    let key = Fingerprint(stem.to_string());
                    if let Some(entry) = Self::read_entry_file(&path) {
                        out.push((key, entry));
                    }
                }
                Ok(out)
            }
        }
    }

    /// Reclaim any in-flight marker whose lease has expired (the same
    /// lease semantics the shared backend applies on read, reused here
    /// since the file backend has no external store to apply them
    /// against). Returns the number of markers cleared. Intended to be
    /// called periodically by a [`crate::worker_pool::LeaseSweeper`], not
    /// on every `get`/`put` — this never evicts proactively on its own,
    /// it only reclaims a producer that crashed without releasing its
    /// claim.
    pub fn sweep_expired_leases(&self, lease: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let mut reclaimed = 0;
        for (key, entry) in self.entries()? {
            if entry.in_flight
                && !entry.has_value()
                && entry.claimed_at.is_some_and(|claimed_at| crate::entry::lease_expired(claimed_at, lease, now))
            {
                self.clear_in_flight(&key)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

impl HasDirectory for FileBackend {
    fn directory(&self) -> &Path {
        &self.dir
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>> {
        self.with_lock(key, || self.get_locked(key))
    }

    fn put(
        &self,
        key: &Fingerprint,
        value: serde_json::Value,
        ts: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Result<()> {
        self.with_lock(key, || {
            if let Some(existing) = self.get_locked(key)? {
                if existing.superseded_by_clear(since) {
                    return Ok(());
                }
            }
            self.put_locked(key, Entry::published(value, ts))
        })
    }

    fn mark_in_flight(&self, key: &Fingerprint) -> Result<bool> {
        self.with_lock(key, || {
            let current = self.get_locked(key)?;
            if current.as_ref().is_some_and(|e| e.in_flight) {
                return Ok(false);
            }
            let mut claimed = current.unwrap_or_else(Entry::empty);
            claimed.in_flight = true;
            claimed.claimed_at = Some(Utc::now());
            self.put_locked(key, claimed)?;
            Ok(true)
        })
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<()> {
        self.with_lock(key, || {
            if let Some(mut entry) = self.get_locked(key)? {
                entry.in_flight = false;
                entry.claimed_at = None;
                self.put_locked(key, entry)?;
            }
            Ok(())
        })
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool> {
        self.with_lock(key, || {
            let Some(mut entry) = self.get_locked(key)? else {
                return Ok(false);
            };
            if entry.stale == Some(true) {
                return Ok(false);
            }
            entry.stale = Some(true);
            self.put_locked(key, entry)?;
            Ok(true)
        })
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<()> {
        self.with_lock(key, || {
            if let Some(mut entry) = self.get_locked(key)? {
                entry.stale = None;
                self.put_locked(key, entry)?;
            }
            Ok(())
        })
    }

    /// Leaves a tombstone rather than removing the record outright: a `put`
    /// from a producer that claimed before this clear must see `cleared_at`
    /// and drop its write instead of resurrecting the entry.
    fn clear(&self, key: &Fingerprint) -> Result<()> {
        self.with_lock(key, || {
            let tombstone = Entry::cleared(Utc::now());
            match self.layout {
                Layout::SingleFile => {
                    let mut map = self.read_single_file();
                    map.insert(key.clone(), tombstone);
                    self.write_single_file(&map)?;
                    let mut cache = self.cache.write().unwrap();
                    cache.entries = map;
                    Ok(())
                }
                Layout::PerEntry => {
                    let bytes = Self::encode(&tombstone)?;
                    Self::write_atomic(&self.entry_path(key), &bytes)
                }
            }
        })
    }

    fn clear_all(&self) -> Result<()> {
        // Always serialize on the directory's own sidecar lock, regardless
        // of layout — clearing touches every entry file at once.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.dir_lock_path)?;
        file.lock_exclusive()
            .map_err(|e| Error::BackendUnavailable(format!("failed to acquire file lock: {e}")))?;
        let result = (|| {
            let now = Utc::now();
            match self.layout {
                Layout::SingleFile => {
                    let mut map = self.read_single_file();
                    for entry in map.values_mut() {
                        *entry = Entry::cleared(now);
                    }
                    self.write_single_file(&map)?;
                    let mut cache = self.cache.write().unwrap();
                    cache.entries = map;
                    cache.loaded = true;
                }
                Layout::PerEntry => {
                    for (key, _) in self.entries()? {
                        let bytes = Self::encode(&Entry::cleared(now))?;
                        Self::write_atomic(&self.entry_path(&key), &bytes)?;
                    }
                }
            }
            Ok(())
        })();
        fs2::FileExt::unlock(&file)
            .map_err(|e| Error::BackendUnavailable(format!("failed to release file lock: {e}")))?;
        result
    }

    /// Polls with bounded exponential backoff under brief lock acquisitions,
    /// since filesystem notifications are not reliable across all platforms.
    fn wait_until_ready(&self, key: &Fingerprint, timeout: StdDuration) -> Result<WaitOutcome> {
        let mut backoff = ExponentialBackoff {
            initial_interval: StdDuration::from_millis(5),
            max_interval: StdDuration::from_millis(250),
            max_elapsed_time: Some(timeout),
            ..ExponentialBackoff::default()
        };

        loop {
            let entry = self.get(key)?;
            match entry {
                Some(e) if !e.in_flight => return Ok(WaitOutcome::Ready(e)),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(tmp: &tempfile::TempDir, layout: Layout) -> FileBackend {
        let function_id = FunctionId::new("myapp::pricing", "quote");
        let config = FileBackendConfig {
            root: tmp.path().to_path_buf(),
            layout,
            watch: false,
        };
        FileBackend::open(&function_id, &config).unwrap()
    }

    #[test]
    fn single_file_put_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let key = Fingerprint("abc".into());
        let now = Utc::now();
        backend.put(&key, serde_json::json!({"x": 1}), now, now).unwrap();
        let entry = backend.get(&key).unwrap().unwrap();
        assert_eq!(entry.value, Some(serde_json::json!({"x": 1})));
        assert!(!entry.in_flight);
    }

    #[test]
    fn per_entry_put_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::PerEntry);
        let key = Fingerprint("def".into());
        let now = Utc::now();
        backend.put(&key, serde_json::json!([1, 2, 3]), now, now).unwrap();
        let entry = backend.get(&key).unwrap().unwrap();
        assert_eq!(entry.value, Some(serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn mark_in_flight_is_exclusive_per_key() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let key = Fingerprint("k".into());
        assert!(backend.mark_in_flight(&key).unwrap());
        assert!(!backend.mark_in_flight(&key).unwrap());
    }

    #[test]
    fn clear_removes_single_entry_without_touching_others() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let a = Fingerprint("a".into());
        let b = Fingerprint("b".into());
        let now = Utc::now();
        backend.put(&a, serde_json::json!(1), now, now).unwrap();
        backend.put(&b, serde_json::json!(2), now, now).unwrap();
        backend.clear(&a).unwrap();
        assert!(!backend.get(&a).unwrap().unwrap().has_value());
        assert!(backend.get(&b).unwrap().unwrap().has_value());
    }

    #[test]
    fn clear_all_removes_every_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::PerEntry);
        let now = Utc::now();
        backend.put(&Fingerprint("a".into()), serde_json::json!(1), now, now).unwrap();
        backend.put(&Fingerprint("b".into()), serde_json::json!(2), now, now).unwrap();
        backend.clear_all().unwrap();
        assert!(!backend.get(&Fingerprint("a".into())).unwrap().unwrap().has_value());
        assert!(!backend.get(&Fingerprint("b".into())).unwrap().unwrap().has_value());
    }

    #[test]
    fn put_after_clear_with_a_stale_claim_is_dropped() {
        // GIVEN: a producer claimed the key, then the key was cleared
        // WHEN: the abandoned producer finally publishes, citing its original claim time
        // THEN: the publish is silently dropped and the entry stays cleared
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let key = Fingerprint("a".into());
        let claimed_at = Utc::now() - chrono::Duration::seconds(5);
        backend.put(&key, serde_json::json!("first"), claimed_at, claimed_at).unwrap();
        backend.clear(&key).unwrap();
        backend.put(&key, serde_json::json!("late"), Utc::now(), claimed_at).unwrap();
        assert!(!backend.get(&key).unwrap().unwrap().has_value(), "late publish must not resurrect a cleared entry");
    }

    #[test]
    fn put_after_clear_with_a_fresh_claim_succeeds() {
        // GIVEN: a key was cleared
        // WHEN: a new producer claims and publishes after the clear
        // THEN: the publish is visible
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let key = Fingerprint("a".into());
        backend.clear(&key).unwrap();
        let claimed_at = Utc::now();
        backend.put(&key, serde_json::json!("fresh"), claimed_at, claimed_at).unwrap();
        assert_eq!(backend.get(&key).unwrap().unwrap().value, Some(serde_json::json!("fresh")));
    }

    #[test]
    fn corrupt_entry_file_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::PerEntry);
        let key = Fingerprint("broken".into());
        fs::write(backend.entry_path(&key), b"not a valid bincode payload at all").unwrap();
        assert!(backend.get(&key).unwrap().is_none());
    }

    #[test]
    fn wait_until_ready_returns_immediately_when_not_in_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let key = Fingerprint("k".into());
        let now = Utc::now();
        backend.put(&key, serde_json::json!(1), now, now).unwrap();
        match backend.wait_until_ready(&key, StdDuration::from_millis(50)).unwrap() {
            WaitOutcome::Ready(entry) => assert_eq!(entry.value, Some(serde_json::json!(1))),
            WaitOutcome::TimedOut => panic!("expected ready"),
        }
    }

    #[test]
    fn wait_until_ready_times_out_while_in_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let key = Fingerprint("k".into());
        backend.mark_in_flight(&key).unwrap();
        let outcome = backend.wait_until_ready(&key, StdDuration::from_millis(30)).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn sweep_expired_leases_clears_only_stale_in_flight_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp, Layout::SingleFile);
        let expired = Fingerprint("expired".into());
        let fresh = Fingerprint("fresh".into());

        backend.mark_in_flight(&expired).unwrap();
        backend.mark_in_flight(&fresh).unwrap();

        // Backdate the "expired" entry's claim so it looks abandoned.
        let mut map = backend.read_single_file();
        map.get_mut(&expired).unwrap().claimed_at = Some(Utc::now() - chrono::Duration::seconds(120));
        backend.write_single_file(&map).unwrap();

        let reclaimed = backend.sweep_expired_leases(chrono::Duration::seconds(30)).unwrap();
        assert_eq!(reclaimed, 1);
        assert!(!backend.get(&expired).unwrap().unwrap().in_flight);
        assert!(backend.get(&fresh).unwrap().unwrap().in_flight, "a fresh claim must survive the sweep");
    }
}
