//! A trivial in-memory [`StorageBackend`], used only by this crate's own
//! tests — a minimal specialization of the contract, not exposed outside
//! `#[cfg(test)]` builds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use recall_wire::{EntryEnvelope as Entry, Fingerprint};

use super::{StorageBackend, WaitOutcome};
use crate::error::Result;

#[derive(Default)]
pub(crate) struct InMemoryBackend {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
}

impl InMemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &Fingerprint, value: serde_json::Value, ts: DateTime<Utc>, since: DateTime<Utc>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            if existing.superseded_by_clear(since) {
                return Ok(());
            }
        }
        entries.insert(key.clone(), Entry::published(value, ts));
        Ok(())
    }

    fn mark_in_flight(&self, key: &Fingerprint) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.in_flight => Ok(false),
            Some(entry) => {
                let mut claimed = entry.clone();
                claimed.in_flight = true;
                claimed.claimed_at = Some(Utc::now());
                entries.insert(key.clone(), claimed);
                Ok(true)
            }
            None => {
                entries.insert(key.clone(), Entry::claim(Utc::now()));
                Ok(true)
            }
        }
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.in_flight = false;
            entry.claimed_at = None;
        }
        Ok(())
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.stale == Some(true) => Ok(false),
            Some(entry) => {
                entry.stale = Some(true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<()> {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            entry.stale = None;
        }
        Ok(())
    }

    fn clear(&self, key: &Fingerprint) -> Result<()> {
        self.entries.lock().unwrap().insert(key.clone(), Entry::cleared(Utc::now()));
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            *entry = Entry::cleared(now);
        }
        Ok(())
    }

    fn wait_until_ready(&self, key: &Fingerprint, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.entries.lock().unwrap().get(key).cloned();
            match snapshot {
                Some(entry) if !entry.in_flight => return Ok(WaitOutcome::Ready(entry)),
                None => return Ok(WaitOutcome::Ready(Entry::empty())),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_in_flight_is_exclusive() {
        let backend = InMemoryBackend::new();
        let key = Fingerprint("k".to_string());
        assert!(backend.mark_in_flight(&key).unwrap());
        assert!(!backend.mark_in_flight(&key).unwrap());
    }

    #[test]
    fn put_clears_in_flight() {
        let backend = InMemoryBackend::new();
        let key = Fingerprint("k".to_string());
        backend.mark_in_flight(&key).unwrap();
        let now = Utc::now();
        backend.put(&key, serde_json::json!(1), now, now).unwrap();
        let entry = backend.get(&key).unwrap().unwrap();
        assert!(!entry.in_flight);
        assert_eq!(entry.value, Some(serde_json::json!(1)));
    }

    #[test]
    fn clear_all_removes_every_entry() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        backend.put(&Fingerprint("a".into()), serde_json::json!(1), now, now).unwrap();
        backend.put(&Fingerprint("b".into()), serde_json::json!(2), now, now).unwrap();
        backend.clear_all().unwrap();
        assert!(!backend.get(&Fingerprint("a".into())).unwrap().unwrap().has_value());
        assert!(!backend.get(&Fingerprint("b".into())).unwrap().unwrap().has_value());
    }
}
