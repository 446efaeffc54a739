//! Wire envelope types for `recall`'s storage backends.
//!
//! These types are the on-disk and over-the-wire representation of a cache
//! entry. They are deliberately thin — no behavior beyond construction and
//! field access — so that the file backend and the shared-state backend can
//! serialize/deserialize them without depending on the orchestration crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the function a cache entry belongs to.
///
/// Two distinct functions never share a namespace: `module` plus `qualifier`
/// (the enclosing class/type, when the function is a method) plus `name`
/// together must be unique for every cached callable in a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    /// Module path the function is declared in (e.g. `myapp::pricing`).
    pub module: String,
    /// Enclosing type name, when the function is a method. `None` for free functions.
    #[serde(default)]
    pub qualifier: Option<String>,
    /// The function's own name.
    pub name: String,
}

impl FunctionId {
    /// Build a function identity for a free function.
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            qualifier: None,
            name: name.into(),
        }
    }

    /// Build a function identity for a method on `qualifier`.
    #[must_use]
    pub fn method(module: impl Into<String>, qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }

    /// A stable, filesystem- and key-safe encoding of this identity.
    ///
    /// Used to derive the per-function directory name for the file backend
    /// and the partition prefix for the shared-state backend.
    #[must_use]
    pub fn slug(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{q}.{}", self.module, self.name),
            None => format!("{}.{}", self.module, self.name),
        }
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// An opaque, deterministic fingerprint of a call's arguments.
///
/// Two calls that are equivalent after canonicalization (positional vs
/// named, receiver elided) produce equal fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Borrow the fingerprint as its string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The stored record for one `(FunctionId, Fingerprint)` pair.
///
/// Invariants (enforced by the backends and the orchestrator, not by this
/// type itself):
/// - `timestamp` is set at completion of the producing call, never at claim time.
/// - `in_flight = true` implies `value` is absent, or is a previously
///   published result retained for the return-old-value-on-stale policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryEnvelope {
    /// The stored result, serialized as JSON. Absent for a bare in-flight marker.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// When `value` was produced. Absent until the first successful completion.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// True while a producer has claimed this key and not yet published a result.
    #[serde(default)]
    pub in_flight: bool,
    /// When set, a producer acquired the in-flight marker at this instant.
    /// Used by lease-based backends to decide when a marker is reclaimable.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// True when a successful recomputation is known to be in progress for an
    /// already-present value (suppresses duplicate fire-and-forget triggers).
    #[serde(default)]
    pub stale: Option<bool>,
    /// When set, the instant a `clear`/`clear_all` last tombstoned this key.
    /// A `put` whose originating claim predates this instant is silently
    /// dropped: clear wins the race against an abandoned producer.
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
}

impl EntryEnvelope {
    /// A fresh, empty record with no value and no in-flight claim.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            value: None,
            timestamp: None,
            in_flight: false,
            claimed_at: None,
            stale: None,
            cleared_at: None,
        }
    }

    /// A record representing a just-claimed in-flight marker with no prior value.
    #[must_use]
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            value: None,
            timestamp: None,
            in_flight: true,
            claimed_at: Some(now),
            stale: None,
            cleared_at: None,
        }
    }

    /// A record representing a published result. Clears any prior tombstone:
    /// a successful publish is by definition newer than whatever `clear`
    /// preceded it.
    #[must_use]
    pub fn published(value: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            timestamp: Some(timestamp),
            in_flight: false,
            claimed_at: None,
            stale: None,
            cleared_at: None,
        }
    }

    /// A tombstone left behind by `clear`/`clear_all`, recording when the
    /// clear happened so a late `put` from an already-in-flight producer can
    /// be identified and dropped.
    #[must_use]
    pub fn cleared(now: DateTime<Utc>) -> Self {
        Self {
            value: None,
            timestamp: None,
            in_flight: false,
            claimed_at: None,
            stale: None,
            cleared_at: Some(now),
        }
    }

    /// Whether this record carries a usable value (published, or retained
    /// under the return-old-value-on-stale policy).
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Whether a write whose originating claim happened at `since` must be
    /// dropped because a clear tombstoned this key afterward.
    #[must_use]
    pub fn superseded_by_clear(&self, since: DateTime<Utc>) -> bool {
        self.cleared_at.is_some_and(|cleared_at| cleared_at > since)
    }
}

/// A document in the shared-state backend: an [`EntryEnvelope`] plus the
/// `(function_id, key)` pair that identifies it. Primary key is
/// `(function_id, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDocument {
    /// The function this entry belongs to.
    pub function_id: FunctionId,
    /// The argument fingerprint.
    pub key: Fingerprint,
    /// The entry payload.
    #[serde(flatten)]
    pub entry: EntryEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_id_slug_includes_qualifier_for_methods() {
        let free = FunctionId::new("myapp::pricing", "quote");
        let method = FunctionId::method("myapp::pricing", "Quoter", "quote");
        assert_eq!(free.slug(), "myapp::pricing.quote");
        assert_eq!(method.slug(), "myapp::pricing.Quoter.quote");
        assert_ne!(free.slug(), method.slug());
    }

    #[test]
    fn function_id_equality_requires_full_tuple() {
        let a = FunctionId::method("m", "A", "f");
        let b = FunctionId::method("m", "B", "f");
        assert_ne!(a, b, "distinct enclosing types must not collide");
    }

    #[test]
    fn entry_envelope_claim_has_no_value() {
        let now = Utc::now();
        let claimed = EntryEnvelope::claim(now);
        assert!(claimed.in_flight);
        assert!(!claimed.has_value());
        assert_eq!(claimed.claimed_at, Some(now));
    }

    #[test]
    fn entry_envelope_published_clears_in_flight() {
        let now = Utc::now();
        let published = EntryEnvelope::published(serde_json::json!(42), now);
        assert!(!published.in_flight);
        assert!(published.has_value());
        assert_eq!(published.timestamp, Some(now));
    }

    #[test]
    fn shared_document_round_trips_through_json() {
        let doc = SharedDocument {
            function_id: FunctionId::new("m", "f"),
            key: Fingerprint("abc123".to_string()),
            entry: EntryEnvelope::published(serde_json::json!("hello"), Utc::now()),
        };
        let encoded = serde_json::to_string(&doc).unwrap();
        let decoded: SharedDocument = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.function_id, doc.function_id);
        assert_eq!(decoded.key, doc.key);
        assert_eq!(decoded.entry.value, doc.entry.value);
    }
}
