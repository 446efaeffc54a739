//! Argument fingerprinting (C1).
//!
//! A [`Fingerprinter`] turns a call's arguments into a deterministic
//! [`Fingerprint`]. Two calls that are equivalent after canonicalization
//! (positional vs. named, receiver elided) must produce equal fingerprints —
//! that's the whole contract this module exists to uphold.

use std::collections::BTreeMap;

use recall_wire::Fingerprint;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The canonicalized argument set for one call, keyed by parameter name.
///
/// Using a `BTreeMap` rather than the caller's original positional/named
/// mix is what makes `f(1, 2)` and `f(a=1, b=2)` fingerprint identically:
/// both are normalized to this map before hashing.
pub type CallArgs = BTreeMap<String, serde_json::Value>;

/// Produces a [`Fingerprint`] from a function's canonicalized call arguments.
///
/// Implementations may be swapped in to support argument types that don't
/// serialize deterministically by default (e.g. a caller-supplied producer
/// that strips a volatile field before hashing).
pub trait Fingerprinter: Send + Sync {
    /// Compute the fingerprint for one call.
    ///
    /// `is_method` signals that `args` still contains the receiver under the
    /// conventional `self` key; implementations that honor receiver elision
    /// must strip it before hashing.
    fn fingerprint(&self, args: &CallArgs, is_method: bool) -> Result<Fingerprint>;
}

/// The receiver parameter name elided from method calls before hashing.
///
/// Per spec, a method's fingerprint must not depend on its receiver identity
/// (two instances of the same type calling the same method with the same
/// arguments hit the same cache entry), only on the method's own arguments.
const RECEIVER_KEY: &str = "self";

/// Default [`Fingerprinter`]: SHA-256 over the canonical JSON encoding of
/// the (receiver-elided) argument map.
///
/// Canonicalization here means exactly one thing — `serde_json::Value`'s
/// `Map` variant preserves insertion order, but `CallArgs` is a `BTreeMap`,
/// so keys are already lexicographically sorted by the time they reach
/// `serde_json::to_vec`. No further normalization (e.g. float formatting,
/// nested-object key order inside an argument's own value) is attempted;
/// see the crate-level note on fingerprint equivalence for that limitation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFingerprinter;

impl Fingerprinter for DefaultFingerprinter {
    fn fingerprint(&self, args: &CallArgs, is_method: bool) -> Result<Fingerprint> {
        let mut canonical = args.clone();
        if is_method {
            canonical.remove(RECEIVER_KEY);
        }

        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| Error::ArgumentNotFingerprintable(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();

        Ok(Fingerprint(hex_encode(&digest)))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
