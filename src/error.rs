//! Error types for `recall`

use thiserror::Error;

/// Result type alias for `recall`
pub type Result<T> = std::result::Result<T, Error>;

/// `recall` errors
#[derive(Error, Debug)]
pub enum Error {
    /// An argument could not be fingerprinted (unhashable and no custom
    /// fingerprint producer was injected). The orchestrator surfaces this
    /// without attempting the underlying function.
    #[error("argument not fingerprintable: {0}")]
    ArgumentNotFingerprintable(String),

    /// Backend initialization or an operation failed irrecoverably (lock
    /// acquisition failure, connector unreachable, etc). The caller sees no
    /// cache-through for this call.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A computed result could not be serialized for storage. The caller
    /// still receives their computed value; only the write is skipped.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The wrapped user function returned an error. The in-flight marker
    /// for this key has already been released before this variant reaches
    /// the caller.
    #[error("user function failed: {0}")]
    UserFunction(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Configuration could not be loaded or a setter received an invalid
    /// value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying filesystem I/O error from the file backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport error from the shared-state backend's HTTP connector.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Wrap an arbitrary user function error.
    pub fn user_function(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::UserFunction(Box::new(err))
    }
}
