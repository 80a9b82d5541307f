//! Error types for pool operations

/// Errors from pool and rotating-client operations.
///
/// Ineligibility is not an error: pools return `None` and the credits preflight
/// returns `Preflight::Blocked`. These variants cover exceptional conditions
/// and the terminal outcomes of the rotation loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No {0} API keys available")]
    NoKeysAvailable(&'static str),

    #[error("key store error: {0}")]
    Store(#[from] key_store::Error),

    #[error("failed to decrypt key {key_id}: {message}")]
    Decrypt { key_id: String, message: String },

    #[error(transparent)]
    Upstream(#[from] provider::ProviderError),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
