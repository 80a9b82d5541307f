//! Error types for key and settings persistence

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("duplicate key id: {0}")]
    Duplicate(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database(e.to_string())
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
