// crates/store/src/error.rs
use thiserror::Error;

/// Errors raised by a `StateStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cannot connect to state store at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("Key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] globset::Error),
}

impl StoreError {
    /// The backend could not be reached, as opposed to answering with an error.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Connection { .. } => true,
            StoreError::Redis(e) => e.is_io_error(),
            StoreError::WrongType { .. } | StoreError::Pattern(_) => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
