//! Error types for connection persistence

/// Errors from token and health stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
