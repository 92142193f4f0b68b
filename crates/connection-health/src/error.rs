//! Error types for refresh coordination and health tracking

/// Errors from coordinator, tracker and scheduler operations.
///
/// Provider failures are not represented here: they are classified into
/// `RefreshResult::Failure` and never escape as errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] connection_store::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("queue error: {0}")]
    Queue(String),
}

/// Result alias for connection health operations.
pub type Result<T> = std::result::Result<T, Error>;
