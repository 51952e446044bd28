//! Error types for the engine, drivers and the streaming adapter.

use thiserror::Error;

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A driver failed; the run was cancelled
    #[error("driver failed: {0}")]
    Driver(#[source] Box<Error>),

    /// Object store request failed
    #[error("object store error: {0}")]
    Store(String),

    /// A downstream queue was closed before the send completed
    #[error("queue closed before send completed")]
    Closed,

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An input could not be interpreted
    #[error("invalid input `{0}`")]
    Input(String),

    /// Remote fetch failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("glob error: {0}")]
    Glob(#[from] glob::GlobError),

    /// A worker task panicked or was aborted
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Wrap a driver-side failure.
    pub fn driver(err: Error) -> Self {
        match err {
            Error::Driver(_) => err,
            other => Error::Driver(Box::new(other)),
        }
    }
}
