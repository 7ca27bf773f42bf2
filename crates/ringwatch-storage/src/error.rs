/// Errors that can occur within the configuration store.
///
/// # Examples
///
/// ```rust
/// use ringwatch_storage::error::StorageError;
///
/// let err = StorageError::Unavailable("connection refused".to_string());
/// assert!(err.to_string().contains("connection refused"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure (e.g. mute tag filters).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database file or its directory could not be prepared.
    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store is temporarily unreachable.
    #[error("Storage: unavailable: {0}")]
    Unavailable(String),
}

/// Convenience `Result` alias for store operations.
pub type Result<T> = std::result::Result<T, StorageError>;
