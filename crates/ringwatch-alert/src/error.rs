use ringwatch_storage::error::StorageError;

/// Errors raised while loading rules and mutes or evaluating them.
///
/// # Examples
///
/// ```rust
/// use ringwatch_alert::error::AlertError;
///
/// let err = AlertError::Configuration("unknown aggregate 'median'".to_string());
/// assert!(err.to_string().contains("median"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// A rule or mute cannot be compiled (bad regexp, unknown operator or
    /// aggregate, malformed expression).
    #[error("Alert: configuration error: {0}")]
    Configuration(String),

    /// The configuration store failed.
    #[error("Alert: store error: {0}")]
    Store(#[from] StorageError),

    /// The time-series backend failed or returned an unusable answer.
    #[error("Alert: TSDB error: {0}")]
    Tsdb(String),

    /// A persisted active event cannot be decoded.
    #[error("Alert: corrupt persisted event {hash}: {reason}")]
    CorruptEvent { hash: String, reason: String },
}

impl AlertError {
    /// Errors after which the process must exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AlertError::CorruptEvent { .. })
    }
}

impl From<regex::Error> for AlertError {
    fn from(e: regex::Error) -> Self {
        AlertError::Configuration(e.to_string())
    }
}

impl From<serde_json::Error> for AlertError {
    fn from(e: serde_json::Error) -> Self {
        AlertError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AlertError>;
