/// Reasons the evaluator process stops with a failure.
///
/// # Examples
///
/// ```rust
/// use ringwatch_server::error::ServerError;
///
/// let err = ServerError::StoreUnavailable("database is locked".to_string());
/// assert_eq!(err.exit_code(), 2);
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server: configuration error: {0}")]
    Config(String),

    /// The configuration store cannot be reached during startup.
    #[error("Server: configuration store unavailable: {0}")]
    StoreUnavailable(String),

    /// Duplicate instance id, corrupt persisted event, listener failure.
    #[error("Server: fatal: {0}")]
    Fatal(String),
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Config(_) => 1,
            ServerError::StoreUnavailable(_) => 2,
            ServerError::Fatal(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
