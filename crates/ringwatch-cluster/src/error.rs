use ringwatch_storage::error::StorageError;

/// Errors raised by membership, routing and peer RPC.
///
/// # Examples
///
/// ```rust
/// use ringwatch_cluster::error::ClusterError;
///
/// let err = ClusterError::UnknownPeer("p2".to_string());
/// assert!(err.to_string().contains("p2"));
/// assert!(!err.is_fatal());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Reading or writing the heartbeat table failed.
    #[error("Cluster: store error: {0}")]
    Store(#[from] StorageError),

    /// Another live process heartbeats under the same instance id.
    #[error("Cluster: instance id '{instance_id}' is already alive at {other_endpoint}")]
    DuplicateInstance {
        instance_id: String,
        other_endpoint: String,
    },

    /// The peer is not part of the current roster.
    #[error("Cluster: unknown peer '{0}'")]
    UnknownPeer(String),

    /// Building the client or performing the call failed.
    #[error("Cluster: RPC to '{peer}' failed: {source}")]
    Rpc {
        peer: String,
        #[source]
        source: reqwest::Error,
    },

    /// The peer answered with a non-success status.
    #[error("Cluster: peer '{peer}' rejected batch with status {status}")]
    PeerRejected { peer: String, status: u16 },
}

impl ClusterError {
    /// Errors after which the process must exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::DuplicateInstance { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
