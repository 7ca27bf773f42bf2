//! Cluster plumbing: peer membership, the consistent-hash ring, pooled peer
//! RPC and the per-peer dispatch queues that move points to their owner.

pub mod dispatch;
pub mod error;
pub mod membership;
pub mod pool;
pub mod queue;
pub mod ring;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use ringwatch_common::types::MetricPoint;
use serde::{Deserialize, Serialize};

pub use dispatch::{DispatchConfig, Dispatcher};
pub use membership::{Membership, MembershipConfig, Peer, Roster};
pub use pool::{ConnPool, PoolConfig};
pub use queue::DispatchQueue;
pub use ring::{rule_key, HashRing, RingHandle};

/// Path of the peer RPC endpoint that accepts forwarded points.
pub const PEER_POINTS_PATH: &str = "/v1/peer/points";

/// Body of a peer-to-peer point forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerBatch {
    /// Instance id of the sender.
    pub from: String,
    pub points: Vec<MetricPoint>,
}

/// Transport used by dispatch writers to ship a batch to a remote peer.
#[async_trait]
pub trait BatchSender: Send + Sync {
    /// Sends one batch. A single attempt; the caller decides on retries.
    async fn send(&self, peer: &str, points: &[MetricPoint]) -> error::Result<()>;

    /// Releases every resource held for `peer` after it left the roster.
    fn forget(&self, _peer: &str) {}
}

/// In-process receiver of points owned by this instance.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn deliver(&self, points: Vec<MetricPoint>);
}
