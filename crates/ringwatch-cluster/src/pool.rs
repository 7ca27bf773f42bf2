use crate::error::{ClusterError, Result};
use crate::membership::Roster;
use crate::{BatchSender, PeerBatch, PEER_POINTS_PATH};
use async_trait::async_trait;
use ringwatch_common::types::MetricPoint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent in-flight calls per peer.
    pub max_active: usize,
    /// Idle keep-alive connections per peer.
    pub max_idle: usize,
    pub dial_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 32,
            max_idle: 8,
            dial_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }
}

struct PeerConn {
    endpoint: String,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

/// Per-peer HTTP client pools for point forwarding.
///
/// A peer's client is built on first use from the endpoint published in the
/// roster, and dropped when the peer leaves or a call fails so the next call
/// dials fresh connections.
pub struct ConnPool {
    config: PoolConfig,
    self_id: String,
    roster: watch::Receiver<Arc<Roster>>,
    peers: Mutex<HashMap<String, Arc<PeerConn>>>,
}

impl ConnPool {
    pub fn new(config: PoolConfig, self_id: &str, roster: watch::Receiver<Arc<Roster>>) -> Self {
        Self {
            config,
            self_id: self_id.to_string(),
            roster,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn lock_peers(&self) -> MutexGuard<'_, HashMap<String, Arc<PeerConn>>> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connection(&self, peer: &str) -> Result<Arc<PeerConn>> {
        let endpoint = self
            .roster
            .borrow()
            .endpoint(peer)
            .map(str::to_string)
            .ok_or_else(|| ClusterError::UnknownPeer(peer.to_string()))?;

        let mut peers = self.lock_peers();
        if let Some(conn) = peers.get(peer) {
            if conn.endpoint == endpoint {
                return Ok(conn.clone());
            }
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.dial_timeout)
            .timeout(self.config.call_timeout)
            .pool_max_idle_per_host(self.config.max_idle)
            .build()
            .map_err(|source| ClusterError::Rpc {
                peer: peer.to_string(),
                source,
            })?;
        let conn = Arc::new(PeerConn {
            endpoint,
            client,
            permits: Arc::new(Semaphore::new(self.config.max_active.max(1))),
        });
        tracing::debug!(peer, endpoint = %conn.endpoint, "Dialed peer pool");
        peers.insert(peer.to_string(), conn.clone());
        Ok(conn)
    }

    fn discard(&self, peer: &str, conn: &Arc<PeerConn>) {
        let mut peers = self.lock_peers();
        if peers.get(peer).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            peers.remove(peer);
        }
    }

    /// Number of peers with a live client.
    pub fn pooled_peers(&self) -> usize {
        self.lock_peers().len()
    }
}

#[async_trait]
impl BatchSender for ConnPool {
    async fn send(&self, peer: &str, points: &[MetricPoint]) -> Result<()> {
        let conn = self.connection(peer)?;
        let _permit = conn
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClusterError::UnknownPeer(peer.to_string()))?;

        let url = format!("{}{}", conn.endpoint.trim_end_matches('/'), PEER_POINTS_PATH);
        let body = PeerBatch {
            from: self.self_id.clone(),
            points: points.to_vec(),
        };
        let resp = match conn.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(source) => {
                self.discard(peer, &conn);
                return Err(ClusterError::Rpc {
                    peer: peer.to_string(),
                    source,
                });
            }
        };
        let status = resp.status();
        if !status.is_success() {
            self.discard(peer, &conn);
            return Err(ClusterError::PeerRejected {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    fn forget(&self, peer: &str) {
        if let Some(conn) = self.lock_peers().remove(peer) {
            conn.permits.close();
            tracing::debug!(peer, "Closed peer pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Peer;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct PeerServer {
        endpoint: String,
        fail: Arc<AtomicBool>,
        received: Arc<AtomicUsize>,
    }

    async fn peer_server() -> PeerServer {
        let fail = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicUsize::new(0));
        let (f, r) = (fail.clone(), received.clone());
        let app = Router::new().route(
            PEER_POINTS_PATH,
            post(move |Json(batch): Json<PeerBatch>| {
                let (fail, received) = (f.clone(), r.clone());
                async move {
                    received.fetch_add(batch.points.len(), Ordering::SeqCst);
                    if fail.load(Ordering::SeqCst) {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        PeerServer {
            endpoint: format!("http://{addr}"),
            fail,
            received,
        }
    }

    fn pool_for(peer: &str, endpoint: &str) -> ConnPool {
        let roster = Roster::new(vec![Peer {
            instance_id: peer.to_string(),
            endpoint: endpoint.to_string(),
        }]);
        let (_tx, rx) = watch::channel(Arc::new(roster));
        ConnPool::new(PoolConfig::default(), "p1", rx)
    }

    fn points(n: usize) -> Vec<MetricPoint> {
        (0..n)
            .map(|i| MetricPoint::new("cpu_util", i as f64, 1_700_000_000))
            .collect()
    }

    #[tokio::test]
    async fn successful_send_keeps_the_client_pooled() {
        let server = peer_server().await;
        let pool = pool_for("p2", &server.endpoint);

        pool.send("p2", &points(3)).await.unwrap();
        pool.send("p2", &points(2)).await.unwrap();
        assert_eq!(server.received.load(Ordering::SeqCst), 5);
        assert_eq!(pool.pooled_peers(), 1);
    }

    #[tokio::test]
    async fn rejected_send_discards_the_client() {
        let server = peer_server().await;
        let pool = pool_for("p2", &server.endpoint);
        pool.send("p2", &points(1)).await.unwrap();
        let before = pool.connection("p2").unwrap();

        server.fail.store(true, Ordering::SeqCst);
        let err = pool.send("p2", &points(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::PeerRejected { status: 500, .. }), "{err:?}");
        assert_eq!(pool.pooled_peers(), 0);

        server.fail.store(false, Ordering::SeqCst);
        pool.send("p2", &points(1)).await.unwrap();
        let after = pool.connection("p2").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_rpc_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let pool = pool_for("p2", &format!("http://{addr}"));

        let err = pool.send("p2", &points(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rpc { .. }), "{err:?}");
        assert_eq!(pool.pooled_peers(), 0);
    }

    #[tokio::test]
    async fn unknown_peer_is_never_dialed() {
        let pool = pool_for("p2", "http://127.0.0.1:1");
        let err = pool.send("ghost", &points(1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownPeer(_)));
        assert_eq!(pool.pooled_peers(), 0);
    }

    #[tokio::test]
    async fn forget_closes_the_peer_permits() {
        let server = peer_server().await;
        let pool = pool_for("p2", &server.endpoint);
        pool.send("p2", &points(1)).await.unwrap();
        let conn = pool.connection("p2").unwrap();

        pool.forget("p2");
        assert_eq!(pool.pooled_peers(), 0);
        assert!(conn.permits.is_closed());
    }
}
