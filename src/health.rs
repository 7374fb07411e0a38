//! The active health-check loop: periodically probes every backend with a
//! plain-text `version` command and drives ACTIVE/INACTIVE transitions, with
//! an optional auto-detach of sustained failures.
//!
//! Grounded on `ds_check.c`'s `ds_active_check_thread`: sleep the configured
//! interval, walk the fleet, reconnect-then-probe INACTIVE nodes (the
//! backend may have restarted), and on a live node going dark call the same
//! coordinating removal path a manual admin REMOVE would use.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::membership::Membership;
use crate::registry::{BackendNode, Fleet, NodeStatus};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub active_check_interval: Duration,
    pub datastore_timeout: Duration,
    pub auto_detach: bool,
}

/// Fresh, non-pooled probe: pooled connections aren't used here because a
/// node can be detached mid-check, and that would free the pool out from
/// under an in-flight probe.
async fn probe(node: &BackendNode, datastore_timeout: Duration) -> bool {
    let connect = TcpStream::connect(node.addr());
    let mut stream = match tokio::time::timeout(datastore_timeout, connect).await {
        Ok(Ok(s)) => s,
        _ => return false,
    };

    if stream.write_all(b"version\r\n").await.is_err() {
        return false;
    }

    let read = async {
        let mut buf = [0u8; 128];
        let mut total = 0usize;
        loop {
            if total >= buf.len() {
                return false;
            }
            match stream.read(&mut buf[total..]).await {
                Ok(0) => return false,
                Ok(n) => {
                    total += n;
                    if buf[..total].windows(2).any(|w| w == b"\r\n") {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    };
    tokio::time::timeout(datastore_timeout, read).await.unwrap_or(false)
}

async fn check_one(node: &Arc<BackendNode>, cfg: &HealthConfig, membership: &Arc<Membership>) {
    if node.status() == NodeStatus::Locked {
        return;
    }
    if node.status() == NodeStatus::Inactive {
        node.pool.reset().await;
    }

    let alive = probe(node, cfg.datastore_timeout).await;
    let previous = node.status();

    if alive {
        if matches!(previous, NodeStatus::Prepare | NodeStatus::Inactive) {
            node.set_status(NodeStatus::Active);
            info!(ip = %node.ip, port = node.port, "backend transitioned to ACTIVE");
        }
    } else if previous != NodeStatus::Inactive {
        node.set_status(NodeStatus::Inactive);
        warn!(ip = %node.ip, port = node.port, "backend transitioned to INACTIVE");
        if cfg.auto_detach && previous == NodeStatus::Active {
            let ip = node.ip.clone();
            let port = node.port;
            match membership.remove_server(ip.clone(), port).await {
                Ok(_) => info!(ip, port, "auto-detached unresponsive backend"),
                Err(e) => warn!(ip, port, error = %e, "auto-detach failed"),
            }
        }
    }
}

/// Runs until cancelled. Per the grounding codebase, a non-positive interval
/// means health-checking is disabled entirely -- the task returns immediately.
pub async fn run(fleet: Arc<Fleet>, membership: Arc<Membership>, cfg: HealthConfig, cancel: CancellationToken) {
    if cfg.active_check_interval.is_zero() {
        info!("active_check_interval is 0; health-check loop disabled");
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("health-check loop shutting down");
                return;
            }
            _ = tokio::time::sleep(cfg.active_check_interval) => {}
        }

        let snapshot = fleet.snapshot();
        for node in &snapshot.nodes {
            check_one(node, &cfg, &membership).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use tokio::net::TcpListener;

    async fn mock_version_server(reply_with_line: bool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                let _ = sock.read(&mut buf).await;
                if reply_with_line {
                    let _ = sock.write_all(b"VERSION 1.0\r\n").await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_succeeds_on_crlf_reply() {
        let addr = mock_version_server(true).await;
        let node = BackendNode::new(addr.ip().to_string(), addr.port(), 10, PoolConfig::default()).unwrap();
        assert!(probe(&node, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn probe_fails_when_connection_closes_without_reply() {
        let addr = mock_version_server(false).await;
        let node = BackendNode::new(addr.ip().to_string(), addr.port(), 10, PoolConfig::default()).unwrap();
        assert!(!probe(&node, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn prepare_node_transitions_to_active_on_successful_probe() {
        let addr = mock_version_server(true).await;
        let node = BackendNode::new(addr.ip().to_string(), addr.port(), 10, PoolConfig::default()).unwrap();
        let fleet = Arc::new(Fleet::new(vec![node.clone()]));
        let peers = crate::peer::PeerClient::new(vec![], Duration::from_millis(100));
        let membership = Membership::new(
            fleet,
            peers,
            crate::membership::MembershipConfig { replications: 1, default_pool_cfg: PoolConfig::default() },
        );
        let cfg = HealthConfig {
            active_check_interval: Duration::from_secs(1),
            datastore_timeout: Duration::from_millis(500),
            auto_detach: false,
        };
        assert_eq!(node.status(), NodeStatus::Prepare);
        check_one(&node, &cfg, &membership).await;
        assert_eq!(node.status(), NodeStatus::Active);
    }
}
