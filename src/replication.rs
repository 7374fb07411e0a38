//! Asynchronous N-way replication: a pool of workers drains a FIFO of
//! replication records, each fanning a SET/DELETE out to `replications`
//! successors of the record's origin node using the binary `bget`/`bset`
//! verbs (or plain `delete noreply` for deletes).
//!
//! Grounded on `replication.c`'s delayed-start fan-out (`replication_delay_time`
//! before acting, so the primary settles first) mapped onto a bounded
//! `tokio::sync::mpsc` channel standing in for the original pthread
//! queue+condvar, per the concurrency model's "message-passing channel per
//! stage" design note.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::datablock::{self, DataBlock};
use crate::registry::{CmdGroup, Fleet, FleetSnapshot};
use crate::ring::NodeId;
use crate::wire::{self, Framed};

#[derive(Debug, Clone)]
pub struct ReplicationRecord {
    pub origin: NodeId,
    pub group: CmdGroup,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub replications: usize,
    pub replication_threads: usize,
    pub replication_delay_time: Duration,
    pub queue_depth: usize,
}

/// Handle used by the dispatch engine to enqueue replication work.
#[derive(Clone)]
pub struct ReplicationHandle {
    tx: mpsc::Sender<ReplicationRecord>,
}

impl ReplicationHandle {
    /// Enqueues a record. Never blocks the caller on replication itself;
    /// if the queue is momentarily full this awaits channel capacity the
    /// same way the original's queue push blocks a dispatch thread -- the
    /// channel depth stands in for the original queue's depth.
    pub async fn enqueue(&self, record: ReplicationRecord) {
        if self.tx.send(record).await.is_err() {
            warn!("replication queue is closed; dropping record");
        }
    }
}

async fn fetch_block(node: &crate::registry::BackendNode, key: &[u8]) -> Result<Option<DataBlock>, anyhow::Error> {
    let conn = node.pool.acquire().await?;
    let overflow = conn.overflow_flag();
    let mut framed = Framed::new(conn.stream);
    let result = datablock::bget(&mut framed, key).await;
    node.pool.release_stream(framed.into_inner(), overflow, result.is_err()).await;
    Ok(result?)
}

async fn push_block(node: &crate::registry::BackendNode, key: &[u8], block: &DataBlock) -> Result<(), anyhow::Error> {
    let conn = node.pool.acquire().await?;
    let overflow = conn.overflow_flag();
    let mut framed = Framed::new(conn.stream);
    let result = datablock::bset(&mut framed, key, block).await;
    node.pool.release_stream(framed.into_inner(), overflow, result.is_err()).await;
    Ok(result?)
}

async fn delete_noreply(node: &crate::registry::BackendNode, key: &[u8]) -> Result<(), anyhow::Error> {
    let conn = node.pool.acquire().await?;
    let overflow = conn.overflow_flag();
    let mut framed = Framed::new(conn.stream);
    let mut line = Vec::with_capacity(16 + key.len());
    line.extend_from_slice(b"delete ");
    line.extend_from_slice(key);
    line.extend_from_slice(b" noreply");
    let result = wire::write_command(&mut framed, &line, None).await;
    node.pool.release_stream(framed.into_inner(), overflow, result.is_err()).await;
    Ok(result?)
}

async fn replicate_one(snapshot: &FleetSnapshot, record: &ReplicationRecord, replications: usize) {
    let targets = snapshot.ring.successors_after(record.origin, replications);
    match record.group {
        CmdGroup::Delete => {
            for target in targets {
                if let Err(e) = delete_noreply(snapshot.node(target), &record.key).await {
                    warn!(key = %String::from_utf8_lossy(&record.key), target, error = %e, "replication delete failed");
                }
            }
        }
        CmdGroup::Set | CmdGroup::Get => {
            // GET never enqueues a replication record (see dispatch); kept
            // exhaustive so a future caller misuse fails loudly instead of
            // silently skipping replication.
            let origin_node = snapshot.node(record.origin);
            match fetch_block(origin_node, &record.key).await {
                Ok(None) => {} // primary no longer has it; nothing to propagate
                Ok(Some(block)) => {
                    for target in targets {
                        if let Err(e) = push_block(snapshot.node(target), &record.key, &block).await {
                            warn!(key = %String::from_utf8_lossy(&record.key), target, error = %e, "replication bset failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&record.key), error = %e, "replication bget from origin failed");
                }
            }
        }
    }
}

/// Spawns `cfg.replication_threads` workers sharing one queue and returns a
/// handle dispatch can use to enqueue records.
pub fn spawn_workers(fleet: Arc<Fleet>, cfg: ReplicationConfig, cancel: CancellationToken) -> ReplicationHandle {
    let (tx, rx) = mpsc::channel(cfg.queue_depth.max(1));
    let rx = Arc::new(AsyncMutex::new(rx));

    for worker_id in 0..cfg.replication_threads.max(1) {
        let fleet = fleet.clone();
        let rx = rx.clone();
        let cancel = cancel.clone();
        let delay = cfg.replication_delay_time;
        let replications = cfg.replications;
        tokio::spawn(async move {
            loop {
                let record = {
                    let mut guard = rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        record = guard.recv() => record,
                    }
                };
                let Some(record) = record else {
                    tracing::debug!(worker_id, "replication worker shutting down");
                    return;
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let snapshot = fleet.snapshot();
                replicate_one(&snapshot, &record, replications).await;
            }
        });
    }

    ReplicationHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::registry::BackendNode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn mock_backend(reply: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if sock.write_all(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn delete_group_fans_out_to_successors() {
        let addr_a = mock_backend(b"").await;
        let addr_b = mock_backend(b"").await;
        let node_a = BackendNode::new(addr_a.ip().to_string(), addr_a.port(), 10, PoolConfig::default()).unwrap();
        let node_b = BackendNode::new(addr_b.ip().to_string(), addr_b.port(), 10, PoolConfig::default()).unwrap();
        let fleet = Arc::new(Fleet::new(vec![node_a, node_b]));
        let snapshot = fleet.snapshot();

        let record = ReplicationRecord {
            origin: 0,
            group: CmdGroup::Delete,
            key: b"foo".to_vec(),
        };
        // exercises the fan-out path directly without a real timing delay
        replicate_one(&snapshot, &record, 1).await;
    }

    #[tokio::test]
    async fn handle_enqueue_reaches_a_worker() {
        let addr = mock_backend(b"n").await; // bget replies "not found"
        let node = BackendNode::new(addr.ip().to_string(), addr.port(), 10, PoolConfig::default()).unwrap();
        let fleet = Arc::new(Fleet::new(vec![node]));
        let cancel = CancellationToken::new();
        let handle = spawn_workers(
            fleet,
            ReplicationConfig {
                replications: 0,
                replication_threads: 1,
                replication_delay_time: Duration::from_millis(0),
                queue_depth: 8,
            },
            cancel.clone(),
        );
        handle
            .enqueue(ReplicationRecord {
                origin: 0,
                group: CmdGroup::Set,
                key: b"x".to_vec(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    }
}
