//! Membership coordinator: the admin-facing operations that add, remove,
//! lock and unlock backend nodes, drive redistribution, and mirror the same
//! changes received from sibling gateways over the peer channel.
//!
//! Grounded on `friend.c`'s `add_server`/`remove_server` coordinator
//! functions: fleet mutex, then per-target distributed lock via (H), then
//! the redistribution walk, then a peer broadcast of the now-committed
//! change. Remote-originated changes (`apply_remote`, called from
//! `peer::handle_peer_connection`) only mirror membership/status locally --
//! redistribution is driven once by the gateway that originated the admin
//! command, not replayed by every peer that hears about it.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{info, warn};

use crate::peer::PeerClient;
use crate::peer::PeerMessage;
use crate::pool::PoolConfig;
use crate::registry::{BackendNode, Fleet, NodeStatus, RegistryError};
use crate::redistribution;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("a peer rejected the distributed lock for {ip}:{port}")]
    PeerRejectedLock { ip: String, port: u16 },
    #[error("import file error: {0}")]
    Import(#[from] std::io::Error),
    #[error("malformed import record: {0}")]
    MalformedImportRecord(String),
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub replications: usize,
    pub default_pool_cfg: PoolConfig,
}

/// One synthesized record from an import file, ready to be handed to
/// whatever submits commands to the dispatch engine the same way a real
/// client connection would.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub verb: String,
    pub key: Vec<u8>,
    pub flags: u32,
    pub exptime: i64,
    pub data: Vec<u8>,
}

impl ImportRecord {
    /// Synthesizes the full wire command a client would have sent:
    /// `<verb> <key> <flags> <exptime> <bytes> noreply\r\n<data>\r\n`.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.key.len() + self.data.len());
        buf.extend_from_slice(self.verb.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(format!(" {} {} {} noreply\r\n", self.flags, self.exptime, self.data.len()).as_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// Callback the composition root wires up to submit a synthesized import
/// record's wire bytes through the same parsing/dispatch path a real client
/// connection uses. Kept as a plain boxed closure rather than a trait so
/// `membership` doesn't need to depend on `protocol`/`dispatch` directly.
pub type ImportSubmit = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Parses an import file: records are `<verb> <key> <flags> <exptime>\n<data>\n` pairs.
pub fn parse_import_file(path: &Path) -> Result<Vec<ImportRecord>, MembershipError> {
    let contents = std::fs::read_to_string(path)?;
    let mut lines = contents.lines();
    let mut records = Vec::new();
    while let Some(header) = lines.next() {
        if header.trim().is_empty() {
            continue;
        }
        let mut tokens = header.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| MembershipError::MalformedImportRecord(header.to_string()))?
            .to_string();
        let key = tokens
            .next()
            .ok_or_else(|| MembershipError::MalformedImportRecord(header.to_string()))?
            .as_bytes()
            .to_vec();
        let flags: u32 = tokens
            .next()
            .ok_or_else(|| MembershipError::MalformedImportRecord(header.to_string()))?
            .parse()
            .map_err(|_| MembershipError::MalformedImportRecord(header.to_string()))?;
        let exptime: i64 = tokens
            .next()
            .ok_or_else(|| MembershipError::MalformedImportRecord(header.to_string()))?
            .parse()
            .map_err(|_| MembershipError::MalformedImportRecord(header.to_string()))?;
        let data = lines
            .next()
            .ok_or_else(|| MembershipError::MalformedImportRecord("missing data line".to_string()))?
            .as_bytes()
            .to_vec();
        records.push(ImportRecord { verb, key, flags, exptime, data });
    }
    Ok(records)
}

pub struct Membership {
    fleet: Arc<Fleet>,
    peers: PeerClient,
    cfg: MembershipConfig,
}

impl Membership {
    pub fn new(fleet: Arc<Fleet>, peers: PeerClient, cfg: MembershipConfig) -> Arc<Membership> {
        Arc::new(Membership { fleet, peers, cfg })
    }

    async fn lock_local_and_peers(&self, node: &Arc<BackendNode>) -> bool {
        node.set_status(NodeStatus::Locked);
        if self.peers.is_empty() {
            return true;
        }
        if self.peers.lock_all(&node.ip, node.port).await {
            true
        } else {
            node.set_status(NodeStatus::Active);
            false
        }
    }

    async fn unlock_local_and_peers(&self, node: &Arc<BackendNode>, restore: NodeStatus) {
        node.set_status(restore);
        if !self.peers.is_empty() {
            self.peers.unlock_all(&node.ip, node.port).await;
        }
    }

    /// `add_server(ip, port, scale)` per §4.I: attach in PREPARE, lock the
    /// successor (and the node that falls off the replica chain, if any),
    /// redistribute, unlock, broadcast. The whole sequence runs under the
    /// fleet's membership mutex (`Fleet::with_membership_lock`) so two
    /// concurrent add/remove calls can never interleave their redistribution
    /// work against overlapping snapshots.
    pub async fn add_server(&self, ip: String, port: u16, scale_factor: u32) -> Result<String, MembershipError> {
        self.fleet
            .with_membership_lock(move |guard| async move {
                let new_id = guard.add_node(ip.clone(), port, scale_factor, self.cfg.default_pool_cfg.clone())?;
                let snapshot = guard.snapshot();

                if snapshot.ring.physical_node_count() > 1 {
                    if let Some(nserver_id) = snapshot.ring.successor(new_id) {
                        let nserver = snapshot.node(nserver_id).clone();
                        let _nserver_guard = nserver.coordination.lock().await;
                        if !self.lock_local_and_peers(&nserver).await {
                            return Err(MembershipError::PeerRejectedLock { ip: nserver.ip.clone(), port: nserver.port });
                        }

                        // The node that was the last replica in nserver's chain no
                        // longer needs to hold keys that just moved to the newcomer.
                        let dserver_id = snapshot.ring.successors_after(nserver_id, self.cfg.replications).last().copied();
                        let dserver = dserver_id.filter(|&id| id != nserver_id).map(|id| snapshot.node(id).clone());
                        let mut dserver_guard = None;
                        if let Some(d) = &dserver {
                            let guard = d.coordination.lock().await;
                            if !self.lock_local_and_peers(d).await {
                                self.unlock_local_and_peers(&nserver, NodeStatus::Active).await;
                                return Err(MembershipError::PeerRejectedLock { ip: d.ip.clone(), port: d.port });
                            }
                            dserver_guard = Some(guard);
                        }

                        redistribution::redistribute_add(&self.fleet, nserver_id, new_id, dserver_id).await;

                        self.unlock_local_and_peers(&nserver, NodeStatus::Active).await;
                        if let Some(d) = &dserver {
                            self.unlock_local_and_peers(d, NodeStatus::Active).await;
                        }
                        drop(dserver_guard);
                    }
                }

                self.peers.add_all(&ip, port, scale_factor.min(u16::MAX as u32) as u16).await;
                info!(ip, port, scale_factor, "server added");
                Ok(format!("OK fleet_size={}", guard.snapshot().nodes.len()))
            })
            .await
    }

    /// `remove_server(ip, port)` per §4.I: lock the target, redistribute if
    /// the fleet can still afford the configured replication count, detach.
    /// Runs under the fleet's membership mutex for the same reason as
    /// `add_server`.
    pub async fn remove_server(&self, ip: String, port: u16) -> Result<String, MembershipError> {
        self.fleet
            .with_membership_lock(move |guard| async move {
                let snapshot = guard.snapshot();
                let doomed_id = snapshot
                    .find(&ip, port)
                    .ok_or_else(|| RegistryError::NotFound { ip: ip.clone(), port })?;
                let doomed = snapshot.node(doomed_id).clone();
                let _doomed_guard = doomed.coordination.lock().await;

                if !self.lock_local_and_peers(&doomed).await {
                    return Err(MembershipError::PeerRejectedLock { ip, port });
                }

                if snapshot.nodes.len() - 1 > self.cfg.replications {
                    if let Some(nserver_id) = snapshot.ring.successor(doomed_id) {
                        if let Some(tserver_id) = snapshot.ring.successors_after(nserver_id, self.cfg.replications).last().copied() {
                            redistribution::redistribute_remove(&self.fleet, doomed_id, nserver_id, tserver_id).await;
                        }
                    }
                }

                self.peers.remove_all(&ip, port).await;
                // The node is leaving the fleet entirely, so there is no lock to
                // release for it afterward (see Open Question (b)); remove_node
                // tears its pool down as part of detach.
                match guard.remove_node(&ip, port).await {
                    Ok(_) => {
                        info!(ip, port, "server removed");
                        Ok(format!("OK fleet_size={}", guard.snapshot().nodes.len()))
                    }
                    Err(e) => {
                        self.unlock_local_and_peers(&doomed, NodeStatus::Active).await;
                        Err(e.into())
                    }
                }
            })
            .await
    }

    /// `unlock_server`: transitions LOCKED→ACTIVE locally and broadcasts UNLOCK.
    pub async fn unlock_server(&self, ip: String, port: u16) -> Result<String, MembershipError> {
        let snapshot = self.fleet.snapshot();
        let id = snapshot
            .find(&ip, port)
            .ok_or_else(|| RegistryError::NotFound { ip: ip.clone(), port })?;
        snapshot.node(id).set_status(NodeStatus::Active);
        self.peers.unlock_all(&ip, port).await;
        Ok("OK".to_string())
    }

    /// `hash_server(keys…)`: purely informational owner lookup.
    pub fn hash_server(&self, keys: &[Vec<u8>]) -> Vec<(Vec<u8>, Option<(String, u16)>)> {
        let snapshot = self.fleet.snapshot();
        keys.iter()
            .map(|key| {
                let owner = snapshot.ring.get(key).map(|id| {
                    let node = snapshot.node(id);
                    (node.ip.clone(), node.port)
                });
                (key.clone(), owner)
            })
            .collect()
    }

    /// `import <file>`: parses the file and feeds each synthesized record
    /// through `submit`, which the composition root wires to the same
    /// parse-then-dispatch path a real client connection uses.
    pub async fn import(&self, path: &Path, submit: &ImportSubmit) -> Result<usize, MembershipError> {
        let records = parse_import_file(path)?;
        let count = records.len();
        for record in records {
            submit(record.to_wire()).await;
        }
        info!(count, path = %path.display(), "import complete");
        Ok(count)
    }

    /// Applies a remotely-originated gossip message locally. Never
    /// re-broadcasts -- the originating gateway owns the broadcast fan-out.
    pub async fn apply_remote(&self, msg: PeerMessage) -> bool {
        match msg {
            PeerMessage::Add { ip, port, scale_factor } => {
                match self.fleet.add_node(ip.clone(), port, scale_factor as u32, self.cfg.default_pool_cfg.clone()).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(ip, port, error = %e, "remote ADD rejected");
                        false
                    }
                }
            }
            PeerMessage::Remove { ip, port } => match self.fleet.remove_node(&ip, port).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(ip, port, error = %e, "remote REMOVE rejected");
                    false
                }
            },
            PeerMessage::Lock { ip, port } => {
                let snapshot = self.fleet.snapshot();
                match snapshot.find(&ip, port) {
                    Some(id) => {
                        snapshot.node(id).set_status(NodeStatus::Locked);
                        true
                    }
                    None => false,
                }
            }
            PeerMessage::Unlock { ip, port } => {
                let snapshot = self.fleet.snapshot();
                match snapshot.find(&ip, port) {
                    Some(id) => {
                        snapshot.node(id).set_status(NodeStatus::Active);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendNode;
    use std::io::Write;
    use std::time::Duration;

    fn node(ip: &str) -> Arc<BackendNode> {
        BackendNode::new(ip.to_string(), 11211, 100, PoolConfig::default()).unwrap()
    }

    fn membership_no_peers(nodes: Vec<Arc<BackendNode>>) -> Arc<Membership> {
        let fleet = Arc::new(Fleet::new(nodes));
        let peers = PeerClient::new(vec![], Duration::from_millis(100));
        Membership::new(fleet, peers, MembershipConfig { replications: 1, default_pool_cfg: PoolConfig::default() })
    }

    #[tokio::test]
    async fn add_server_with_no_peers_always_succeeds_locally() {
        let m = membership_no_peers(vec![node("10.0.0.1")]);
        let reply = m.add_server("10.0.0.2".to_string(), 11211, 100).await.unwrap();
        assert!(reply.contains("fleet_size=2"));
    }

    #[tokio::test]
    async fn remove_unknown_server_errors() {
        let m = membership_no_peers(vec![node("10.0.0.1")]);
        let err = m.remove_server("10.0.0.9".to_string(), 11211).await.unwrap_err();
        assert!(matches!(err, MembershipError::Registry(RegistryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn hash_server_resolves_owners() {
        let m = membership_no_peers(vec![node("10.0.0.1"), node("10.0.0.2")]);
        let result = m.hash_server(&[b"foo".to_vec()]);
        assert_eq!(result.len(), 1);
        assert!(result[0].1.is_some());
    }

    #[tokio::test]
    async fn apply_remote_add_attaches_node() {
        let m = membership_no_peers(vec![node("10.0.0.1")]);
        let ok = m
            .apply_remote(PeerMessage::Add {
                ip: "10.0.0.2".into(),
                port: 11211,
                scale_factor: 50,
            })
            .await;
        assert!(ok);
    }

    #[test]
    fn parses_two_record_import_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "set foo 0 0").unwrap();
        writeln!(file, "hello").unwrap();
        writeln!(file, "set bar 0 0").unwrap();
        writeln!(file, "world").unwrap();
        let records = parse_import_file(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, b"foo");
        assert_eq!(records[0].data, b"hello");
        let wire = records[0].to_wire();
        assert!(wire.starts_with(b"set foo 0 0 5 noreply\r\n"));
    }
}
