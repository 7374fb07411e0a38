//! The backend registry: node status state machine and the fleet-wide
//! membership snapshot.
//!
//! Grounded on `discovery/mod.rs`'s `Instance`/`Discover` shape (a registry is
//! a list of addressable instances behind a snapshot readers can clone
//! cheaply) generalized with the status state machine and per-node counters
//! from the original `ds_server_t`/`server_t` structures. Per the "cyclic
//! structures become integer indices" design note, `ring::NodeId` is just a
//! node's position in a particular `FleetSnapshot`'s node vector -- it is
//! never meaningful across two different snapshots, so callers always
//! resolve a `NodeId` against the same `Arc<FleetSnapshot>` they obtained it
//! from.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::pool::{Pool, PoolConfig};
use crate::ring::{NodeId, Ring, RingEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Prepare,
    Active,
    Inactive,
    Locked,
}

/// The three command groups the gateway routes and counts, per §4.E/§4.F.
/// `incr`/`decr` route as `Set` for counting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdGroup {
    Set,
    Get,
    Delete,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("backend {ip}:{port} is already present")]
    AlreadyExists { ip: String, port: u16 },
    #[error("backend {ip}:{port} is not present")]
    NotFound { ip: String, port: u16 },
    #[error("fleet would have fewer nodes than the configured replication factor")]
    WouldUnderReplicate,
    #[error("invalid backend address {ip}:{port}: {source}")]
    InvalidAddress { ip: String, port: u16, source: std::net::AddrParseError },
}

/// One backend data-store node: immutable identity, mutable status, monotonic
/// counters and its own connection pool.
pub struct BackendNode {
    pub ip: String,
    pub port: u16,
    pub scale_factor: u32,
    status_tx: watch::Sender<NodeStatus>,
    status_rx: watch::Receiver<NodeStatus>,
    set_count: AtomicU64,
    get_count: AtomicU64,
    del_count: AtomicU64,
    pub pool: Pool,
    /// Guards the coordinating operation that holds this node LOCKED (add,
    /// remove, auto-detach). Not used for per-request status reads, which go
    /// through the lock-free `watch` channel instead.
    pub coordination: AsyncMutex<()>,
}

impl BackendNode {
    pub fn new(ip: String, port: u16, scale_factor: u32, pool_cfg: PoolConfig) -> Result<Arc<BackendNode>, RegistryError> {
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|source| RegistryError::InvalidAddress { ip: ip.clone(), port, source })?;
        let (status_tx, status_rx) = watch::channel(NodeStatus::Prepare);
        Ok(Arc::new(BackendNode {
            ip,
            port,
            scale_factor,
            status_tx,
            status_rx,
            set_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            pool: Pool::new(addr, pool_cfg),
            coordination: AsyncMutex::new(()),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.pool.addr()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status_rx.borrow()
    }

    pub fn set_status(&self, status: NodeStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Busy-waits (via the status watch channel, not polling) up to `timeout`
    /// for the node to become ACTIVE. Returns immediately if already ACTIVE.
    pub async fn wait_until_active(&self, timeout: Duration) -> bool {
        if self.status() == NodeStatus::Active {
            return true;
        }
        let mut rx = self.status_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() == NodeStatus::Active {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub fn increment(&self, group: CmdGroup) {
        let counter = match group {
            CmdGroup::Set => &self.set_count,
            CmdGroup::Get => &self.get_count,
            CmdGroup::Delete => &self.del_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.set_count.load(Ordering::Relaxed),
            self.get_count.load(Ordering::Relaxed),
            self.del_count.load(Ordering::Relaxed),
        )
    }
}

/// An immutable view of fleet membership plus the ring derived from it.
/// `NodeId`s returned by `ring` index `nodes` in this snapshot only.
pub struct FleetSnapshot {
    pub nodes: Vec<Arc<BackendNode>>,
    pub ring: Ring,
}

impl FleetSnapshot {
    fn build(nodes: Vec<Arc<BackendNode>>) -> FleetSnapshot {
        let entries: Vec<RingEntry> = nodes
            .iter()
            .enumerate()
            .map(|(id, n)| RingEntry {
                id,
                ip: n.ip.clone(),
                port: n.port,
                scale_factor: n.scale_factor,
            })
            .collect();
        let ring = Ring::build(&entries);
        FleetSnapshot { nodes, ring }
    }

    pub fn node(&self, id: NodeId) -> &Arc<BackendNode> {
        &self.nodes[id]
    }

    pub fn find(&self, ip: &str, port: u16) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.ip == ip && n.port == port)
    }
}

/// The fleet: current membership snapshot plus the mutex serializing
/// membership-changing operations (add/remove/lock), per §3/§5.
pub struct Fleet {
    membership: AsyncMutex<()>,
    snapshot: RwLock<Arc<FleetSnapshot>>,
}

impl Fleet {
    pub fn new(nodes: Vec<Arc<BackendNode>>) -> Fleet {
        Fleet {
            membership: AsyncMutex::new(()),
            snapshot: RwLock::new(Arc::new(FleetSnapshot::build(nodes))),
        }
    }

    /// Cheap lock-free read of the current membership/ring snapshot.
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Attaches a new node to the fleet in PREPARE status and rebuilds the
    /// ring. Returns the new node's id in the rebuilt snapshot. Callers that
    /// also need to run locking/redistribution as part of the same
    /// membership mutation should reach this through
    /// [`Fleet::with_membership_lock`] instead, via `add_node_locked`, so the
    /// whole sequence stays serialized by one mutex acquisition.
    pub async fn add_node(&self, ip: String, port: u16, scale_factor: u32, pool_cfg: PoolConfig) -> Result<NodeId, RegistryError> {
        let _guard = self.membership.lock().await;
        self.add_node_locked(ip, port, scale_factor, pool_cfg)
    }

    /// Same as [`Fleet::add_node`] but assumes the caller already holds the
    /// membership mutex (e.g. from inside [`Fleet::with_membership_lock`]).
    fn add_node_locked(&self, ip: String, port: u16, scale_factor: u32, pool_cfg: PoolConfig) -> Result<NodeId, RegistryError> {
        let current = self.snapshot();
        if current.find(&ip, port).is_some() {
            return Err(RegistryError::AlreadyExists { ip, port });
        }
        let mut nodes = current.nodes.clone();
        nodes.push(BackendNode::new(ip, port, scale_factor, pool_cfg)?);
        let new_id = nodes.len() - 1;
        *self.snapshot.write().unwrap() = Arc::new(FleetSnapshot::build(nodes));
        Ok(new_id)
    }

    /// Detaches a node: removes it from membership, rebuilds the ring, then
    /// finalizes its pool. Returns the detached node so callers (e.g.
    /// redistribution) can still reach its counters/address for logging.
    pub async fn remove_node(&self, ip: &str, port: u16) -> Result<Arc<BackendNode>, RegistryError> {
        let _guard = self.membership.lock().await;
        self.remove_node_locked(ip, port).await
    }

    /// Same as [`Fleet::remove_node`] but assumes the caller already holds
    /// the membership mutex.
    async fn remove_node_locked(&self, ip: &str, port: u16) -> Result<Arc<BackendNode>, RegistryError> {
        let current = self.snapshot();
        let idx = current
            .find(ip, port)
            .ok_or_else(|| RegistryError::NotFound { ip: ip.to_string(), port })?;
        let removed = current.nodes[idx].clone();
        let nodes: Vec<Arc<BackendNode>> = current
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, n)| n.clone())
            .collect();
        *self.snapshot.write().unwrap() = Arc::new(FleetSnapshot::build(nodes));
        removed.pool.finalize().await;
        Ok(removed)
    }

    /// Runs `f` with the fleet-wide membership mutex held for its entire
    /// duration, so a caller that needs to attach/detach a node *and* run
    /// locking/redistribution around it (per `membership.rs`'s
    /// `add_server`/`remove_server`) gets one serialized critical section
    /// instead of the mutex being released after just the snapshot swap.
    /// `f` receives a [`MembershipLockGuard`] exposing the locked variants of
    /// `add_node`/`remove_node` so it cannot accidentally re-acquire the
    /// same (non-reentrant) mutex.
    pub async fn with_membership_lock<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce(MembershipLockGuard<'_>) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let _guard = self.membership.lock().await;
        f(MembershipLockGuard { fleet: self }).await
    }
}

/// Proof that the fleet's membership mutex is held, handed to the closure
/// passed to [`Fleet::with_membership_lock`]. Only reachable from there.
pub struct MembershipLockGuard<'a> {
    fleet: &'a Fleet,
}

impl MembershipLockGuard<'_> {
    pub fn add_node(&self, ip: String, port: u16, scale_factor: u32, pool_cfg: PoolConfig) -> Result<NodeId, RegistryError> {
        self.fleet.add_node_locked(ip, port, scale_factor, pool_cfg)
    }

    pub async fn remove_node(&self, ip: &str, port: u16) -> Result<Arc<BackendNode>, RegistryError> {
        self.fleet.remove_node_locked(ip, port).await
    }

    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.fleet.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str) -> Arc<BackendNode> {
        BackendNode::new(ip.to_string(), 11211, 100, PoolConfig::default()).unwrap()
    }

    #[test]
    fn new_node_starts_in_prepare() {
        let n = node("127.0.0.1");
        assert_eq!(n.status(), NodeStatus::Prepare);
    }

    #[tokio::test]
    async fn wait_until_active_returns_immediately_when_already_active() {
        let n = node("127.0.0.1");
        n.set_status(NodeStatus::Active);
        assert!(n.wait_until_active(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_until_active_times_out_when_locked() {
        let n = node("127.0.0.1");
        n.set_status(NodeStatus::Locked);
        assert!(!n.wait_until_active(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_until_active_observes_a_late_transition() {
        let n = node("127.0.0.1");
        n.set_status(NodeStatus::Locked);
        let n2 = n.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            n2.set_status(NodeStatus::Active);
        });
        assert!(n.wait_until_active(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn add_then_remove_round_trips_fleet_size() {
        let fleet = Fleet::new(vec![node("10.0.0.1")]);
        let id = fleet
            .add_node("10.0.0.2".into(), 11211, 100, PoolConfig::default())
            .await
            .unwrap();
        assert_eq!(fleet.snapshot().nodes.len(), 2);
        assert_eq!(fleet.snapshot().ring.physical_node_count(), 2);
        assert_eq!(id, 1);

        fleet.remove_node("10.0.0.1", 11211).await.unwrap();
        let snap = fleet.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn add_duplicate_is_rejected() {
        let fleet = Fleet::new(vec![node("10.0.0.1")]);
        let err = fleet
            .add_node("10.0.0.1".into(), 11211, 100, PoolConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn remove_unknown_is_rejected() {
        let fleet = Fleet::new(vec![node("10.0.0.1")]);
        let err = fleet.remove_node("10.0.0.9", 11211).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }
}
