//! The consistent-hash ring: key placement, successor walks and add/remove.
//!
//! Grounded on `loadbalance/consistent_hash.rs`'s virtual-node/picker shape
//! (sorted point array, binary-search placement, distinct-physical-node walk)
//! generalized from that module's `Address`-keyed weighted instances to the
//! gateway's own `NodeId` (a plain index into the fleet's node vector, per the
//! "cyclic structures become integer indices" design note -- the ring never
//! shares ownership of nodes).

use crate::hash::ring_hash;

/// Index into the fleet's node vector. The ring never owns nodes, only refers
/// to them by id.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy)]
struct RingPoint {
    hash: u32,
    node: NodeId,
    primary: bool,
}

/// A node's identity and weight as seen by the ring builder.
#[derive(Debug, Clone)]
pub struct RingEntry {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub scale_factor: u32,
}

/// Sorted array of ring points plus the distinct physical-node order derived
/// from it. Immutable once built; membership changes rebuild a fresh `Ring`
/// under the fleet-wide mutex and swap it in (see `registry::Fleet`).
#[derive(Debug, Clone, Default)]
pub struct Ring {
    points: Vec<RingPoint>,
    physical: Vec<NodeId>,
}

impl Ring {
    /// Builds a ring from scratch. One primary point per node (`"<ip>-<port>"`)
    /// plus `scale_factor` virtual points (`"<ip>-<i>"`), sorted ascending by
    /// hash. The physical-node order used for successor walks is the order in
    /// which each node's *primary* point appears in that sorted array.
    pub fn build(entries: &[RingEntry]) -> Ring {
        let mut points = Vec::with_capacity(entries.iter().map(|e| 1 + e.scale_factor as usize).sum());
        for entry in entries {
            points.push(RingPoint {
                hash: ring_hash(&format!("{}-{}", entry.ip, entry.port)),
                node: entry.id,
                primary: true,
            });
            for i in 0..entry.scale_factor {
                points.push(RingPoint {
                    hash: ring_hash(&format!("{}-{}", entry.ip, i)),
                    node: entry.id,
                    primary: false,
                });
            }
        }
        points.sort_by_key(|p| p.hash);

        let physical = points.iter().filter(|p| p.primary).map(|p| p.node).collect();

        Ring { points, physical }
    }

    pub fn is_empty(&self) -> bool {
        self.physical.is_empty()
    }

    pub fn physical_node_count(&self) -> usize {
        self.physical.len()
    }

    /// Resolves the owning node for `key`: the smallest point whose hash is
    /// `>= hash(key)`, wrapping to index 0 when `hash(key)` exceeds every point.
    pub fn get(&self, key: &[u8]) -> Option<NodeId> {
        if self.points.is_empty() {
            return None;
        }
        let h = crate::hash::murmur2a(key, crate::hash::RING_SEED);
        let idx = self.points.partition_point(|p| p.hash < h);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].node)
    }

    /// The next distinct physical node after `node` in ring order, wrapping.
    /// `None` if `node` is not present or it is the only physical node.
    pub fn successor(&self, node: NodeId) -> Option<NodeId> {
        if self.physical.len() < 2 {
            return None;
        }
        let pos = self.physical.iter().position(|&n| n == node)?;
        Some(self.physical[(pos + 1) % self.physical.len()])
    }

    /// Up to `count` distinct nodes starting at (and including) `start`,
    /// walking successors. Stops early if the walk would revisit a node
    /// already returned (i.e. the ring has fewer physical nodes than `count`).
    /// Used by the dispatch engine's failover walk.
    pub fn candidates(&self, start: NodeId, count: usize) -> Vec<NodeId> {
        if !self.physical.contains(&start) {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(count.min(self.physical.len()));
        let mut cur = start;
        loop {
            if out.contains(&cur) || out.len() >= count {
                break;
            }
            out.push(cur);
            match self.successor(cur) {
                Some(next) if !out.contains(&next) => cur = next,
                _ => break,
            }
        }
        out
    }

    /// Up to `count` distinct nodes strictly after `start`, walking
    /// successors, stopping early if the walk returns to `start`. Used by
    /// the replication engine to pick fan-out targets.
    pub fn successors_after(&self, start: NodeId, count: usize) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(count);
        let mut cur = start;
        for _ in 0..count {
            match self.successor(cur) {
                Some(next) if next != start => {
                    out.push(next);
                    cur = next;
                }
                _ => break,
            }
        }
        out
    }
}
