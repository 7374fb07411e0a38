//! Key-level ownership recomputation and movement on topology change.
//!
//! Grounded on `redistribution.c`'s two directions (ADD streams from the new
//! node's successor and pushes keys that now belong to the newcomer; REMOVE
//! streams from the doomed node's successor and pushes keys that need a fresh
//! replica once the doomed node's copy is gone), reworked onto the binary
//! `bkeys`/`bget`/`bset` helpers in `datablock` and pool-acquired connections
//! instead of direct sockets. Every sub-call failure is logged and the walk
//! continues -- this is explicitly best-effort, per §4.J.

use tracing::warn;

use crate::datablock::{self, DataBlockError};
use crate::pool::PoolError;
use crate::registry::{BackendNode, Fleet, FleetSnapshot};
use crate::ring::NodeId;
use crate::wire::Framed;

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
    #[error(transparent)]
    DataBlock(#[from] DataBlockError),
}

/// Streams all keys currently held by `node` via `bkeys`.
async fn stream_keys(node: &BackendNode) -> Result<Vec<Vec<u8>>, StepError> {
    let conn = node.pool.acquire().await?;
    let overflow = conn.overflow_flag();
    let mut framed = Framed::new(conn.stream);
    let result = datablock::bkeys(&mut framed).await;
    let reset = result.is_err();
    node.pool.release_stream(framed.into_inner(), overflow, reset).await;
    Ok(result?)
}

/// Copies one key from `from` to `to` via `bget`/`bset`.
async fn move_key(snapshot: &FleetSnapshot, from: NodeId, to: NodeId, key: &[u8]) -> Result<(), StepError> {
    let from_node = snapshot.node(from);
    let to_node = snapshot.node(to);

    let from_conn = from_node.pool.acquire().await?;
    let from_overflow = from_conn.overflow_flag();
    let mut from_framed = Framed::new(from_conn.stream);
    let block = datablock::bget(&mut from_framed, key).await;
    from_node.pool.release_stream(from_framed.into_inner(), from_overflow, block.is_err()).await;
    let block = match block? {
        Some(b) => b,
        None => return Ok(()), // gone by the time we streamed it; nothing to move
    };

    let to_conn = to_node.pool.acquire().await?;
    let to_overflow = to_conn.overflow_flag();
    let mut to_framed = Framed::new(to_conn.stream);
    let result = datablock::bset(&mut to_framed, key, &block).await;
    to_node.pool.release_stream(to_framed.into_inner(), to_overflow, result.is_err()).await;
    result?;
    Ok(())
}

async fn delete_key_noreply(snapshot: &FleetSnapshot, node: NodeId, key: &[u8]) -> Result<(), StepError> {
    let node = snapshot.node(node);
    let conn = node.pool.acquire().await?;
    let overflow = conn.overflow_flag();
    let mut framed = Framed::new(conn.stream);
    let mut line = Vec::with_capacity(16 + key.len());
    line.extend_from_slice(b"delete ");
    line.extend_from_slice(key);
    line.extend_from_slice(b" noreply");
    let result = crate::wire::write_command(&mut framed, &line, None).await;
    node.pool.release_stream(framed.into_inner(), overflow, result.is_err()).await;
    Ok(result?)
}

/// Add-direction redistribution: pivot is the successor of the new node.
/// `dserver`, if present, is the node that no longer needs a replica of a key
/// that just moved to `new_node` (computed once by the membership
/// coordinator for the whole operation, per §4.I).
pub async fn redistribute_add(fleet: &Fleet, pivot: NodeId, new_node: NodeId, dserver: Option<NodeId>) {
    let snapshot = fleet.snapshot();
    let keys = match stream_keys(snapshot.node(pivot)).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "add-direction redistribution: bkeys failed");
            return;
        }
    };

    let mut moved = 0usize;
    for key in &keys {
        if snapshot.ring.get(key) != Some(new_node) {
            continue;
        }
        if let Err(e) = move_key(&snapshot, pivot, new_node, key).await {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "add-direction redistribution: move failed");
            continue;
        }
        moved += 1;
        if let Some(dserver) = dserver {
            if let Err(e) = delete_key_noreply(&snapshot, dserver, key).await {
                warn!(key = %String::from_utf8_lossy(key), error = %e, "add-direction redistribution: cleanup delete failed");
            }
        }
    }
    tracing::info!(moved, total = keys.len(), "add-direction redistribution complete");
}

/// Remove-direction redistribution: pivot is the successor of the doomed
/// node, tserver is `replications` hops past pivot. Every key the doomed
/// node currently owns (on the ring as it exists *before* the node is
/// detached) loses a replica once that node is gone, so a fresh copy is
/// forwarded from pivot to tserver to keep the replication count. This must
/// run before the doomed node is detached from the fleet: the doomed node's
/// virtual points are scattered across the whole ring, so recomputing
/// ownership against a ring that already excludes it reassigns each of its
/// keys to whichever node happens to be nearest on the *post-removal* ring
/// -- almost never pivot -- and the doomed node's replicated keys would
/// silently stop being forwarded.
pub async fn redistribute_remove(fleet: &Fleet, doomed: NodeId, pivot: NodeId, tserver: NodeId) {
    let snapshot = fleet.snapshot();

    let keys = match stream_keys(snapshot.node(pivot)).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "remove-direction redistribution: bkeys failed");
            return;
        }
    };

    let mut moved = 0usize;
    for key in &keys {
        if snapshot.ring.get(key) != Some(doomed) {
            continue;
        }
        if let Err(e) = move_key(&snapshot, pivot, tserver, key).await {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "remove-direction redistribution: move failed");
            continue;
        }
        moved += 1;
    }
    tracing::info!(moved, total = keys.len(), "remove-direction redistribution complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A minimal in-memory `bkeys`/`bget`/`bset`/`delete` backend, just
    /// enough of `dataio.c`'s wire layout for `redistribute_add`/
    /// `redistribute_remove` to drive against. Serves every accepted
    /// connection against the same shared store.
    async fn mock_store(initial: Vec<(&'static str, &'static str)>) -> (std::net::SocketAddr, StdArc<StdMutex<std::collections::HashMap<Vec<u8>, Vec<u8>>>>) {
        let store: std::collections::HashMap<Vec<u8>, Vec<u8>> =
            initial.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec())).collect();
        let store = StdArc::new(StdMutex::new(store));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_store = store.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let store = accept_store.clone();
                tokio::spawn(async move {
                    loop {
                        let mut line = Vec::new();
                        let mut byte = [0u8; 1];
                        loop {
                            match sock.read(&mut byte).await {
                                Ok(0) => return,
                                Ok(_) => {}
                                Err(_) => return,
                            }
                            if byte[0] == b'\n' && line.last() == Some(&b'\r') {
                                line.pop();
                                break;
                            }
                            line.push(byte[0]);
                        }

                        if line == b"bkeys" {
                            let keys: Vec<Vec<u8>> = store.lock().unwrap().keys().cloned().collect();
                            for key in keys {
                                let _ = sock.write_all(&[key.len() as u8]).await;
                                let _ = sock.write_all(&key).await;
                            }
                            let _ = sock.write_all(&[0u8]).await;
                        } else if let Some(key) = line.strip_prefix(b"bget ") {
                            let value = store.lock().unwrap().get(key).cloned();
                            match value {
                                Some(data) => {
                                    let mut reply = Vec::new();
                                    reply.push(b'V');
                                    reply.extend_from_slice(&(data.len() as u32).to_le_bytes());
                                    reply.push(0u8); // stat
                                    reply.extend_from_slice(&0u64.to_le_bytes()); // cas
                                    reply.extend_from_slice(&data);
                                    let _ = sock.write_all(&reply).await;
                                }
                                None => {
                                    let _ = sock.write_all(b"n").await;
                                }
                            }
                        } else if let Some(key) = line.strip_prefix(b"bset ") {
                            let mut hdr = [0u8; 4 + 1 + 8];
                            if sock.read_exact(&mut hdr).await.is_err() {
                                return;
                            }
                            let size = u32::from_le_bytes(hdr[0..4].try_into().unwrap()) as usize;
                            let mut data = vec![0u8; size];
                            if sock.read_exact(&mut data).await.is_err() {
                                return;
                            }
                            store.lock().unwrap().insert(key.to_vec(), data);
                            let _ = sock.write_all(b"OK").await;
                        } else if let Some(rest) = line.strip_prefix(b"delete ") {
                            let key = rest.strip_suffix(b" noreply").unwrap_or(rest);
                            store.lock().unwrap().remove(key);
                        }
                    }
                });
            }
        });
        (addr, store)
    }

    fn node(ip_port: (std::net::IpAddr, u16)) -> std::sync::Arc<BackendNode> {
        BackendNode::new(ip_port.0.to_string(), ip_port.1, 50, PoolConfig::default()).unwrap()
    }

    /// Finds a key whose owner under `ring` matches `want_owner` (or, when
    /// `want_owner` is `None`, any key whose owner differs from `avoid`).
    fn find_key(ring: &crate::ring::Ring, want_owner: Option<NodeId>, avoid: NodeId) -> Vec<u8> {
        for i in 0..10_000u32 {
            let candidate = format!("key-{i}").into_bytes();
            let owner = ring.get(&candidate);
            match want_owner {
                Some(want) if owner == Some(want) => return candidate,
                None if owner.is_some() && owner != Some(avoid) => return candidate,
                _ => {}
            }
        }
        panic!("no candidate key found for the requested ownership");
    }

    #[tokio::test]
    async fn remove_direction_only_forwards_keys_the_doomed_node_owned() {
        let (addr_a, _) = mock_store(vec![]).await;
        let (addr_b, store_b) = mock_store(vec![]).await; // pivot: holds replicas, including the doomed node's
        let (addr_c, store_c) = mock_store(vec![]).await; // tserver

        let node_a = node((addr_a.ip(), addr_a.port()));
        let node_b = node((addr_b.ip(), addr_b.port()));
        let node_c = node((addr_c.ip(), addr_c.port()));
        // `doomed`'s own address never needs a live listener: redistribute_remove
        // only streams keys from pivot and writes to tserver.
        let doomed = BackendNode::new("127.0.0.1".to_string(), 1, 50, PoolConfig::default()).unwrap();

        let fleet = Fleet::new(vec![node_a, node_b.clone(), node_c.clone(), doomed.clone()]);
        let snapshot = fleet.snapshot();
        let doomed_id = snapshot.find(&doomed.ip, doomed.port).unwrap();
        let pivot_id = snapshot.find(&node_b.ip, node_b.port).unwrap();
        let tserver_id = snapshot.find(&node_c.ip, node_c.port).unwrap();

        let owned_by_doomed = find_key(&snapshot.ring, Some(doomed_id), doomed_id);
        let owned_elsewhere = find_key(&snapshot.ring, None, doomed_id);

        store_b.lock().unwrap().insert(owned_by_doomed.clone(), b"replica-of-doomed".to_vec());
        store_b.lock().unwrap().insert(owned_elsewhere.clone(), b"unrelated".to_vec());

        redistribute_remove(&fleet, doomed_id, pivot_id, tserver_id).await;

        let tserver_contents = store_c.lock().unwrap().clone();
        assert_eq!(
            tserver_contents.get(&owned_by_doomed),
            Some(&b"replica-of-doomed".to_vec()),
            "a key the doomed node owned pre-removal must be forwarded to tserver"
        );
        assert!(
            !tserver_contents.contains_key(&owned_elsewhere),
            "a key the doomed node never owned must not be forwarded"
        );
    }

    #[tokio::test]
    async fn add_direction_forwards_only_keys_claimed_by_the_new_node() {
        let (addr_pivot, store_pivot) = mock_store(vec![]).await;
        let (addr_new, store_new) = mock_store(vec![]).await;

        let pivot_node = node((addr_pivot.ip(), addr_pivot.port()));
        let new_node = node((addr_new.ip(), addr_new.port()));

        let fleet = Fleet::new(vec![pivot_node.clone(), new_node.clone()]);
        let snapshot = fleet.snapshot();
        let pivot_id = snapshot.find(&pivot_node.ip, pivot_node.port).unwrap();
        let new_id = snapshot.find(&new_node.ip, new_node.port).unwrap();

        let claimed = find_key(&snapshot.ring, Some(new_id), new_id);
        let not_claimed = find_key(&snapshot.ring, Some(pivot_id), new_id);

        store_pivot.lock().unwrap().insert(claimed.clone(), b"moves".to_vec());
        store_pivot.lock().unwrap().insert(not_claimed.clone(), b"stays".to_vec());

        redistribute_add(&fleet, pivot_id, new_id, None).await;

        let new_contents = store_new.lock().unwrap().clone();
        assert_eq!(new_contents.get(&claimed), Some(&b"moves".to_vec()));
        assert!(!new_contents.contains_key(&not_claimed));
    }
}
