//! Dispatch engine: owner resolution, failover across successors, per-attempt
//! backend execution and reply assembly, including multi-key GET splitting.
//!
//! Grounded on `dispatch.c`'s `do_command`/`client_reply`: check the target's
//! status, borrow a pooled connection, forward the command, validate the
//! expected reply prefix, and on any mid-reply failure reset the connection
//! and retry the next successor -- reworked onto `wire::Framed` and the
//! pool's explicit `release`/`release_stream` contract.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::warn;

use crate::pool::PoolError;
use crate::protocol::ClientCommand;
use crate::registry::{CmdGroup, Fleet, NodeStatus};
use crate::replication::{ReplicationHandle, ReplicationRecord};
use crate::wire::{Framed, WireError};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub lock_wait_time: Duration,
    pub replications: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no eligible backend for this key")]
    NoEligibleBackend,
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug)]
enum AttemptError {
    NotActive,
    Pool(PoolError),
    Wire(WireError),
    UnexpectedReply(Vec<u8>),
}

impl From<WireError> for AttemptError {
    fn from(e: WireError) -> Self {
        AttemptError::Wire(e)
    }
}

#[derive(Clone, Copy)]
enum ReplyExpectation {
    RequirePrefix(&'static str),
    PassThroughLine,
}

pub struct Dispatcher {
    fleet: Arc<Fleet>,
    replication: ReplicationHandle,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(fleet: Arc<Fleet>, replication: ReplicationHandle, cfg: DispatchConfig) -> Dispatcher {
        Dispatcher { fleet, replication, cfg }
    }

    /// Executes one client command end-to-end, writing the reply (unless
    /// `noreply`) to `client`. Introspection/Admin verbs are the caller's
    /// responsibility (the front-end/app answers those directly); passing one
    /// here is a programming error.
    pub async fn execute<S>(&self, client: &mut Framed<S>, cmd: ClientCommand) -> Result<(), DispatchError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match cmd {
            ClientCommand::Storage { key, line, data, noreply, .. } => {
                self.simple_command(client, CmdGroup::Set, &key, &line, Some(&data), ReplyExpectation::RequirePrefix("STORED"), noreply)
                    .await
            }
            ClientCommand::Counter { key, line, noreply, .. } => {
                self.simple_command(client, CmdGroup::Set, &key, &line, None, ReplyExpectation::PassThroughLine, noreply)
                    .await
            }
            ClientCommand::Delete { key, line, noreply, .. } => {
                self.simple_command(client, CmdGroup::Delete, &key, &line, None, ReplyExpectation::RequirePrefix("DELETED"), noreply)
                    .await
            }
            ClientCommand::Retrieval { keys, .. } => self.multi_get(client, &keys).await,
            ClientCommand::Introspection { .. } | ClientCommand::Admin { .. } => {
                unreachable!("introspection/admin commands are handled before reaching dispatch")
            }
        }
    }

    async fn simple_command<S>(
        &self,
        client: &mut Framed<S>,
        group: CmdGroup,
        key: &[u8],
        line: &[u8],
        data: Option<&[u8]>,
        expectation: ReplyExpectation,
        noreply: bool,
    ) -> Result<(), DispatchError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let snapshot = self.fleet.snapshot();
        let Some(owner) = snapshot.ring.get(key) else {
            return self.fail_client(client, noreply, "no backend available").await;
        };
        let candidates = snapshot.ring.candidates(owner, self.cfg.replications + 1);

        for candidate in candidates {
            let node = snapshot.node(candidate);
            if node.status() == NodeStatus::Inactive {
                continue;
            }
            match self.attempt(node, line, data, expectation).await {
                Ok(reply) => {
                    node.increment(group);
                    if !noreply {
                        client.write_all(&reply).await?;
                        client.write_all(b"\r\n").await?;
                        client.flush().await?;
                    }
                    if self.cfg.replications > 0 && matches!(group, CmdGroup::Set | CmdGroup::Delete) {
                        self.replication
                            .enqueue(ReplicationRecord { origin: candidate, group, key: key.to_vec() })
                            .await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(candidate, key = %String::from_utf8_lossy(key), error = ?e, "attempt failed, trying next successor");
                    continue;
                }
            }
        }

        self.fail_client(client, noreply, "all backends exhausted").await
    }

    async fn fail_client<S>(&self, client: &mut Framed<S>, noreply: bool, reason: &str) -> Result<(), DispatchError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if !noreply {
            client.write_all(format!("ERROR {reason}").as_bytes()).await?;
            client.write_all(b"\r\n").await?;
            client.flush().await?;
        }
        Ok(())
    }

    async fn attempt(
        &self,
        node: &Arc<crate::registry::BackendNode>,
        line: &[u8],
        data: Option<&[u8]>,
        expectation: ReplyExpectation,
    ) -> Result<Vec<u8>, AttemptError> {
        if !node.wait_until_active(self.cfg.lock_wait_time).await {
            return Err(AttemptError::NotActive);
        }
        let conn = node.pool.acquire().await.map_err(AttemptError::Pool)?;
        let overflow = conn.overflow_flag();
        let mut framed: Framed<TcpStream> = Framed::new(conn.stream);

        let result = async {
            crate::wire::write_command(&mut framed, line, data).await?;
            let reply = framed.read_line().await?;
            match expectation {
                ReplyExpectation::RequirePrefix(prefix) => {
                    if reply.len() >= prefix.len() && reply[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes()) {
                        Ok(reply)
                    } else {
                        Err(AttemptError::UnexpectedReply(reply))
                    }
                }
                ReplyExpectation::PassThroughLine => Ok(reply),
            }
        }
        .await;

        let reset = result.is_err();
        node.pool.release_stream(framed.into_inner(), overflow, reset).await;
        result
    }

    /// One GET line sub-request against a single backend: returns
    /// `Some((value_header_plus_data, cas_trailing_consumed))` or `None` if
    /// the key wasn't found (backend replied `END` with no VALUE block).
    async fn get_one(&self, node: &Arc<crate::registry::BackendNode>, key: &[u8]) -> Result<Option<Vec<u8>>, AttemptError> {
        if !node.wait_until_active(self.cfg.lock_wait_time).await {
            return Err(AttemptError::NotActive);
        }
        let conn = node.pool.acquire().await.map_err(AttemptError::Pool)?;
        let overflow = conn.overflow_flag();
        let mut framed: Framed<TcpStream> = Framed::new(conn.stream);

        let mut line = Vec::with_capacity(6 + key.len());
        line.extend_from_slice(b"get ");
        line.extend_from_slice(key);

        let result: Result<Option<Vec<u8>>, AttemptError> = async {
            crate::wire::write_command(&mut framed, &line, None).await.map_err(AttemptError::Wire)?;
            let header = framed.read_line().await.map_err(AttemptError::Wire)?;
            if header.starts_with(b"END") {
                return Ok(None);
            }
            if !header.starts_with(b"VALUE") {
                return Err(AttemptError::UnexpectedReply(header));
            }
            let text = String::from_utf8_lossy(&header);
            let bytes: usize = text
                .split_whitespace()
                .nth(3)
                .and_then(|b| b.parse().ok())
                .ok_or_else(|| AttemptError::UnexpectedReply(header.clone()))?;
            let block = framed.read_exact_n(bytes + 2).await.map_err(AttemptError::Wire)?;
            let terminator = framed.read_line().await.map_err(AttemptError::Wire)?;
            if terminator != b"END" {
                return Err(AttemptError::UnexpectedReply(terminator));
            }
            let mut assembled = header.clone();
            assembled.extend_from_slice(b"\r\n");
            assembled.extend_from_slice(&block);
            Ok(Some(assembled))
        }
        .await;

        let reset = result.is_err();
        node.pool.release_stream(framed.into_inner(), overflow, reset).await;
        result
    }

    /// Splits `get k1 k2 … kn` into n independent per-key backend requests
    /// since each key may hash to a different owner. Only the terminating
    /// `END\r\n` is written once, after the last key.
    async fn multi_get<S>(&self, client: &mut Framed<S>, keys: &[Vec<u8>]) -> Result<(), DispatchError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let snapshot = self.fleet.snapshot();
        for key in keys {
            let Some(owner) = snapshot.ring.get(key) else { continue };
            let candidates = snapshot.ring.candidates(owner, self.cfg.replications + 1);

            for candidate in &candidates {
                let node = snapshot.node(*candidate);
                if node.status() == NodeStatus::Inactive {
                    continue;
                }
                match self.get_one(node, key).await {
                    Ok(Some(block)) => {
                        node.increment(CmdGroup::Get);
                        client.write_all(&block).await?;
                        break;
                    }
                    Ok(None) => {
                        node.increment(CmdGroup::Get);
                        break;
                    }
                    Err(e) => {
                        warn!(candidate, key = %String::from_utf8_lossy(key), error = ?e, "get attempt failed, trying next successor");
                        continue;
                    }
                }
            }
        }
        client.write_all(b"END\r\n").await?;
        client.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::registry::BackendNode;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn mock_backend(script: Vec<&'static [u8]>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                for reply in script {
                    let _ = sock.read(&mut buf).await;
                    let _ = sock.write_all(reply).await;
                }
            }
        });
        addr
    }

    fn active_node(addr: std::net::SocketAddr) -> Arc<BackendNode> {
        let n = BackendNode::new(addr.ip().to_string(), addr.port(), 10, PoolConfig::default()).unwrap();
        n.set_status(NodeStatus::Active);
        n
    }

    #[tokio::test]
    async fn set_command_returns_stored() {
        let addr = mock_backend(vec![b"STORED\r\n"]).await;
        let node = active_node(addr);
        let fleet = Arc::new(Fleet::new(vec![node]));
        let cancel = CancellationToken::new();
        let replication = crate::replication::spawn_workers(
            fleet.clone(),
            crate::replication::ReplicationConfig {
                replications: 0,
                replication_threads: 1,
                replication_delay_time: Duration::from_millis(0),
                queue_depth: 8,
            },
            cancel,
        );
        let dispatcher = Dispatcher::new(fleet, replication, DispatchConfig { lock_wait_time: Duration::from_millis(200), replications: 0 });

        let (mut test_client, server_side) = duplex(256);
        let mut client_framed = Framed::new(server_side);
        let cmd = ClientCommand::Storage {
            verb: "set".into(),
            key: b"foo".to_vec(),
            flags: 0,
            exptime: 0,
            cas_unique: None,
            noreply: false,
            data: b"hello".to_vec(),
            line: b"set foo 0 0 5".to_vec(),
        };
        dispatcher.execute(&mut client_framed, cmd).await.unwrap();

        let mut out = vec![0u8; 32];
        let n = test_client.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"STORED\r\n");
    }

    #[tokio::test]
    async fn get_splitting_emits_single_terminating_end() {
        let addr_a = mock_backend(vec![b"VALUE a 0 1\r\nx\r\nEND\r\n"]).await;
        let addr_b = mock_backend(vec![b"END\r\n"]).await;
        let node_a = active_node(addr_a);
        let node_b = active_node(addr_b);
        let fleet = Arc::new(Fleet::new(vec![node_a, node_b]));
        let cancel = CancellationToken::new();
        let replication = crate::replication::spawn_workers(
            fleet.clone(),
            crate::replication::ReplicationConfig {
                replications: 0,
                replication_threads: 1,
                replication_delay_time: Duration::from_millis(0),
                queue_depth: 8,
            },
            cancel,
        );
        let dispatcher = Dispatcher::new(fleet, replication, DispatchConfig { lock_wait_time: Duration::from_millis(200), replications: 0 });

        let (mut test_client, server_side) = duplex(512);
        let mut client_framed = Framed::new(server_side);
        dispatcher.multi_get(&mut client_framed, &[b"a".to_vec(), b"missing".to_vec()]).await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                let n = test_client.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
                if out.ends_with(b"END\r\n") {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.matches("END").count(), 1);
        assert!(out.starts_with(b"VALUE a 0 1\r\nx\r\n"));
    }
}
