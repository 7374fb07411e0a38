//! The "friend" gossip protocol: a small binary control channel between
//! sibling gateways used for membership broadcast and distributed locking.
//!
//! Grounded on `friend.c`'s wire format and fail-atomic lock semantics
//! (`friend_lock_server` rolls back with an UNLOCK broadcast on any reject),
//! reworked onto `wire::Framed` for the binary reads/writes and
//! `tokio::net::TcpListener` + `tokio_util::sync::CancellationToken` for the
//! listener loop in the style of the client front-end's accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::membership::Membership;
use crate::wire::Framed;

const ACK: u8 = b'A';
const REJECT: u8 = b'R';

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer call timed out")]
    Timeout,
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
}

#[derive(Debug, Clone, Copy)]
enum Cmd {
    Add = 1,
    Remove = 2,
    Lock = 3,
    Unlock = 4,
}

/// One gossip message: `| cmd(1) | iplen(1) | ip(iplen) | port(u16-le) | scale(u16-le, ADD only) |`.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Add { ip: String, port: u16, scale_factor: u16 },
    Remove { ip: String, port: u16 },
    Lock { ip: String, port: u16 },
    Unlock { ip: String, port: u16 },
}

impl PeerMessage {
    fn cmd(&self) -> Cmd {
        match self {
            PeerMessage::Add { .. } => Cmd::Add,
            PeerMessage::Remove { .. } => Cmd::Remove,
            PeerMessage::Lock { .. } => Cmd::Lock,
            PeerMessage::Unlock { .. } => Cmd::Unlock,
        }
    }

    fn ip(&self) -> &str {
        match self {
            PeerMessage::Add { ip, .. }
            | PeerMessage::Remove { ip, .. }
            | PeerMessage::Lock { ip, .. }
            | PeerMessage::Unlock { ip, .. } => ip,
        }
    }

    fn port(&self) -> u16 {
        match self {
            PeerMessage::Add { port, .. }
            | PeerMessage::Remove { port, .. }
            | PeerMessage::Lock { port, .. }
            | PeerMessage::Unlock { port, .. } => *port,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let ip = self.ip();
        let mut buf = Vec::with_capacity(8 + ip.len());
        buf.push(self.cmd() as u8);
        buf.push(ip.len() as u8);
        buf.extend_from_slice(ip.as_bytes());
        buf.extend_from_slice(&self.port().to_le_bytes());
        if let PeerMessage::Add { scale_factor, .. } = self {
            buf.extend_from_slice(&scale_factor.to_le_bytes());
        }
        buf
    }

    async fn decode(framed: &mut Framed<TcpStream>) -> Result<PeerMessage, PeerError> {
        let cmd = framed.read_u8().await?;
        let iplen = framed.read_u8().await? as usize;
        let ip_bytes = framed.read_exact_n(iplen).await?;
        let ip = String::from_utf8_lossy(&ip_bytes).into_owned();
        let port = framed.read_u16_le().await?;
        match cmd {
            1 => {
                let scale_factor = framed.read_u16_le().await?;
                Ok(PeerMessage::Add { ip, port, scale_factor })
            }
            2 => Ok(PeerMessage::Remove { ip, port }),
            3 => Ok(PeerMessage::Lock { ip, port }),
            4 => Ok(PeerMessage::Unlock { ip, port }),
            other => Err(PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown friend command byte {other}"),
            ))),
        }
    }
}

/// Accepts one connection per message: decode, apply locally, ack/reject.
pub async fn run_listener(addr: SocketAddr, membership: Arc<Membership>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "peer listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("peer listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!(error = %e, "peer accept failed"); continue; }
                };
                let membership = membership.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_peer_connection(stream, &membership).await {
                        warn!(%peer_addr, error = %e, "peer connection failed");
                    }
                });
            }
        }
    }
}

async fn handle_peer_connection(stream: TcpStream, membership: &Membership) -> Result<(), PeerError> {
    let mut framed = Framed::new(stream);
    let msg = PeerMessage::decode(&mut framed).await?;
    debug!(?msg, "received peer message");
    let ok = membership.apply_remote(msg).await;
    framed.write_all(&[if ok { ACK } else { REJECT }]).await?;
    framed.flush().await?;
    Ok(())
}

/// Client side: broadcasts gossip messages to every configured peer.
pub struct PeerClient {
    peers: Vec<(String, u16)>,
    wait_time: Duration,
}

impl PeerClient {
    pub fn new(peers: Vec<(String, u16)>, wait_time: Duration) -> PeerClient {
        PeerClient { peers, wait_time }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    async fn call_one(&self, peer: &(String, u16), msg: &PeerMessage) -> Result<bool, PeerError> {
        let connect = TcpStream::connect((peer.0.as_str(), peer.1));
        let stream = timeout(self.wait_time, connect).await.map_err(|_| PeerError::Timeout)??;
        let mut framed = Framed::new(stream);
        framed.write_all(&msg.encode()).await?;
        framed.flush().await?;
        let ack = timeout(self.wait_time, framed.read_u8()).await.map_err(|_| PeerError::Timeout)??;
        Ok(ack == ACK)
    }

    /// Broadcasts to every peer. A peer that can't be reached or times out
    /// counts as a reject, per §4.H/§5.
    pub async fn broadcast(&self, msg: PeerMessage) -> Vec<bool> {
        let calls = self.peers.iter().map(|peer| {
            let msg = msg.clone();
            async move {
                match self.call_one(peer, &msg).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(peer = %peer.0, port = peer.1, error = %e, "friend call failed");
                        false
                    }
                }
            }
        });
        futures::future::join_all(calls).await
    }

    /// Fail-atomic LOCK: any reject rolls back with a broadcast UNLOCK.
    pub async fn lock_all(&self, ip: &str, port: u16) -> bool {
        let results = self
            .broadcast(PeerMessage::Lock {
                ip: ip.to_string(),
                port,
            })
            .await;
        if results.iter().all(|&ok| ok) {
            true
        } else {
            warn!(ip, port, "peer rejected lock, rolling back");
            self.unlock_all(ip, port).await;
            false
        }
    }

    pub async fn unlock_all(&self, ip: &str, port: u16) {
        self.broadcast(PeerMessage::Unlock {
            ip: ip.to_string(),
            port,
        })
        .await;
    }

    pub async fn add_all(&self, ip: &str, port: u16, scale_factor: u16) {
        self.broadcast(PeerMessage::Add {
            ip: ip.to_string(),
            port,
            scale_factor,
        })
        .await;
    }

    pub async fn remove_all(&self, ip: &str, port: u16) {
        self.broadcast(PeerMessage::Remove {
            ip: ip.to_string(),
            port,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_add_with_scale_factor() {
        let msg = PeerMessage::Add {
            ip: "10.0.0.1".into(),
            port: 11211,
            scale_factor: 100,
        };
        let buf = msg.encode();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[1] as usize, "10.0.0.1".len());
        assert_eq!(&buf[2..2 + 8], b"10.0.0.1");
        let port = u16::from_le_bytes([buf[10], buf[11]]);
        assert_eq!(port, 11211);
        let scale = u16::from_le_bytes([buf[12], buf[13]]);
        assert_eq!(scale, 100);
    }

    #[tokio::test]
    async fn round_trips_through_decode() {
        let msg = PeerMessage::Remove {
            ip: "192.168.1.5".into(),
            port: 15432,
        };
        let encoded = msg.encode();
        let (mut client, server) = tokio::io::duplex(256);
        use tokio::io::AsyncWriteExt;
        client.write_all(&encoded).await.unwrap();
        let mut framed = Framed::new(server);
        // decode() requires a TcpStream concretely in this module's signature,
        // so exercise the wire-level reads it performs directly here.
        let cmd = framed.read_u8().await.unwrap();
        assert_eq!(cmd, 2);
        let iplen = framed.read_u8().await.unwrap() as usize;
        let ip = framed.read_exact_n(iplen).await.unwrap();
        assert_eq!(ip, b"192.168.1.5");
        let port = framed.read_u16_le().await.unwrap();
        assert_eq!(port, 15432);
    }
}
