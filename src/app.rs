//! Composition root: wires the fleet, membership coordinator, replication
//! workers, health-check loop, peer listener and client accept loop together
//! behind one `CancellationToken`-driven shutdown.
//!
//! Grounded on the control-flow sketch in §2/§5: one accept task per
//! listener, one task per client connection, dispatch/replication as
//! `tokio::sync::mpsc` consumer pools, health-check and peer-listener as
//! their own long-lived tasks.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::health::{self, HealthConfig};
use crate::membership::{Membership, MembershipConfig};
use crate::peer::{self, PeerClient};
use crate::protocol::{self, ClientCommand, ProtocolError};
use crate::registry::{BackendNode, Fleet};
use crate::replication::{self, ReplicationConfig};
use crate::wire::{Framed, WireError};

pub struct App {
    pub fleet: Arc<Fleet>,
    pub membership: Arc<Membership>,
    dispatcher: Arc<Dispatcher>,
    cfg: Config,
    cancel: CancellationToken,
}

impl App {
    pub fn build(cfg: Config) -> anyhow::Result<App> {
        let server_file = cfg.server_file.as_deref().ok_or_else(|| anyhow::anyhow!("server_file is required"))?;
        let servers = crate::config::load_server_file(server_file)?;
        let nodes: Vec<Arc<BackendNode>> = servers
            .into_iter()
            .map(|s| BackendNode::new(s.ip, s.port, s.scale_factor, cfg.pool.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let fleet = Arc::new(Fleet::new(nodes));

        let peer_defs = match &cfg.friend_file {
            Some(path) => crate::config::load_friend_file(path)?,
            None => Vec::new(),
        };
        let peers = PeerClient::new(peer_defs.into_iter().map(|p| (p.ip, p.port)).collect(), cfg.lock_wait_time);

        let membership = Membership::new(
            fleet.clone(),
            peers,
            MembershipConfig { replications: cfg.replications, default_pool_cfg: cfg.pool.clone() },
        );

        let cancel = CancellationToken::new();
        let replication_handle = replication::spawn_workers(
            fleet.clone(),
            ReplicationConfig {
                replications: cfg.replications,
                replication_threads: cfg.replication_threads,
                replication_delay_time: cfg.replication_delay_time,
                queue_depth: 4096,
            },
            cancel.clone(),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            fleet.clone(),
            replication_handle,
            DispatchConfig { lock_wait_time: cfg.lock_wait_time, replications: cfg.replications },
        ));

        Ok(App { fleet, membership, dispatcher, cfg, cancel })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let health_cfg = HealthConfig {
            active_check_interval: self.cfg.active_check_interval,
            datastore_timeout: self.cfg.datastore_timeout,
            auto_detach: self.cfg.auto_detach,
        };
        tokio::spawn(health::run(self.fleet.clone(), self.membership.clone(), health_cfg, self.cancel.clone()));

        if self.cfg.friend_file.is_some() {
            let addr = format!("0.0.0.0:{}", self.cfg.informed_port).parse()?;
            let membership = self.membership.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = peer::run_listener(addr, membership, cancel).await {
                    warn!(error = %e, "peer listener exited with error");
                }
            });
        }

        let client_addr = format!("0.0.0.0:{}", self.cfg.port_no).parse::<std::net::SocketAddr>()?;
        let listener = bind_listener(client_addr, self.cfg.backlog)?;
        info!(%client_addr, backlog = self.cfg.backlog, "client listener started");

        // Bounds how many client connections are dispatched concurrently;
        // beyond this, accepted sockets queue for a permit instead of each
        // spawning an unbounded worker task.
        let dispatch_permits = Arc::new(Semaphore::new(self.cfg.dispatch_threads.max(1)));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("accept loop shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => { warn!(error = %e, "accept failed"); continue; }
                    };
                    let app = self.clone();
                    let permits = dispatch_permits.clone();
                    tokio::spawn(async move {
                        let _permit = match permits.acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => return, // semaphore only closes if dropped, which never happens here
                        };
                        if let Err(e) = app.handle_client(stream, peer_addr.ip()).await {
                            warn!(%peer_addr, error = %e, "client connection ended with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer_ip: IpAddr) -> anyhow::Result<()> {
        let mut framed = Framed::new(stream);
        loop {
            match protocol::read_command(&mut framed).await {
                Ok(None) => return Ok(()),
                Err(ProtocolError::Wire(WireError::Closed)) => return Ok(()),
                Err(e) => {
                    framed.write_all(format!("ERROR {e}").as_bytes()).await?;
                    framed.write_all(b"\r\n").await?;
                    framed.flush().await?;
                    continue;
                }
                Ok(Some(ClientCommand::Admin { verb, args })) => {
                    if !peer_ip.is_loopback() {
                        framed.write_all(b"ERROR admin commands are loopback-only\r\n").await?;
                        framed.flush().await?;
                        continue;
                    }
                    self.handle_admin(&verb, &args, &mut framed).await?;
                }
                Ok(Some(ClientCommand::Introspection { verb, args })) => {
                    if self.handle_introspection(&verb, &args, &mut framed).await? {
                        return Ok(());
                    }
                }
                Ok(Some(cmd)) => {
                    if let Err(e) = self.dispatcher.execute(&mut framed, cmd).await {
                        warn!(error = %e, "dispatch failed");
                    }
                }
            }
        }
    }

    /// Returns `true` if the connection should close (i.e. `quit`).
    async fn handle_introspection(&self, verb: &str, _args: &[String], framed: &mut Framed<TcpStream>) -> anyhow::Result<bool> {
        match verb {
            "version" => {
                framed.write_all(format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION")).as_bytes()).await?;
            }
            "verbosity" => {
                framed.write_all(b"OK\r\n").await?;
            }
            "stats" => {
                let snapshot = self.fleet.snapshot();
                for node in &snapshot.nodes {
                    let (set, get, del) = node.counters();
                    let line = format!("STAT {}:{} set={} get={} delete={}\r\n", node.ip, node.port, set, get, del);
                    framed.write_all(line.as_bytes()).await?;
                }
                framed.write_all(b"END\r\n").await?;
            }
            "quit" => {
                framed.flush().await?;
                return Ok(true);
            }
            _ => {
                framed.write_all(b"ERROR\r\n").await?;
            }
        }
        framed.flush().await?;
        Ok(false)
    }

    /// Feeds an import file's synthesized commands through a virtual client
    /// connection (an in-memory duplex) so each record runs through the same
    /// parse-then-dispatch path a real client socket uses, per §4.I.
    async fn run_import(&self, path: &Path) -> String {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(server_side);
            loop {
                match protocol::read_command(&mut framed).await {
                    Ok(Some(cmd)) => {
                        if let Err(e) = dispatcher.execute(&mut framed, cmd).await {
                            warn!(error = %e, "import record dispatch failed");
                        }
                    }
                    Ok(None) => return,
                    Err(ProtocolError::Wire(WireError::Closed)) => return,
                    Err(e) => {
                        warn!(error = %e, "import record parse failed");
                        return;
                    }
                }
            }
        });

        let client_side = Arc::new(AsyncMutex::new(client_side));
        let submit: crate::membership::ImportSubmit = Arc::new(move |line: Vec<u8>| {
            let client_side = client_side.clone();
            Box::pin(async move {
                let mut guard = client_side.lock().await;
                if let Err(e) = guard.write_all(&line).await {
                    debug!(error = %e, "import record write failed");
                }
            })
        });

        match self.membership.import(path, &submit).await {
            Ok(n) => format!("OK imported {n} records"),
            Err(e) => format!("ERROR {e}"),
        }
    }

    async fn handle_admin(&self, verb: &str, args: &[String], framed: &mut Framed<TcpStream>) -> anyhow::Result<()> {
        let reply = match verb {
            "__/status/__" => {
                let snapshot = self.fleet.snapshot();
                let mut lines = Vec::new();
                for node in &snapshot.nodes {
                    lines.push(format!("{}:{} {:?}", node.ip, node.port, node.status()));
                }
                lines.join("; ")
            }
            "__/shutdown/__" => {
                self.cancel.cancel();
                "OK shutting down".to_string()
            }
            "__/addserver/__" => match parse_ip_port_scale(args) {
                Some((ip, port, scale)) => self.membership.add_server(ip, port, scale).await.map_or_else(|e| format!("ERROR {e}"), |s| s),
                None => "ERROR usage: __/addserver/__ ip port scale".to_string(),
            },
            "__/removeserver/__" => match parse_ip_port(args) {
                Some((ip, port)) => self.membership.remove_server(ip, port).await.map_or_else(|e| format!("ERROR {e}"), |s| s),
                None => "ERROR usage: __/removeserver/__ ip port".to_string(),
            },
            "__/unlockserver/__" => match parse_ip_port(args) {
                Some((ip, port)) => self.membership.unlock_server(ip, port).await.map_or_else(|e| format!("ERROR {e}"), |s| s),
                None => "ERROR usage: __/unlockserver/__ ip port".to_string(),
            },
            "__/hashserver/__" => {
                let keys: Vec<Vec<u8>> = args.iter().map(|a| a.as_bytes().to_vec()).collect();
                let resolved = self.membership.hash_server(&keys);
                resolved
                    .into_iter()
                    .map(|(k, owner)| match owner {
                        Some((ip, port)) => format!("{} -> {}:{}", String::from_utf8_lossy(&k), ip, port),
                        None => format!("{} -> (no backend)", String::from_utf8_lossy(&k)),
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            }
            "__/importdata/__" => match args.first() {
                Some(path) => {
                    let reply = self.run_import(Path::new(path)).await;
                    reply
                }
                None => "ERROR usage: __/importdata/__ path".to_string(),
            },
            other => format!("ERROR unknown admin command {other}"),
        };
        framed.write_all(reply.as_bytes()).await?;
        framed.write_all(b"\r\n").await?;
        framed.flush().await?;
        Ok(())
    }
}

/// Binds the client listener with an explicit TCP listen backlog. Plain
/// `tokio::net::TcpListener::bind` always uses the platform's default
/// backlog, which drops `backlog` on the floor, so the socket is built with
/// `socket2` and handed to tokio once it is already listening.
fn bind_listener(addr: std::net::SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    TcpListener::from_std(socket.into())
}

fn parse_ip_port(args: &[String]) -> Option<(String, u16)> {
    if args.len() != 2 {
        return None;
    }
    Some((args[0].clone(), args[1].parse().ok()?))
}

fn parse_ip_port_scale(args: &[String]) -> Option<(String, u16, u32)> {
    if args.len() != 3 {
        return None;
    }
    Some((args[0].clone(), args[1].parse().ok()?, args[2].parse().ok()?))
}
