//! Per-backend connection pool: a bounded set of "permanent" connections plus
//! a bounded overflow set, with idle reclamation and a blocking-with-timeout
//! acquire. Release is explicit (the caller always calls `release`), mirroring
//! the grounding codebase's `ds_release_socket`-style `goto final` discipline
//! rather than the RAII auto-return shape of `volo-thrift`'s generic `Pooled<T>`
//! guard -- the state machine here (permanent vs. overflow, idle-age eviction)
//! doesn't fit that guard's single idle-list-per-key model, but the acquire
//! loop (try idle, else open under a cap, else wait on a signal with a
//! deadline) is the same shape as `volo-thrift`'s `Pool::get`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: std::io::Error },
    #[error("pool_wait_time elapsed acquiring a connection to {addr}")]
    Exhausted { addr: SocketAddr },
    #[error("pool for {addr} is finalized")]
    Finalized { addr: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub init_conns: usize,
    pub ext_conns: usize,
    pub ext_release_time: Duration,
    pub wait_time: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            init_conns: 10,
            ext_conns: 20,
            ext_release_time: Duration::from_secs(180),
            wait_time: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// A checked-out connection. The caller owns it until passed back to
/// `Pool::release`.
pub struct Conn {
    pub stream: TcpStream,
    overflow: bool,
}

impl Conn {
    pub fn overflow_flag(&self) -> bool {
        self.overflow
    }
}

struct Idle {
    stream: TcpStream,
    overflow: bool,
    idle_since: Instant,
}

struct Inner {
    idle: VecDeque<Idle>,
    in_use: usize,
    closed: bool,
}

/// A bounded + overflow connection pool for one backend node.
pub struct Pool {
    addr: SocketAddr,
    cfg: PoolConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Pool {
    pub fn new(addr: SocketAddr, cfg: PoolConfig) -> Self {
        Pool {
            addr,
            cfg,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                in_use: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> Result<TcpStream, PoolError> {
        let stream = tokio::time::timeout(self.cfg.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PoolError::Connect {
                addr: self.addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| PoolError::Connect { addr: self.addr, source })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Reuses an idle connection, opens a fresh one under the combined cap,
    /// or blocks up to `wait_time` for one to free up.
    pub async fn acquire(&self) -> Result<Conn, PoolError> {
        let deadline = Instant::now() + self.cfg.wait_time;
        loop {
            enum Action {
                Reuse(Idle),
                Open { overflow: bool },
                Wait,
            }

            let action = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(PoolError::Finalized { addr: self.addr });
                }
                self.evict_expired_overflow(&mut inner);
                if let Some(idle) = inner.idle.pop_back() {
                    inner.in_use += 1;
                    Action::Reuse(idle)
                } else if inner.in_use < self.cfg.init_conns {
                    inner.in_use += 1;
                    Action::Open { overflow: false }
                } else if inner.in_use < self.cfg.init_conns + self.cfg.ext_conns {
                    inner.in_use += 1;
                    Action::Open { overflow: true }
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Reuse(idle) => {
                    return Ok(Conn {
                        stream: idle.stream,
                        overflow: idle.overflow,
                    });
                }
                Action::Open { overflow } => match self.connect().await {
                    Ok(stream) => return Ok(Conn { stream, overflow }),
                    Err(e) => {
                        let mut inner = self.inner.lock().await;
                        inner.in_use -= 1;
                        self.notify.notify_one();
                        return Err(e);
                    }
                },
                Action::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PoolError::Exhausted { addr: self.addr });
                    }
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(remaining) => {
                            return Err(PoolError::Exhausted { addr: self.addr });
                        }
                    }
                }
            }
        }
    }

    fn evict_expired_overflow(&self, inner: &mut Inner) {
        let now = Instant::now();
        inner.idle.retain(|idle| {
            !(idle.overflow && now.saturating_duration_since(idle.idle_since) > self.cfg.ext_release_time)
        });
    }

    /// Returns a connection to the pool. `reset = true` drops the connection
    /// outright (it may be carrying stale protocol state after a mid-reply
    /// failure); the freed slot lets the next `acquire` open a fresh one.
    pub async fn release(&self, conn: Conn, reset: bool) {
        let mut inner = self.inner.lock().await;
        inner.in_use -= 1;
        if !reset && !inner.closed {
            self.evict_expired_overflow(&mut inner);
            inner.idle.push_back(Idle {
                stream: conn.stream,
                overflow: conn.overflow,
                idle_since: Instant::now(),
            });
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Like `release`, but takes the raw stream back after it was briefly
    /// unwrapped from its `Conn` (e.g. to pass through a `wire::Framed`).
    /// Used by components that need the stream wrapped in a framing type for
    /// the duration of one call and then handed straight back to the pool.
    pub async fn release_stream(&self, stream: TcpStream, overflow: bool, reset: bool) {
        self.release(Conn { stream, overflow }, reset).await;
    }

    /// Closes every idle connection and refuses further acquires. Used when a
    /// node is detached (REMOVE / auto-detach) so in-flight health checks
    /// don't race a freed pool.
    pub async fn finalize(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.idle.clear();
        self.notify.notify_waiters();
    }

    /// Tears down and re-opens the pool in place: drops all idle connections
    /// and re-allows acquires. Used by the health-check loop when a
    /// previously INACTIVE node starts responding again, since the backend
    /// process may have restarted and any surviving idle sockets are stale.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.idle.clear();
        inner.closed = false;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    async fn idle_len(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    #[cfg(test)]
    async fn in_use(&self) -> usize {
        self.inner.lock().await.in_use
    }
}
