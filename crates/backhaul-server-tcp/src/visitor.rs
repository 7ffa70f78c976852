//! Visitor acceptor: pairs each arriving visitor with an idle tunnel
//!
//! Each visitor is paired in its own task, so a pairing never holds up the
//! next accept. Pairing is immediate: a visitor either gets a tunnel from the
//! pool right away (after the bounded drain) or is closed right away. There is
//! no waiting room and no retry; the visitor's own client decides whether to
//! reconnect.

use backhaul_control::{DrainOutcome, RelayTracker, TunnelPool};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::listener::{accept_loop, ServerError};

/// Stray-byte drain applied to a claimed tunnel before relaying
#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
    pub enabled: bool,
    pub deadline: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            deadline: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitorOutcome {
    /// Bridged to the tunnel opened from `tunnel_key`.
    Paired { relay_id: u64, tunnel_key: String },
    /// Pool was empty; the visitor socket has been closed.
    NoTunnel,
}

#[derive(Debug, Default)]
pub struct VisitorStats {
    paired: AtomicU64,
    rejected: AtomicU64,
    stale_tunnels: AtomicU64,
}

impl VisitorStats {
    pub fn paired(&self) -> u64 {
        self.paired.load(Ordering::Relaxed)
    }

    /// Visitors closed because no tunnel was available
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Claimed tunnels thrown away because the agent side had already closed
    pub fn stale_tunnels(&self) -> u64 {
        self.stale_tunnels.load(Ordering::Relaxed)
    }
}

/// The claim-and-relay step, shared by the accept loop and tests.
#[derive(Clone)]
pub struct VisitorPairing {
    pool: Arc<TunnelPool>,
    relays: Arc<RelayTracker>,
    drain: DrainPolicy,
    stats: Arc<VisitorStats>,
}

impl VisitorPairing {
    pub fn new(pool: Arc<TunnelPool>, relays: Arc<RelayTracker>, drain: DrainPolicy) -> Self {
        Self {
            pool,
            relays,
            drain,
            stats: Arc::new(VisitorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<VisitorStats> {
        self.stats.clone()
    }

    /// Claim a tunnel for `visitor` and start relaying, or close the visitor.
    ///
    /// The claim is a single pool operation; the only wait is the drain,
    /// bounded by its deadline.
    pub async fn pair(&self, visitor: TcpStream, peer_addr: SocketAddr) -> VisitorOutcome {
        loop {
            let Some(tunnel) = self.pool.claim() else {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(visitor = %peer_addr, "No tunnel available, closing visitor");
                drop(visitor);
                return VisitorOutcome::NoTunnel;
            };

            if self.drain.enabled {
                match tunnel.drain(self.drain.deadline).await {
                    Ok(DrainOutcome::Closed) => {
                        self.stats.stale_tunnels.fetch_add(1, Ordering::Relaxed);
                        debug!(tunnel_key = %tunnel.key(), "Claimed tunnel already closed, trying next");
                        continue;
                    }
                    Err(e) => {
                        self.stats.stale_tunnels.fetch_add(1, Ordering::Relaxed);
                        warn!(tunnel_key = %tunnel.key(), "Claimed tunnel unusable: {}", e);
                        continue;
                    }
                    Ok(DrainOutcome::Clean) | Ok(DrainOutcome::Discarded(_)) => {}
                }
            }

            let tunnel_key = tunnel.key().to_string();
            let relay_id = self.relays.spawn(
                visitor,
                tunnel.into_stream(),
                format!("{} <-> {}", peer_addr, tunnel_key),
            );
            self.stats.paired.fetch_add(1, Ordering::Relaxed);

            info!(
                relay_id,
                visitor = %peer_addr,
                tunnel_key = %tunnel_key,
                pool_size = self.pool.len(),
                "Paired visitor with tunnel"
            );
            return VisitorOutcome::Paired {
                relay_id,
                tunnel_key,
            };
        }
    }
}

/// Accepts public visitor connections
pub struct VisitorAcceptor {
    listener: TcpListener,
    pairing: VisitorPairing,
}

impl VisitorAcceptor {
    pub fn new(listener: TcpListener, pairing: VisitorPairing) -> Self {
        Self { listener, pairing }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let pairing = self.pairing;
        accept_loop(&self.listener, "visitor", shutdown, |stream, peer_addr| {
            let _ = stream.set_nodelay(true);
            let pairing = pairing.clone();
            tokio::spawn(async move { pairing.pair(stream, peer_addr).await });
        })
        .await;
    }
}
