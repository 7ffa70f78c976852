//! The broker: owns the shared state and runs every loop
//!
//! ```text
//!  agents ──control──▶ ControlListener ──▶ AgentRegistry ◀── keepalive loop
//!                                               ▲
//!                                               │ NEW_CONNECTION
//!                                     ReplenishmentMonitor
//!                                               │ pool size
//!  agents ──tunnel───▶ TunnelListener ──▶ TunnelPool
//!                                               │ claim
//!  visitors ─────────▶ VisitorAcceptor ─────────┴──▶ RelayTracker
//! ```

use crate::config::BrokerConfig;
use backhaul_control::{
    shutdown_requested, AgentRegistry, AgentRegistryConfig, RelayTracker, ReplenishmentMonitor,
    TunnelPool,
};
use backhaul_server_tcp::{
    bind_listener, ControlListener, ServerError, TunnelListener, VisitorAcceptor, VisitorPairing,
    VisitorStats,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub visitors_paired: u64,
    /// Visitors closed because the pool was empty
    pub visitors_rejected: u64,
    pub tunnels_registered: u64,
    pub tunnels_superseded: u64,
    /// Claimed tunnels discarded because the agent side was already gone
    pub stale_tunnels: u64,
    pub agents_rejected: u64,
    pub agents_evicted: u64,
    pub idle_tunnels: usize,
    pub bound_agents: usize,
    pub active_relays: usize,
}

/// Cloneable view of a broker's shared state.
///
/// Stays valid while [`Broker::run`] owns the listeners.
#[derive(Clone)]
pub struct BrokerHandle {
    pool: Arc<TunnelPool>,
    registry: Arc<AgentRegistry>,
    relays: Arc<RelayTracker>,
    visitors: Arc<VisitorStats>,
}

impl BrokerHandle {
    pub fn pool(&self) -> Arc<TunnelPool> {
        self.pool.clone()
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    pub fn relays(&self) -> Arc<RelayTracker> {
        self.relays.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            visitors_paired: self.visitors.paired(),
            visitors_rejected: self.visitors.rejected(),
            tunnels_registered: self.pool.registered_total(),
            tunnels_superseded: self.pool.superseded_total(),
            stale_tunnels: self.visitors.stale_tunnels(),
            agents_rejected: self.registry.rejected_total(),
            agents_evicted: self.registry.evicted_total(),
            idle_tunnels: self.pool.len(),
            bound_agents: self.registry.count(),
            active_relays: self.relays.active(),
        }
    }
}

/// Addresses the broker actually bound (useful with port 0)
#[derive(Debug, Clone, Copy)]
pub struct BrokerAddrs {
    pub agent: SocketAddr,
    pub tunnel: SocketAddr,
    pub visitor: SocketAddr,
}

pub struct Broker {
    config: BrokerConfig,
    handle: BrokerHandle,
    addrs: BrokerAddrs,
    control: ControlListener,
    tunnels: TunnelListener,
    visitors: VisitorAcceptor,
}

impl Broker {
    /// Bind all three listeners. Any bind failure is fatal.
    pub async fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        let pool = Arc::new(TunnelPool::new());
        let registry = Arc::new(AgentRegistry::new(AgentRegistryConfig {
            max_agents: config.max_agents,
            write_timeout: config.keepalive_write_timeout(),
        }));
        let relays = Arc::new(RelayTracker::new());
        let pairing = VisitorPairing::new(pool.clone(), relays.clone(), config.drain_policy());

        let control = ControlListener::new(
            bind_listener(config.agent_addr, "control").await?,
            registry.clone(),
        );
        let tunnels = TunnelListener::new(
            bind_listener(config.tunnel_addr, "tunnel").await?,
            pool.clone(),
        );
        let handle = BrokerHandle {
            pool,
            registry,
            relays,
            visitors: pairing.stats(),
        };
        let visitors =
            VisitorAcceptor::new(bind_listener(config.visitor_addr, "visitor").await?, pairing);

        let addrs = BrokerAddrs {
            agent: control.local_addr()?,
            tunnel: tunnels.local_addr()?,
            visitor: visitors.local_addr()?,
        };

        Ok(Self {
            config,
            handle,
            addrs,
            control,
            tunnels,
            visitors,
        })
    }

    pub fn addrs(&self) -> BrokerAddrs {
        self.addrs
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Run until `true` is published on `shutdown` (or its sender is dropped).
    ///
    /// On shutdown the accept loops, keepalive and monitor stop, every idle
    /// tunnel and agent control socket is closed, and in-flight relays get
    /// `shutdown_grace_secs` to finish before being aborted. Returns the final
    /// counters.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> BrokerStats {
        let Self {
            config,
            handle,
            addrs,
            control,
            tunnels,
            visitors,
        } = self;

        let mut join_set = JoinSet::new();
        join_set.spawn(control.run(shutdown.clone()));
        join_set.spawn(tunnels.run(shutdown.clone()));
        join_set.spawn(visitors.run(shutdown.clone()));

        let registry = handle.registry();
        let keepalive_interval = config.keepalive_interval();
        let keepalive_shutdown = shutdown.clone();
        join_set.spawn(async move {
            registry
                .run_keepalive(keepalive_interval, keepalive_shutdown)
                .await
        });

        let monitor = ReplenishmentMonitor::new(
            handle.pool(),
            handle.registry(),
            config.target_idle_tunnels,
            config.monitor_interval(),
        );
        let monitor_shutdown = shutdown.clone();
        join_set.spawn(async move { monitor.run(monitor_shutdown).await });

        info!(
            agent_addr = %addrs.agent,
            tunnel_addr = %addrs.tunnel,
            visitor_addr = %addrs.visitor,
            max_agents = config.max_agents,
            target_idle_tunnels = config.target_idle_tunnels,
            "Broker running"
        );

        shutdown_requested(&mut shutdown).await;
        info!("Broker shutting down");

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                error!("Broker task failed: {}", e);
            }
        }

        let tunnels_closed = handle.pool.close_all();
        let agents_closed = handle.registry.close_all().await;
        let relays_aborted = handle.relays.shutdown(config.shutdown_grace()).await;

        let stats = handle.stats();
        info!(
            tunnels_closed,
            agents_closed,
            relays_aborted,
            visitors_paired = stats.visitors_paired,
            visitors_rejected = stats.visitors_rejected,
            tunnels_registered = stats.tunnels_registered,
            tunnels_superseded = stats.tunnels_superseded,
            stale_tunnels = stats.stale_tunnels,
            agents_rejected = stats.agents_rejected,
            agents_evicted = stats.agents_evicted,
            "Broker stopped"
        );
        stats
    }
}
