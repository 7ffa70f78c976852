//! Deficit-driven tunnel replenishment
//!
//! Keeps a standing buffer of idle tunnels so a visitor never waits for an
//! agent round-trip: every tick compares the pool size against the target and
//! asks agents for one new tunnel per missing slot.

use backhaul_proto::ControlSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::agent_registry::{AgentRegistry, NotifyOutcome};
use crate::shutdown::shutdown_requested;
use crate::tunnel_pool::TunnelPool;

pub struct ReplenishmentMonitor {
    pool: Arc<TunnelPool>,
    registry: Arc<AgentRegistry>,
    target: usize,
    interval: Duration,
}

impl ReplenishmentMonitor {
    pub fn new(
        pool: Arc<TunnelPool>,
        registry: Arc<AgentRegistry>,
        target: usize,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            target,
            interval,
        }
    }

    /// Missing idle tunnels right now
    pub fn deficit(&self) -> usize {
        self.target.saturating_sub(self.pool.len())
    }

    /// One monitor pass. Returns the number of signals delivered.
    ///
    /// Tunnels requested on an earlier tick but not yet arrived are not
    /// subtracted, so a slow agent may be asked more than once.
    pub async fn tick(&self) -> usize {
        let deficit = self.deficit();
        if deficit == 0 {
            return 0;
        }

        tracing::debug!(
            deficit,
            pool_size = self.pool.len(),
            target = self.target,
            "Tunnel pool below target"
        );

        let mut sent = 0;
        for _ in 0..deficit {
            match self.registry.notify(ControlSignal::NewTunnel).await {
                NotifyOutcome::Sent(_) => sent += 1,
                NotifyOutcome::Failed(_) => {}
                NotifyOutcome::NoAgent => break,
            }
        }

        if sent > 0 {
            tracing::info!(requested = sent, deficit, "Requested new tunnels");
        }
        sent
    }

    /// Tick every `interval` until shutdown.
    ///
    /// Shutdown also cancels a tick in progress; a tick against stalled agents
    /// can otherwise run for `deficit` write timeouts.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
            tokio::select! {
                _ = self.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::debug!("Replenishment monitor stopped");
    }
}
