//! Agent registry for bound control channels
//!
//! Each agent that dials the control address is bound here, keyed by its
//! remote endpoint. The broker only ever writes to a control socket: a
//! keepalive token on a fixed interval, and a "new tunnel" token when the
//! replenishment monitor finds a deficit. A failed write is the only way the
//! broker learns that an agent went away, so any write failure evicts and
//! closes the agent on the spot.

use backhaul_proto::{CodecError, ControlCodec, ControlSignal};
use chrono::{DateTime, Utc};
use futures::SinkExt;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;

use crate::shutdown::shutdown_requested;

/// Errors writing a control signal to an agent
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Control write failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Control write did not complete within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    Delivered,
    Failed,
}

/// Outcome of the most recent keepalive write to an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveRecord {
    pub outcome: KeepaliveOutcome,
    pub at: DateTime<Utc>,
}

/// What happened to a `notify` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The signal was written to this agent.
    Sent(String),
    /// No agent is bound; nothing was sent.
    NoAgent,
    /// The write failed and this agent was evicted.
    Failed(String),
}

/// A bound agent control channel
pub struct AgentConnection {
    agent_id: String,
    writer: tokio::sync::Mutex<FramedWrite<TcpStream, ControlCodec>>,
    connected_at: DateTime<Utc>,
    last_keepalive: Mutex<Option<KeepaliveRecord>>,
}

impl AgentConnection {
    fn new(agent_id: String, stream: TcpStream) -> Self {
        Self {
            agent_id,
            writer: tokio::sync::Mutex::new(FramedWrite::new(stream, ControlCodec::new())),
            connected_at: Utc::now(),
            last_keepalive: Mutex::new(None),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_keepalive(&self) -> Option<KeepaliveRecord> {
        *self
            .last_keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_keepalive(&self, outcome: KeepaliveOutcome) {
        *self
            .last_keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(KeepaliveRecord {
            outcome,
            at: Utc::now(),
        });
    }

    /// Write one signal, bounded by `deadline`.
    pub async fn send(&self, signal: ControlSignal, deadline: Duration) -> Result<(), SignalError> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(deadline, writer.send(signal)).await {
            Ok(result) => result.map_err(SignalError::from),
            Err(_) => Err(SignalError::TimedOut(deadline)),
        }
    }

    async fn close(&self, deadline: Duration) {
        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(deadline, writer.get_mut().shutdown()).await;
    }
}

#[derive(Debug, Clone)]
pub struct AgentRegistryConfig {
    /// Maximum number of simultaneously bound agents
    pub max_agents: usize,
    /// Upper bound on any single control-channel write
    pub write_timeout: Duration,
}

impl Default for AgentRegistryConfig {
    fn default() -> Self {
        Self {
            max_agents: 16,
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// Registry of bound agents.
///
/// The map lock only covers insert/remove/select. Control writes happen on the
/// agent's own writer lock with a deadline, so a stalled peer can never block
/// other agents.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<AgentConnection>>>,
    config: AgentRegistryConfig,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

impl AgentRegistry {
    pub fn new(config: AgentRegistryConfig) -> Self {
        tracing::info!(max_agents = config.max_agents, "Creating agent registry");
        Self {
            agents: Mutex::new(HashMap::new()),
            config,
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<AgentConnection>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an agent control socket.
    ///
    /// Returns `false` (and closes the socket) when the registry is full or the
    /// peer address cannot be read.
    pub fn bind(&self, stream: TcpStream) -> bool {
        let agent_id = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                tracing::warn!("Dropping agent with unreadable peer address: {}", e);
                return false;
            }
        };

        let (replaced, count) = {
            let mut agents = self.lock();
            if !agents.contains_key(&agent_id) && agents.len() >= self.config.max_agents {
                drop(agents);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    agent_id = %agent_id,
                    max_agents = self.config.max_agents,
                    "Agent limit reached, rejecting agent"
                );
                return false;
            }

            let agent = Arc::new(AgentConnection::new(agent_id.clone(), stream));
            let replaced = agents.insert(agent_id.clone(), agent);
            (replaced, agents.len())
        };

        if replaced.is_some() {
            tracing::warn!(agent_id = %agent_id, "Replaced stale agent with the same endpoint");
        }
        tracing::info!(agent_id = %agent_id, agent_count = count, "Bound agent");
        true
    }

    /// Send `signal` to one bound agent, chosen at random.
    pub async fn notify(&self, signal: ControlSignal) -> NotifyOutcome {
        let agent = {
            let agents = self.lock();
            agents.values().choose(&mut rand::thread_rng()).cloned()
        };

        let Some(agent) = agent else {
            tracing::debug!(%signal, "No agent bound, signal dropped");
            return NotifyOutcome::NoAgent;
        };

        match agent.send(signal, self.config.write_timeout).await {
            Ok(()) => {
                tracing::debug!(agent_id = %agent.agent_id, %signal, "Signalled agent");
                NotifyOutcome::Sent(agent.agent_id.clone())
            }
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent.agent_id,
                    %signal,
                    "Signal write failed, evicting agent: {}",
                    e
                );
                self.evict(&agent).await;
                NotifyOutcome::Failed(agent.agent_id.clone())
            }
        }
    }

    /// Write a keepalive to every bound agent, evicting the ones that fail.
    ///
    /// Returns the number of agents evicted.
    pub async fn keepalive_tick(&self) -> usize {
        let agents: Vec<Arc<AgentConnection>> = self.lock().values().cloned().collect();
        tracing::info!(agent_count = agents.len(), "Sending keepalive");

        let write_timeout = self.config.write_timeout;
        let results = futures::future::join_all(agents.into_iter().map(|agent| async move {
            let result = agent.send(ControlSignal::KeepAlive, write_timeout).await;
            (agent, result)
        }))
        .await;

        let mut evicted = 0;
        for (agent, result) in results {
            match result {
                Ok(()) => agent.record_keepalive(KeepaliveOutcome::Delivered),
                Err(e) => {
                    agent.record_keepalive(KeepaliveOutcome::Failed);
                    tracing::error!(
                        agent_id = %agent.agent_id,
                        "Keepalive failed, evicting agent: {}",
                        e
                    );
                    self.evict(&agent).await;
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Run keepalive ticks every `interval` until shutdown.
    pub async fn run_keepalive(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; agents were only just bound.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.keepalive_tick().await;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    tracing::debug!("Keepalive loop stopped");
                    break;
                }
            }
        }
    }

    /// Remove `agent` (if it is still the entry for its key) and close it.
    async fn evict(&self, agent: &Arc<AgentConnection>) {
        let removed = {
            let mut agents = self.lock();
            let is_current = agents
                .get(&agent.agent_id)
                .is_some_and(|current| Arc::ptr_eq(current, agent));
            if is_current {
                agents.remove(&agent.agent_id)
            } else {
                None
            }
        };

        if removed.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(agent_id = %agent.agent_id, "Unbound agent");
        }
        agent.close(self.config.write_timeout).await;
    }

    /// Unbind and close every agent. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let agents: Vec<Arc<AgentConnection>> = self.lock().drain().map(|(_, a)| a).collect();
        for agent in &agents {
            agent.close(self.config.write_timeout).await;
        }
        agents.len()
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.lock().get(agent_id).cloned()
    }

    /// List bound agent ids
    pub fn list(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(AgentRegistryConfig::default())
    }
}
