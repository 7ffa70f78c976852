//! The agent: runs beside the private service
//!
//! Keeps a control channel open to the broker and opens one tunnel per
//! `NEW_CONNECTION` signal. Reconnection policy lives here; the broker never
//! retries.

use crate::config::AgentConfig;
use backhaul_connection::spawn_relay;
use backhaul_proto::{CodecError, ControlCodec, ControlSignal};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to connect to service {address}: {source}")]
    ServiceDial {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to open tunnel to broker {address}: {source}")]
    TunnelDial {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to connect control channel to {address}: {source}")]
    ControlDial {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Control channel error: {0}")]
    Control(#[from] CodecError),

    #[error("Control channel closed by broker")]
    ControlClosed,

    #[error("Giving up after {0} connection attempts")]
    ReconnectExhausted(usize),
}

impl AgentError {
    /// True when the error ended a control session that had been established
    fn ended_session(&self) -> bool {
        matches!(self, AgentError::Control(_) | AgentError::ControlClosed)
    }
}

/// The tunnel agent.
///
/// Keeps one control channel to the broker and opens a tunnel (service socket
/// relayed to a broker socket) for every `NEW_CONNECTION` it receives.
#[derive(Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    tunnels_opened: Arc<AtomicU64>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
            tunnels_opened: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Tunnels successfully handed to the broker so far
    pub fn tunnels_opened(&self) -> u64 {
        self.tunnels_opened.load(Ordering::Relaxed)
    }

    /// Dial the service, then the broker, and relay between them.
    ///
    /// If the broker dial fails the service socket is closed again.
    pub async fn open_tunnel(&self) -> Result<(), AgentError> {
        let service = TcpStream::connect(&self.config.service_addr)
            .await
            .map_err(|source| AgentError::ServiceDial {
                address: self.config.service_addr.clone(),
                source,
            })?;

        let tunnel = TcpStream::connect(&self.config.tunnel_addr)
            .await
            .map_err(|source| AgentError::TunnelDial {
                address: self.config.tunnel_addr.clone(),
                source,
            })?;

        let _ = service.set_nodelay(true);
        let _ = tunnel.set_nodelay(true);

        debug!(
            service = %self.config.service_addr,
            broker = %self.config.tunnel_addr,
            "Opened tunnel"
        );
        self.tunnels_opened.fetch_add(1, Ordering::Relaxed);
        spawn_relay(service, tunnel);
        Ok(())
    }

    /// Open `count` tunnels one after another, stopping at the first failure.
    ///
    /// Returns how many were opened.
    pub async fn open_tunnels(&self, count: usize) -> usize {
        for opened in 0..count {
            if let Err(e) = self.open_tunnel().await {
                error!("Opened {} of {} tunnels: {}", opened, count, e);
                return opened;
            }
        }
        if count > 0 {
            info!("Opened {} tunnels", count);
        }
        count
    }

    /// One control-channel session.
    ///
    /// Returns `Ok(())` on shutdown and an error when the channel cannot be
    /// established or ends.
    pub async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), AgentError> {
        let stream = TcpStream::connect(&self.config.control_addr)
            .await
            .map_err(|source| AgentError::ControlDial {
                address: self.config.control_addr.clone(),
                source,
            })?;
        info!("Control channel connected to {}", self.config.control_addr);

        let mut signals = FramedRead::new(stream, ControlCodec::new());

        loop {
            let signal = tokio::select! {
                signal = signals.next() => signal,
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Agent shutting down");
                    return Ok(());
                }
            };

            match signal {
                Some(Ok(ControlSignal::KeepAlive)) => {
                    debug!("Received keepalive");
                }
                Some(Ok(ControlSignal::NewTunnel)) => {
                    let agent = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = agent.open_tunnel().await {
                            error!("Failed to open requested tunnel: {}", e);
                        }
                    });
                }
                Some(Err(e)) => return Err(AgentError::Control(e)),
                None => return Err(AgentError::ControlClosed),
            }
        }
    }

    /// Open the initial tunnels, then keep a control session alive,
    /// reconnecting with exponential backoff until shutdown or until the
    /// configured attempts are used up.
    ///
    /// Only consecutive failed dials count against `max_reconnect_attempts`;
    /// a session that connected resets both the count and the backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        self.open_tunnels(self.config.initial_tunnels).await;

        let max_attempts = self.config.max_reconnect_attempts;
        let max_delay = self.config.max_reconnect_delay();
        let mut delay = self.config.reconnect_delay();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.session(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!("Agent error: {}", e);
                    if e.ended_session() {
                        // The broker was reachable; start the retry budget over.
                        attempt = 0;
                        delay = self.config.reconnect_delay();
                    }
                }
            }

            if max_attempts > 0 && attempt >= max_attempts {
                return Err(AgentError::ReconnectExhausted(attempt));
            }

            warn!(
                "Reconnecting in {} seconds... (attempt {})",
                delay.as_secs(),
                attempt + 1
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            }

            delay = next_delay(delay, max_delay);
        }
    }
}

/// Exponential backoff: double, capped at `max`
fn next_delay(delay: Duration, max: Duration) -> Duration {
    std::cmp::min(delay * 2, max)
}
