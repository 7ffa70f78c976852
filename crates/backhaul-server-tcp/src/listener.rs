//! Listener binding and the agent-facing accept loops

use backhaul_control::{shutdown_requested, AgentRegistry, TunnelPool};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// TCP server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind {role} listener to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        role: &'static str,
        address: String,
        port: u16,
        reason: String,
    },
}

/// Bind a listening socket. Failure here is fatal to the broker.
pub async fn bind_listener(
    bind_addr: SocketAddr,
    role: &'static str,
) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ServerError::BindError {
            role,
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: e.to_string(),
        })?;

    info!("{} listener bound on {}", role, listener.local_addr()?);
    Ok(listener)
}

/// Accept until shutdown, handing every socket to `on_accept`.
///
/// Accept errors are logged and the loop carries on.
pub(crate) async fn accept_loop<F>(
    listener: &TcpListener,
    role: &'static str,
    mut shutdown: watch::Receiver<bool>,
    mut on_accept: F,
) where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted {} connection from {}", role, peer_addr);
                    on_accept(stream, peer_addr);
                }
                Err(e) => {
                    error!("Failed to accept {} connection: {}", role, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown_requested(&mut shutdown) => {
                info!("{} listener stopped", role);
                break;
            }
        }
    }
}

/// Accepts agent control channels and binds them in the agent registry
pub struct ControlListener {
    listener: TcpListener,
    registry: Arc<AgentRegistry>,
}

impl ControlListener {
    pub fn new(listener: TcpListener, registry: Arc<AgentRegistry>) -> Self {
        Self { listener, registry }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let registry = self.registry;
        accept_loop(&self.listener, "control", shutdown, |stream, peer_addr| {
            let _ = stream.set_nodelay(true);
            if !registry.bind(stream) {
                debug!("Agent {} was not bound", peer_addr);
            }
        })
        .await;
    }
}

/// Accepts agent tunnel sockets and registers them in the tunnel pool
pub struct TunnelListener {
    listener: TcpListener,
    pool: Arc<TunnelPool>,
}

impl TunnelListener {
    pub fn new(listener: TcpListener, pool: Arc<TunnelPool>) -> Self {
        Self { listener, pool }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let pool = self.pool;
        accept_loop(&self.listener, "tunnel", shutdown, |stream, peer_addr| {
            let _ = stream.set_nodelay(true);
            pool.register(peer_addr.to_string(), stream);
        })
        .await;
    }
}
