//! Visitor-side local bridge
//!
//! Listens on a local port and forwards every connection to the broker's
//! public visitor address.

use crate::agent::AgentError;
use crate::config::BridgeConfig;
use backhaul_connection::spawn_relay;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct LocalBridge {
    listener: TcpListener,
    broker_addr: Arc<str>,
}

impl LocalBridge {
    pub async fn bind(config: &BridgeConfig) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| AgentError::Bind {
                address: config.listen_addr.clone(),
                source,
            })?;

        info!(
            "Local bridge listening on {}, forwarding to {}",
            config.listen_addr, config.broker_addr
        );

        Ok(Self {
            listener,
            broker_addr: Arc::from(config.broker_addr.as_str()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((local, peer_addr)) => {
                        let broker_addr = self.broker_addr.clone();
                        tokio::spawn(forward(local, peer_addr, broker_addr));
                    }
                    Err(e) => {
                        error!("Failed to accept local connection: {}", e);
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Local bridge stopped");
                    break;
                }
            }
        }
    }
}

async fn forward(local: TcpStream, peer_addr: SocketAddr, broker_addr: Arc<str>) {
    let remote = match TcpStream::connect(&*broker_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            // Dropping `local` closes it.
            error!("Failed to reach broker {} for {}: {}", broker_addr, peer_addr, e);
            return;
        }
    };

    let _ = local.set_nodelay(true);
    let _ = remote.set_nodelay(true);
    debug!("Forwarding {} -> {}", peer_addr, broker_addr);
    spawn_relay(local, remote);
}
