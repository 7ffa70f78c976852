//! Shutdown signalling for background loops

use tokio::sync::watch;

/// Resolves once `true` has been published on the shutdown channel, or once
/// every sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
