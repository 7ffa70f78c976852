//! Tracking of in-flight relays
//!
//! Each visitor/tunnel pairing runs as its own task. The tracker keeps their
//! handles so shutdown can wait for them and abort whatever outlives the grace
//! period.

use backhaul_connection::relay;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Tracks running relay tasks by id
pub struct RelayTracker {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    idle: Notify,
}

impl RelayTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start relaying between `a` and `b`. Returns the relay id.
    pub fn spawn<A, B>(self: &Arc<Self>, a: A, b: B, label: String) -> u64
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let relay_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::clone(self);

        // Insert under the lock so a fast relay cannot finish before it is tracked.
        let mut tasks = self.lock();
        let handle = tokio::spawn(async move {
            let stats = relay(a, b).await;
            tracing::info!(
                relay_id,
                label = %label,
                bytes_in = stats.a_to_b,
                bytes_out = stats.b_to_a,
                "Relay closed"
            );
            tracker.finish(relay_id);
        });
        tasks.insert(relay_id, handle);

        relay_id
    }

    fn finish(&self, relay_id: u64) {
        let now_idle = {
            let mut tasks = self.lock();
            tasks.remove(&relay_id);
            tasks.is_empty()
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    /// Number of relays still running
    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// Wait up to `grace` for running relays, then abort the rest.
    ///
    /// Returns how many relays were aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.idle.notified();
                if self.active() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;

        if drained.is_ok() {
            return 0;
        }

        let remaining: Vec<JoinHandle<()>> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in &remaining {
            handle.abort();
        }
        if !remaining.is_empty() {
            tracing::warn!(count = remaining.len(), "Aborted relays after grace period");
        }
        remaining.len()
    }
}

impl Default for RelayTracker {
    fn default() -> Self {
        Self::new()
    }
}
