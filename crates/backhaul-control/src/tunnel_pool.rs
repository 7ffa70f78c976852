//! Pool of idle tunnel connections
//!
//! Agents pre-open tunnel sockets to the broker; each one waits here, keyed by
//! its remote endpoint, until a visitor claims it. A claimed tunnel leaves the
//! pool for good (tunnels are one-shot).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// An idle, agent-originated tunnel socket
#[derive(Debug)]
pub struct TunnelConnection {
    key: String,
    stream: TcpStream,
    registered_at: DateTime<Utc>,
}

/// Result of discarding stray bytes from a claimed tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing was pending.
    Clean,
    /// Stray bytes were read and thrown away.
    Discarded(usize),
    /// The agent side already closed the socket.
    Closed,
}

impl TunnelConnection {
    pub fn new(key: String, stream: TcpStream) -> Self {
        Self {
            key,
            stream,
            registered_at: Utc::now(),
        }
    }

    /// Remote endpoint of the agent that opened this tunnel
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Discard any bytes that arrive on the socket within `deadline`.
    ///
    /// Waits for readiness at most until the deadline, so a pairing is never
    /// stalled for longer than that. Reports `Closed` as soon as the agent
    /// side's end of stream is seen.
    pub async fn drain(&self, deadline: Duration) -> io::Result<DrainOutcome> {
        let until = Instant::now() + deadline;
        let mut buffer = [0u8; 1024];
        let mut discarded = 0usize;

        loop {
            match tokio::time::timeout_at(until, self.stream.readable()).await {
                Ok(ready) => ready?,
                Err(_) => break,
            }

            match self.stream.try_read(&mut buffer) {
                Ok(0) => return Ok(DrainOutcome::Closed),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        if discarded == 0 {
            Ok(DrainOutcome::Clean)
        } else {
            tracing::debug!(
                tunnel_key = %self.key,
                bytes = discarded,
                "Discarded stray bytes from tunnel"
            );
            Ok(DrainOutcome::Discarded(discarded))
        }
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Slot table: O(1) insert, remove-by-key and pop-any.
#[derive(Default)]
struct Slots {
    tunnels: Vec<TunnelConnection>,
    index: HashMap<String, usize>,
}

impl Slots {
    fn remove_at(&mut self, slot: usize) -> TunnelConnection {
        let removed = self.tunnels.swap_remove(slot);
        self.index.remove(&removed.key);
        if let Some(moved) = self.tunnels.get(slot) {
            self.index.insert(moved.key.clone(), slot);
        }
        removed
    }

    fn push(&mut self, tunnel: TunnelConnection) {
        self.index.insert(tunnel.key.clone(), self.tunnels.len());
        self.tunnels.push(tunnel);
    }

    fn pop(&mut self) -> Option<TunnelConnection> {
        let tunnel = self.tunnels.pop()?;
        self.index.remove(&tunnel.key);
        Some(tunnel)
    }
}

/// Keyed set of idle tunnels.
///
/// The lock is held only for the slot-table mutation; sockets are closed and
/// relayed outside of it.
#[derive(Default)]
pub struct TunnelPool {
    slots: Mutex<Slots>,
    registered: AtomicU64,
    superseded: AtomicU64,
}

impl TunnelPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a tunnel, evicting and closing any previous tunnel with the same key.
    ///
    /// Returns the pool size after insertion.
    pub fn register(&self, key: String, stream: TcpStream) -> usize {
        let tunnel = TunnelConnection::new(key, stream);
        let key = tunnel.key.clone();

        let (previous, size) = {
            let mut slots = self.lock();
            let existing = slots.index.get(&key).copied();
            let previous = existing.map(|slot| slots.remove_at(slot));
            slots.push(tunnel);
            (previous, slots.tunnels.len())
        };

        self.registered.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = previous {
            self.superseded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                tunnel_key = %key,
                previous_registered_at = %previous.registered_at,
                "Superseded existing tunnel with the same key"
            );
            drop(previous);
        }

        tracing::info!(tunnel_key = %key, pool_size = size, "Registered tunnel");
        size
    }

    /// Remove and return one idle tunnel, if any.
    ///
    /// Selection order is unspecified. A tunnel is handed out at most once.
    pub fn claim(&self) -> Option<TunnelConnection> {
        let (tunnel, remaining) = {
            let mut slots = self.lock();
            let tunnel = slots.pop();
            (tunnel, slots.tunnels.len())
        };

        if let Some(ref tunnel) = tunnel {
            tracing::debug!(
                tunnel_key = %tunnel.key,
                pool_size = remaining,
                "Claimed tunnel"
            );
        }
        tunnel
    }

    /// Close every idle tunnel. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let tunnels = {
            let mut slots = self.lock();
            slots.index.clear();
            std::mem::take(&mut slots.tunnels)
        };
        let count = tunnels.len();
        drop(tunnels);

        if count > 0 {
            tracing::info!(count, "Closed idle tunnels");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().index.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().tunnels.iter().map(|t| t.key.clone()).collect()
    }

    /// Total registrations since start, including superseding ones
    pub fn registered_total(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn superseded_total(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Returns (accepted side, dialing side) of a loopback connection.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, dialed.unwrap())
    }

    #[tokio::test]
    async fn test_register_and_claim() {
        let pool = TunnelPool::new();
        let (s1, _p1) = tcp_pair().await;
        let (s2, _p2) = tcp_pair().await;

        assert_eq!(pool.register("t1".to_string(), s1), 1);
        assert_eq!(pool.register("t2".to_string(), s2), 2);
        assert!(pool.contains("t1"));
        assert!(pool.contains("t2"));

        let claimed = pool.claim().unwrap();
        assert!(claimed.key() == "t1" || claimed.key() == "t2");
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(claimed.key()));

        let other = pool.claim().unwrap();
        assert_ne!(other.key(), claimed.key());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_claim_empty_pool() {
        let pool = TunnelPool::new();
        assert!(pool.claim().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_key_supersedes_and_closes_previous() {
        let pool = TunnelPool::new();
        let (s1, mut p1) = tcp_pair().await;
        let (s2, _p2) = tcp_pair().await;
        let s2_local = s2.local_addr().unwrap();

        pool.register("agent:1".to_string(), s1);
        pool.register("agent:1".to_string(), s2);

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.superseded_total(), 1);
        assert_eq!(pool.registered_total(), 2);

        // The first socket has been closed: its peer sees end of stream.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), p1.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The surviving entry is the second socket.
        let claimed = pool.claim().unwrap().into_stream();
        assert_eq!(claimed.local_addr().unwrap(), s2_local);
    }

    #[tokio::test]
    async fn test_supersede_keeps_index_consistent() {
        let pool = TunnelPool::new();
        let mut peers = Vec::new();
        for key in ["a", "b", "c"] {
            let (s, p) = tcp_pair().await;
            peers.push(p);
            pool.register(key.to_string(), s);
        }

        // Replacing the first slot moves the last entry into it.
        let (s, p) = tcp_pair().await;
        peers.push(p);
        pool.register("a".to_string(), s);

        let mut keys = pool.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let mut claimed = HashSet::new();
        while let Some(tunnel) = pool.claim() {
            assert!(claimed.insert(tunnel.key().to_string()));
        }
        assert_eq!(claimed.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_a_tunnel() {
        let pool = Arc::new(TunnelPool::new());
        let mut peers = Vec::new();
        for i in 0..32 {
            let (s, p) = tcp_pair().await;
            peers.push(p);
            pool.register(format!("tunnel-{}", i), s);
        }

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.claim().map(|t| t.key().to_string())
            }));
        }

        let mut seen = HashSet::new();
        let mut hits = 0;
        for task in tasks {
            if let Some(key) = task.await.unwrap() {
                hits += 1;
                assert!(seen.insert(key), "tunnel handed out twice");
            }
        }
        assert_eq!(hits, 32);
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_discards_stray_bytes() {
        let (s, mut p) = tcp_pair().await;
        p.write_all(b"NEW_CONNECTION\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tunnel = TunnelConnection::new("t".to_string(), s);
        let outcome = tunnel.drain(Duration::from_millis(5)).await.unwrap();
        assert_eq!(outcome, DrainOutcome::Discarded(15));

        // Nothing left afterwards.
        assert_eq!(
            tunnel.drain(Duration::from_millis(5)).await.unwrap(),
            DrainOutcome::Clean
        );
    }

    #[tokio::test]
    async fn test_drain_sees_bytes_the_reactor_has_not_reported() {
        let (s, mut p) = tcp_pair().await;
        p.write_all(b"NEW_CONNECTION\n").await.unwrap();
        // Block the only runtime thread so no readiness event is processed
        // before the drain starts.
        std::thread::sleep(Duration::from_millis(50));

        let tunnel = TunnelConnection::new("t".to_string(), s);
        assert_eq!(
            tunnel.drain(Duration::from_millis(5)).await.unwrap(),
            DrainOutcome::Discarded(15)
        );
    }

    #[tokio::test]
    async fn test_drain_sees_unreported_close() {
        let (s, p) = tcp_pair().await;
        drop(p);
        std::thread::sleep(Duration::from_millis(50));

        let tunnel = TunnelConnection::new("t".to_string(), s);
        assert_eq!(
            tunnel.drain(Duration::from_millis(5)).await.unwrap(),
            DrainOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_drain_is_bounded_by_deadline() {
        let (s, _p) = tcp_pair().await;
        let tunnel = TunnelConnection::new("t".to_string(), s);

        let started = Instant::now();
        assert_eq!(
            tunnel.drain(Duration::from_millis(20)).await.unwrap(),
            DrainOutcome::Clean
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_detects_closed_peer() {
        let (s, p) = tcp_pair().await;
        drop(p);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tunnel = TunnelConnection::new("t".to_string(), s);
        assert_eq!(
            tunnel.drain(Duration::from_millis(5)).await.unwrap(),
            DrainOutcome::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_all() {
        let pool = TunnelPool::new();
        let (s1, mut p1) = tcp_pair().await;
        let (s2, _p2) = tcp_pair().await;
        pool.register("t1".to_string(), s1);
        pool.register("t2".to_string(), s2);

        assert_eq!(pool.close_all(), 2);
        assert!(pool.is_empty());
        assert!(!pool.contains("t1"));

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), p1.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
