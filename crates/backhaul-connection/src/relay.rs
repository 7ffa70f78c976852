//! Bidirectional relay between two byte streams
//!
//! `relay(a, b)` runs two copy loops, `a -> b` and `b -> a`, each in its own
//! task. Whichever loop stops first (end of stream or I/O error) raises a
//! shared close signal so the other loop stops too, even if it is parked in a
//! read or write. Both streams are owned by the loops, so each socket is closed
//! exactly once: when the last of its halves is dropped.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Copy buffer size per direction (16KB)
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Close signal shared by the two directions of one relay.
#[derive(Clone)]
struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Raising it twice is a no-op.
    fn close(&self) {
        self.tx.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Aborts the wrapped task when dropped, so cancelling a relay also tears
/// down both copy loops (and with them both sockets).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Relay bytes between `a` and `b` until either side ends, then close both.
///
/// Resolves once both directions have returned.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let signal = CloseSignal::new();

    let mut forward = AbortOnDrop(tokio::spawn(copy_until_closed(
        a_read,
        b_write,
        signal.clone(),
        "a->b",
    )));
    let mut backward = AbortOnDrop(tokio::spawn(copy_until_closed(
        b_read, a_write, signal, "b->a",
    )));

    let (forward, backward) = tokio::join!(&mut forward.0, &mut backward.0);

    let stats = RelayStats {
        a_to_b: forward.unwrap_or_else(|e| {
            warn!("Relay direction a->b aborted: {}", e);
            0
        }),
        b_to_a: backward.unwrap_or_else(|e| {
            warn!("Relay direction b->a aborted: {}", e);
            0
        }),
    };

    debug!(
        bytes_a_to_b = stats.a_to_b,
        bytes_b_to_a = stats.b_to_a,
        "Relay finished"
    );

    stats
}

/// Fire-and-forget variant of [`relay`].
pub fn spawn_relay<A, B>(a: A, b: B) -> JoinHandle<RelayStats>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(relay(a, b))
}

async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    signal: CloseSignal,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut closed = signal.subscribe();
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            result = reader.read(&mut buffer) => match result {
                Ok(0) => {
                    debug!(direction, "Source reached end of stream");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, error = %e, "Relay read failed");
                    break;
                }
            },
        };

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            result = writer.write_all(&buffer[..n]) => {
                if let Err(e) = result {
                    debug!(direction, error = %e, "Relay write failed");
                    break;
                }
            }
        }

        total += n as u64;
    }

    signal.close();
    let _ = writer.shutdown().await;

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    /// Returns (accepted side, dialing side) of a loopback connection.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, dialed.unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bytes_flow_in_order_both_ways() {
        let (visitor_server, mut visitor) = tcp_pair().await;
        let (tunnel_server, mut tunnel) = tcp_pair().await;

        let handle = spawn_relay(visitor_server, tunnel_server);

        visitor.write_all(b"hello ").await.unwrap();
        visitor.write_all(b"through the tunnel").await.unwrap();
        let mut buf = vec![0u8; 24];
        timeout(Duration::from_secs(2), tunnel.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello through the tunnel");

        tunnel.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(2), visitor.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"reply");

        drop(visitor);
        let stats = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, 24);
        assert_eq!(stats.b_to_a, 5);
        assert_eq!(stats.total(), 29);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closing_one_side_closes_the_other() {
        let (visitor_server, visitor) = tcp_pair().await;
        let (tunnel_server, mut tunnel) = tcp_pair().await;

        let handle = spawn_relay(visitor_server, tunnel_server);
        drop(visitor);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), tunnel.read(&mut buf))
            .await
            .expect("peer was not closed in time")
            .unwrap();
        assert_eq!(n, 0);

        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_direction_is_unblocked() {
        // Nothing is ever written b->a; closing b must still end the a->b loop.
        let (visitor_server, mut visitor) = tcp_pair().await;
        let (tunnel_server, tunnel) = tcp_pair().await;

        let handle = spawn_relay(visitor_server, tunnel_server);
        drop(tunnel);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), visitor.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_relay_over_in_memory_streams() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);

        let handle = spawn_relay(a, b);

        a_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(b_peer);
        let mut rest = Vec::new();
        a_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = handle.await.unwrap();
        assert_eq!(stats.a_to_b, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_aborting_relay_closes_both_sockets() {
        let (visitor_server, mut visitor) = tcp_pair().await;
        let (tunnel_server, mut tunnel) = tcp_pair().await;

        let handle = spawn_relay(visitor_server, tunnel_server);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_secs(2), visitor.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        let n = timeout(Duration::from_secs(2), tunnel.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_close_signal_is_idempotent() {
        let signal = CloseSignal::new();
        let rx = signal.subscribe();
        signal.close();
        signal.close();
        assert!(*rx.borrow());
    }
}
