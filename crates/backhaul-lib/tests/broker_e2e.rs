//! End-to-end broker tests
//!
//! These run a real broker on loopback ports and drive it with:
//! 1. An echo server standing in for the private service
//! 2. The real agent, or raw sockets posing as one
//! 3. Visitors connecting to the public address

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use backhaul_lib::{Agent, AgentConfig, Broker, BrokerConfig, BrokerHandle, BrokerStats};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn broker_config(target_idle_tunnels: usize) -> BrokerConfig {
    BrokerConfig {
        agent_addr: "127.0.0.1:0".parse().unwrap(),
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        visitor_addr: "127.0.0.1:0".parse().unwrap(),
        target_idle_tunnels,
        monitor_interval_secs: 1,
        shutdown_grace_secs: 1,
        ..BrokerConfig::default()
    }
}

struct RunningBroker {
    agent_addr: String,
    tunnel_addr: String,
    visitor_addr: String,
    handle: BrokerHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<BrokerStats>,
}

impl RunningBroker {
    async fn start(config: BrokerConfig) -> Self {
        let broker = Broker::bind(config).await.unwrap();
        let addrs = broker.addrs();
        let handle = broker.handle();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(broker.run(rx));

        Self {
            agent_addr: addrs.agent.to_string(),
            tunnel_addr: addrs.tunnel.to_string(),
            visitor_addr: addrs.visitor.to_string(),
            handle,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> BrokerStats {
        self.shutdown.send_replace(true);
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("broker did not stop")
            .unwrap()
    }
}

async fn start_echo_service() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// Reads until EOF; a reset also counts as closed.
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket was not closed");
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_visitor_reaches_service_through_agent() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = RunningBroker::start(broker_config(2)).await;
    let service_addr = start_echo_service().await;

    let agent = Agent::new(AgentConfig {
        control_addr: broker.agent_addr.clone(),
        tunnel_addr: broker.tunnel_addr.clone(),
        service_addr,
        initial_tunnels: 0,
        max_reconnect_attempts: 0,
        reconnect_delay_secs: 1,
        max_reconnect_delay_secs: 1,
    });
    let (agent_tx, agent_rx) = watch::channel(false);
    let agent_task = tokio::spawn(async move { agent.run(agent_rx).await });

    // The monitor asks the agent for tunnels until the pool reaches target.
    let pool = broker.handle.pool();
    wait_until("pool to fill", || pool.len() >= 2).await;

    let mut visitor = TcpStream::connect(&broker.visitor_addr).await.unwrap();
    visitor.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = [0u8; 24];
    timeout(Duration::from_secs(5), visitor.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    let handle = broker.handle.clone();
    wait_until("pairing recorded", || handle.stats().visitors_paired == 1).await;

    drop(visitor);
    agent_tx.send_replace(true);
    let _ = timeout(Duration::from_secs(5), agent_task).await;

    let stats = broker.stop().await;
    assert_eq!(stats.visitors_paired, 1);
    assert_eq!(stats.visitors_rejected, 0);
    assert!(stats.tunnels_registered >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_monitor_signals_deficit_to_bound_agent() {
    let broker = RunningBroker::start(broker_config(2)).await;

    // A raw control socket posing as an agent that never opens tunnels.
    let mut control = TcpStream::connect(&broker.agent_addr).await.unwrap();
    let registry = broker.handle.registry();
    wait_until("agent bound", || registry.count() == 1).await;

    let mut buf = [0u8; 30];
    timeout(Duration::from_secs(5), control.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"NEW_CONNECTION\nNEW_CONNECTION\n");

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_visitor_claims_one_of_two_tunnels() {
    let broker = RunningBroker::start(broker_config(0)).await;

    let mut t1 = TcpStream::connect(&broker.tunnel_addr).await.unwrap();
    let mut t2 = TcpStream::connect(&broker.tunnel_addr).await.unwrap();
    let pool = broker.handle.pool();
    wait_until("tunnels registered", || pool.len() == 2).await;

    let mut visitor = TcpStream::connect(&broker.visitor_addr).await.unwrap();
    wait_until("tunnel claimed", || pool.len() == 1).await;

    let key1 = t1.local_addr().unwrap().to_string();
    let key2 = t2.local_addr().unwrap().to_string();
    assert!(pool.contains(&key1) ^ pool.contains(&key2));

    let claimed = if pool.contains(&key1) { &mut t2 } else { &mut t1 };
    visitor.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), claimed.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    // Closing the tunnel side closes the visitor.
    claimed.shutdown().await.unwrap();
    assert_closed(&mut visitor).await;

    let stats = broker.stop().await;
    assert_eq!(stats.visitors_paired, 1);
    assert_eq!(stats.tunnels_registered, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_visitor_without_tunnel_is_closed() {
    let broker = RunningBroker::start(broker_config(0)).await;

    for _ in 0..2 {
        let mut visitor = TcpStream::connect(&broker.visitor_addr).await.unwrap();
        assert_closed(&mut visitor).await;
    }

    let handle = broker.handle.clone();
    wait_until("rejections recorded", || handle.stats().visitors_rejected == 2).await;

    let stats = broker.stop().await;
    assert_eq!(stats.visitors_rejected, 2);
    assert_eq!(stats.visitors_paired, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_idle_tunnels_and_agents() {
    let broker = RunningBroker::start(broker_config(0)).await;

    let mut tunnel = TcpStream::connect(&broker.tunnel_addr).await.unwrap();
    let mut control = TcpStream::connect(&broker.agent_addr).await.unwrap();
    let pool = broker.handle.pool();
    let registry = broker.handle.registry();
    wait_until("tunnel registered", || pool.len() == 1).await;
    wait_until("agent bound", || registry.count() == 1).await;

    let stats = broker.stop().await;
    assert_eq!(stats.idle_tunnels, 0);
    assert_eq!(stats.bound_agents, 0);

    assert_closed(&mut tunnel).await;
    assert_closed(&mut control).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_capacity_is_enforced() {
    let broker = RunningBroker::start(BrokerConfig {
        max_agents: 1,
        ..broker_config(0)
    })
    .await;

    let _first = TcpStream::connect(&broker.agent_addr).await.unwrap();
    let registry = broker.handle.registry();
    wait_until("first agent bound", || registry.count() == 1).await;

    let mut second = TcpStream::connect(&broker.agent_addr).await.unwrap();
    assert_closed(&mut second).await;

    let stats = broker.stop().await;
    assert_eq!(stats.agents_rejected, 1);
}
