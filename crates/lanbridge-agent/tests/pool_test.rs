//! Worker pool lifecycle over in-memory tunnels

use async_trait::async_trait;
use lanbridge_agent::{AgentConfig, AgentPool};
use lanbridge_proto::{ControlFrame, FrameType};
use lanbridge_transport::memory::{self, recv_skipping_pings};
use lanbridge_transport::{TransportResult, TunnelConnection, TunnelConnector, TunnelMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const STEP: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Hands the broker end of every new tunnel to the test
#[derive(Debug)]
struct MemoryConnector {
    brokers: mpsc::UnboundedSender<TunnelConnection>,
    dials: AtomicUsize,
}

#[async_trait]
impl TunnelConnector for MemoryConnector {
    async fn connect(&self) -> TransportResult<TunnelConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (agent_side, broker_side) = memory::pair();
        let _ = self.brokers.send(broker_side);
        Ok(agent_side)
    }

    fn endpoint(&self) -> String {
        "memory".into()
    }
}

fn pool_with(
    workers: usize,
) -> (
    Arc<AgentPool>,
    Arc<MemoryConnector>,
    mpsc::UnboundedReceiver<TunnelConnection>,
) {
    pool_with_target(workers, "127.0.0.1:8000")
}

fn pool_with_target(
    workers: usize,
    target: &str,
) -> (
    Arc<AgentPool>,
    Arc<MemoryConnector>,
    mpsc::UnboundedReceiver<TunnelConnection>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MemoryConnector {
        brokers: tx,
        dials: AtomicUsize::new(0),
    });
    let config = AgentConfig::new("memory", target)
        .with_workers(workers)
        .with_reconnect_delay(Duration::from_millis(20));
    let pool = Arc::new(AgentPool::new(config, connector.clone()).unwrap());
    (pool, connector, rx)
}

async fn next_tunnel(rx: &mut mpsc::UnboundedReceiver<TunnelConnection>) -> TunnelConnection {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("no tunnel opened")
        .expect("connector dropped")
}

#[tokio::test]
async fn test_opens_one_tunnel_per_worker() {
    init_tracing();
    let (pool, connector, mut tunnels) = pool_with(3);
    let running = tokio::spawn(pool.clone().run());

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(next_tunnel(&mut tunnels).await);
    }
    assert_eq!(connector.dials.load(Ordering::SeqCst), 3);

    pool.stop();
    tokio::time::timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnects_after_tunnel_closes() {
    init_tracing();
    let (pool, connector, mut tunnels) = pool_with(1);
    let running = tokio::spawn(pool.clone().run());

    let (tx, _rx) = next_tunnel(&mut tunnels).await.split();
    tx.close().await;

    let (tx, mut rx) = next_tunnel(&mut tunnels).await.split();
    assert_eq!(connector.dials.load(Ordering::SeqCst), 2);

    // The replacement tunnel is fully functional
    tx.send_text(ControlFrame::new(FrameType::GetConfig).encode())
        .await
        .unwrap();
    let reply = tokio::time::timeout(STEP, recv_skipping_pings(&mut rx))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match reply {
        TunnelMessage::Text(text) => {
            let frame = ControlFrame::decode(text.as_bytes()).unwrap();
            assert_eq!(frame.content, "127.0.0.1:8000");
        }
        other => panic!("expected a control frame, got {:?}", other),
    }

    pool.stop();
    tokio::time::timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_set_config_is_shared_by_workers() {
    init_tracing();
    let (pool, _connector, mut tunnels) = pool_with(2);
    let running = tokio::spawn(pool.clone().run());

    let (first_tx, mut first_rx) = next_tunnel(&mut tunnels).await.split();
    let (second_tx, mut second_rx) = next_tunnel(&mut tunnels).await.split();

    first_tx
        .send_text(ControlFrame::with_content(FrameType::SetConfig, "10.9.9.9:22").encode())
        .await
        .unwrap();
    let ack = tokio::time::timeout(STEP, recv_skipping_pings(&mut first_rx))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(ack, TunnelMessage::Text(_)));
    assert_eq!(pool.target().get(), "10.9.9.9:22");

    second_tx
        .send_text(ControlFrame::new(FrameType::GetConfig).encode())
        .await
        .unwrap();
    match tokio::time::timeout(STEP, recv_skipping_pings(&mut second_rx))
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        TunnelMessage::Text(text) => {
            let frame = ControlFrame::decode(text.as_bytes()).unwrap();
            assert_eq!(frame.kind, FrameType::GetConfig);
            assert_eq!(frame.content, "10.9.9.9:22");
        }
        other => panic!("expected a control frame, got {:?}", other),
    }

    pool.stop();
    tokio::time::timeout(STEP, running).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_closes_running_flow_and_tunnel() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();
    let (pool, _connector, mut tunnels) = pool_with_target(1, &target);
    let running = tokio::spawn(pool.clone().run());

    let (tx, mut rx) = next_tunnel(&mut tunnels).await.split();
    tx.send_text(ControlFrame::new(FrameType::NewConnection).encode())
        .await
        .unwrap();
    let (mut local, _) = tokio::time::timeout(STEP, listener.accept())
        .await
        .unwrap()
        .unwrap();

    // Let the flow settle before stopping
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.stop();
    tokio::time::timeout(STEP, running).await.unwrap().unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(STEP, local.read_to_end(&mut buf))
        .await
        .expect("local connection still open after stop")
        .unwrap();
    assert!(buf.is_empty());

    let last = tokio::time::timeout(STEP, recv_skipping_pings(&mut rx))
        .await
        .expect("tunnel still open after stop");
    assert!(matches!(last, None | Some(Ok(TunnelMessage::Close))));
}
