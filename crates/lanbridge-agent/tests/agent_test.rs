//! Agent command handling, driven by a scripted broker over an in-memory tunnel

use bytes::Bytes;
use lanbridge_agent::TunnelAgent;
use lanbridge_forward::ForwardTarget;
use lanbridge_proto::{ControlFrame, FrameType};
use lanbridge_transport::memory::{self, recv_skipping_pings};
use lanbridge_transport::{TunnelMessage, TunnelReceiver, TunnelSender};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const STEP: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// The broker side of one tunnel
struct FakeBroker {
    tx: TunnelSender,
    rx: TunnelReceiver,
    agent: JoinHandle<Result<(), lanbridge_agent::AgentError>>,
}

impl FakeBroker {
    fn attach(target: ForwardTarget) -> Self {
        let (agent_side, broker_side) = memory::pair();
        let agent = TunnelAgent::new("test-agent", target).with_dial_timeout(Duration::from_secs(1));
        let agent = tokio::spawn(async move { agent.run(agent_side).await });

        let (tx, rx) = broker_side.split();
        Self { tx, rx, agent }
    }

    async fn send_frame(&self, frame: ControlFrame) {
        self.tx.send_text(frame.encode()).await.unwrap();
    }

    async fn next(&mut self) -> TunnelMessage {
        tokio::time::timeout(STEP, recv_skipping_pings(&mut self.rx))
            .await
            .expect("timed out waiting for agent")
            .expect("tunnel ended")
            .expect("tunnel error")
    }

    async fn next_frame(&mut self) -> ControlFrame {
        match self.next().await {
            TunnelMessage::Text(text) => ControlFrame::decode(text.as_bytes()).unwrap(),
            other => panic!("expected a control frame, got {:?}", other),
        }
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(QUIET, recv_skipping_pings(&mut self.rx)).await;
        assert!(next.is_err(), "unexpected message from agent: {:?}", next);
    }
}

/// Local service that echoes everything back
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Local service whose accepted sockets are handed to the test
async fn accepting_server() -> (SocketAddr, tokio::sync::mpsc::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            if tx.send(socket).await.is_err() {
                break;
            }
        }
    });
    (addr, rx)
}

/// An address nothing listens on
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_get_and_set_config() {
    init_tracing();
    let target = ForwardTarget::new("127.0.0.1:8000");
    let mut broker = FakeBroker::attach(target.clone());

    broker.send_frame(ControlFrame::new(FrameType::GetConfig)).await;
    let reply = broker.next_frame().await;
    assert_eq!(reply.kind, FrameType::GetConfig);
    assert_eq!(reply.content, "127.0.0.1:8000");

    broker
        .send_frame(ControlFrame::with_content(FrameType::SetConfig, "10.1.1.1:3389"))
        .await;
    let reply = broker.next_frame().await;
    assert_eq!(reply.kind, FrameType::SysOk);
    assert_eq!(reply.content, "10.1.1.1:3389");
    assert_eq!(target.get(), "10.1.1.1:3389");

    broker.send_frame(ControlFrame::new(FrameType::SetConfig)).await;
    assert_eq!(broker.next_frame().await.kind, FrameType::SysErr);
    assert_eq!(target.get(), "10.1.1.1:3389");
}

#[tokio::test]
async fn test_dial_failure_reports_error() {
    init_tracing();
    let target = ForwardTarget::new(closed_port().await.to_string());
    let mut broker = FakeBroker::attach(target);

    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    let reply = broker.next_frame().await;
    assert_eq!(reply.kind, FrameType::SysErr);
    assert!(!reply.content.is_empty());

    // Back to idle: the next request dials again
    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    assert_eq!(broker.next_frame().await.kind, FrameType::SysErr);
}

#[tokio::test]
async fn test_forwards_through_local_target() {
    init_tracing();
    let target = ForwardTarget::new(echo_server().await.to_string());
    let mut broker = FakeBroker::attach(target);

    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    broker
        .tx
        .send_binary(Bytes::from_static(b"ping over the tunnel"))
        .await
        .unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 20 {
        match broker.next().await {
            TunnelMessage::Binary(data) => echoed.extend_from_slice(&data),
            other => panic!("expected payload, got {:?}", other),
        }
    }
    assert_eq!(echoed, b"ping over the tunnel");

    // Broker-side close: the agent acknowledges exactly once
    broker.send_frame(ControlFrame::new(FrameType::RequestFinish)).await;
    assert_eq!(broker.next_frame().await.kind, FrameType::RequestFinish);
    broker.expect_silence().await;
}

#[tokio::test]
async fn test_busy_agent_keeps_its_flow() {
    init_tracing();
    let (addr, mut accepted) = accepting_server().await;
    let mut broker = FakeBroker::attach(ForwardTarget::new(addr.to_string()));

    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    let mut local = tokio::time::timeout(STEP, accepted.recv()).await.unwrap().unwrap();

    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    assert_eq!(broker.next_frame().await.kind, FrameType::ClientBusy);

    // The first flow is untouched
    broker
        .tx
        .send_binary(Bytes::from_static(b"still here"))
        .await
        .unwrap();
    let mut buf = [0u8; 10];
    tokio::time::timeout(STEP, local.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still here");

    local.write_all(b"ack").await.unwrap();
    assert_eq!(
        broker.next().await,
        TunnelMessage::Binary(Bytes::from_static(b"ack"))
    );
}

#[tokio::test]
async fn test_local_close_sends_finish_and_frees_agent() {
    init_tracing();
    let (addr, mut accepted) = accepting_server().await;
    let mut broker = FakeBroker::attach(ForwardTarget::new(addr.to_string()));

    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    let local = tokio::time::timeout(STEP, accepted.recv()).await.unwrap().unwrap();
    drop(local);

    assert_eq!(broker.next_frame().await.kind, FrameType::RequestFinish);

    // The broker never acknowledges; the agent is idle again regardless
    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    let _second = tokio::time::timeout(STEP, accepted.recv()).await.unwrap().unwrap();
    broker.expect_silence().await;
}

#[tokio::test]
async fn test_finish_while_idle_is_silent() {
    init_tracing();
    let mut broker = FakeBroker::attach(ForwardTarget::new("127.0.0.1:8000"));

    broker.send_frame(ControlFrame::new(FrameType::RequestFinish)).await;
    broker.tx.send_text("{not json").await.unwrap();
    broker
        .tx
        .send_binary(Bytes::from_static(b"stray"))
        .await
        .unwrap();
    broker.expect_silence().await;

    broker.send_frame(ControlFrame::new(FrameType::GetConfig)).await;
    assert_eq!(broker.next_frame().await.kind, FrameType::GetConfig);
}

#[tokio::test]
async fn test_tunnel_close_ends_agent_and_flow() {
    init_tracing();
    let (addr, mut accepted) = accepting_server().await;
    let broker = FakeBroker::attach(ForwardTarget::new(addr.to_string()));

    broker.send_frame(ControlFrame::new(FrameType::NewConnection)).await;
    let mut local = tokio::time::timeout(STEP, accepted.recv()).await.unwrap().unwrap();

    broker.tx.close().await;
    let FakeBroker { tx, rx, agent } = broker;
    drop(tx);
    drop(rx);

    tokio::time::timeout(STEP, agent)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(STEP, local.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(buf.is_empty());
}
