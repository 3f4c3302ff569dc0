//! Tunnel connection: a shared send path backed by a writer task, plus the receive half

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::{TransportError, TransportResult, TunnelMessage};

/// Outgoing messages waiting for the writer task
const SEND_QUEUE_SIZE: usize = 64;

/// Payload of keep-alive pings
const PING_PAYLOAD: &[u8] = b"lanbridge";

type BoxSink = Pin<Box<dyn Sink<TunnelMessage, Error = TransportError> + Send>>;
type BoxStream = Pin<Box<dyn Stream<Item = TransportResult<TunnelMessage>> + Send>>;

/// Traffic counters shared by both halves of a connection
#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Connection statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_secs: u64,
}

/// An established tunnel. Split it to get the cloneable send path and the receive half.
pub struct TunnelConnection {
    sender: TunnelSender,
    receiver: TunnelReceiver,
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("connection_id", &self.sender.connection_id)
            .field("remote_addr", &self.sender.remote_addr)
            .finish()
    }
}

impl TunnelConnection {
    /// Wrap a message sink/stream pair. Spawns the writer task on the current runtime.
    pub fn new<Si, St>(sink: Si, stream: St, remote_addr: SocketAddr) -> Self
    where
        Si: Sink<TunnelMessage, Error = TransportError> + Send + 'static,
        St: Stream<Item = TransportResult<TunnelMessage>> + Send + 'static,
    {
        Self::build(Box::pin(sink), Box::pin(stream), remote_addr, None)
    }

    /// Like [`TunnelConnection::new`], additionally sending a ping every `interval`
    pub fn with_keep_alive<Si, St>(
        sink: Si,
        stream: St,
        remote_addr: SocketAddr,
        interval: Duration,
    ) -> Self
    where
        Si: Sink<TunnelMessage, Error = TransportError> + Send + 'static,
        St: Stream<Item = TransportResult<TunnelMessage>> + Send + 'static,
    {
        Self::build(Box::pin(sink), Box::pin(stream), remote_addr, Some(interval))
    }

    fn build(
        sink: BoxSink,
        stream: BoxStream,
        remote_addr: SocketAddr,
        keep_alive: Option<Duration>,
    ) -> Self {
        let connection_id: Arc<str> = format!("tun-{}", uuid::Uuid::new_v4()).into();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        tokio::spawn(writer_task(
            sink,
            rx,
            keep_alive,
            closed.clone(),
            counters.clone(),
            connection_id.clone(),
        ));

        let sender = TunnelSender {
            connection_id: connection_id.clone(),
            remote_addr,
            tx,
            closed,
            counters: counters.clone(),
            created_at: Instant::now(),
        };
        let receiver = TunnelReceiver {
            connection_id,
            stream,
            counters,
        };

        Self { sender, receiver }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.sender.remote_addr
    }

    pub fn connection_id(&self) -> &str {
        &self.sender.connection_id
    }

    pub fn split(self) -> (TunnelSender, TunnelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Writer task - the only place that touches the sink
async fn writer_task(
    mut sink: BoxSink,
    mut rx: mpsc::Receiver<TunnelMessage>,
    keep_alive: Option<Duration>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    conn_id: Arc<str>,
) {
    let mut ticker = keep_alive.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = next_tick(&mut ticker) => {
                trace!("[{}] Sending keep-alive ping", conn_id);
                TunnelMessage::Ping(Bytes::from_static(PING_PAYLOAD))
            }
        };

        let is_close = matches!(message, TunnelMessage::Close);
        counters
            .bytes_sent
            .fetch_add(message.len() as u64, Ordering::Relaxed);

        if let Err(e) = sink.send(message).await {
            if e.is_closed() {
                debug!("[{}] Tunnel closed while sending", conn_id);
            } else {
                error!("[{}] Tunnel send error: {}", conn_id, e);
            }
            break;
        }

        if is_close {
            break;
        }
    }

    debug!("[{}] Tunnel writer task ended", conn_id);
    closed.store(true, Ordering::SeqCst);
    let _ = sink.close().await;
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable send path of a tunnel. All clones feed the same writer task, so
/// messages from one clone keep their relative order.
#[derive(Clone)]
pub struct TunnelSender {
    connection_id: Arc<str>,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<TunnelMessage>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    created_at: Instant,
}

impl std::fmt::Debug for TunnelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSender")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TunnelSender {
    /// Queue a message for the writer task. Waits while the send queue is full.
    pub async fn send(&self, message: TunnelMessage) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> TransportResult<()> {
        self.send(TunnelMessage::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: Bytes) -> TransportResult<()> {
        self.send(TunnelMessage::Binary(data)).await
    }

    /// Send a close frame; the writer task exits after flushing it
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        debug!("[{}] Closing tunnel to {}", self.connection_id, self.remote_addr);
        let _ = self.tx.send(TunnelMessage::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Receive half of a tunnel
pub struct TunnelReceiver {
    connection_id: Arc<str>,
    stream: BoxStream,
    counters: Arc<Counters>,
}

impl TunnelReceiver {
    /// Next message, `None` once the transport is exhausted
    pub async fn recv(&mut self) -> Option<TransportResult<TunnelMessage>> {
        let next = self.stream.next().await;
        if let Some(Ok(message)) = &next {
            self.counters
                .bytes_received
                .fetch_add(message.len() as u64, Ordering::Relaxed);
            trace!(
                "[{}] Received {} ({} bytes)",
                self.connection_id,
                message.kind(),
                message.len()
            );
        }
        next
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}
