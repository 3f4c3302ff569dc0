//! Forward session: uplink/downlink tasks and their shared teardown

use bytes::Bytes;
use lanbridge_proto::request_finish_frame;
use lanbridge_transport::TunnelSender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{ForwardConfig, ForwardError};

/// Who noticed that the session is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The local stream hit EOF or a read error, or the tunnel refused a chunk
    Uplink,
    /// Writing to the local stream failed
    Downlink,
    /// The peer sent a terminal frame or its transport went away.
    /// `acknowledge` answers with a `RequestFinish` of our own.
    Peer { acknowledge: bool },
}

impl Teardown {
    fn sends_request_finish(self) -> bool {
        match self {
            Teardown::Uplink | Teardown::Downlink => true,
            Teardown::Peer { acknowledge } => acknowledge,
        }
    }

    /// The downlink already exited on its own when it is the origin
    fn needs_sentinel(self) -> bool {
        !matches!(self, Teardown::Downlink)
    }
}

/// Bytes moved by a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Local stream -> tunnel
    pub bytes_up: u64,
    /// Tunnel -> local stream
    pub bytes_down: u64,
}

struct SessionInner {
    label: String,
    tunnel: TunnelSender,
    config: ForwardConfig,
    queue_tx: mpsc::Sender<Bytes>,
    queue_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// One flow spliced onto a tunnel. Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct ForwardSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ForwardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardSession")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ForwardSession {
    /// Create a session bound to a tunnel send path. Payloads can be delivered
    /// right away; they wait in the queue until [`ForwardSession::start`].
    pub fn new(label: impl Into<String>, tunnel: TunnelSender, config: ForwardConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                label: label.into(),
                tunnel,
                config,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown,
                closed: AtomicBool::new(false),
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Attach the local stream and spawn the uplink and downlink tasks.
    ///
    /// Starting a session that was already torn down still runs the downlink,
    /// so payloads queued before the teardown (an error text from the peer,
    /// typically) reach the stream before it is closed.
    pub fn start<S>(&self, stream: S) -> Result<ForwardTasks, ForwardError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let queue = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ForwardError::AlreadyStarted)?;

        debug!(session = %self.inner.label, "Starting forward session");

        let (reader, writer) = tokio::io::split(stream);
        let uplink = tokio::spawn(uplink_task(self.clone(), reader));
        let downlink = tokio::spawn(downlink_task(self.clone(), writer, queue));

        Ok(ForwardTasks { uplink, downlink })
    }

    /// Hand a payload received from the tunnel to the downlink.
    /// Waits while the queue is full; empty payloads are ignored.
    pub async fn deliver(&self, data: Bytes) -> Result<(), ForwardError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(ForwardError::SessionClosed);
        }
        trace!(session = %self.inner.label, bytes = data.len(), "Queueing payload for downlink");
        self.inner
            .queue_tx
            .send(data)
            .await
            .map_err(|_| ForwardError::SessionClosed)
    }

    /// Tear the session down. Only the first call does anything.
    pub async fn finish(&self, origin: Teardown) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            trace!(session = %self.inner.label, ?origin, "Forward session already finished");
            return;
        }

        debug!(session = %self.inner.label, ?origin, "Finishing forward session");

        if origin.sends_request_finish() {
            if let Err(e) = self.inner.tunnel.send_text(request_finish_frame()).await {
                debug!(session = %self.inner.label, "Could not send Req-finish: {}", e);
            }
        }

        self.inner.shutdown.send_replace(true);

        if origin.needs_sentinel() {
            // Queued behind any payload still waiting for the downlink
            let _ = self.inner.queue_tx.send(Bytes::new()).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
        }
    }

    /// Same underlying session
    pub fn ptr_eq(&self, other: &ForwardSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Handles to the two tasks of a started session
#[derive(Debug)]
pub struct ForwardTasks {
    pub uplink: JoinHandle<u64>,
    pub downlink: JoinHandle<u64>,
}

impl ForwardTasks {
    /// Wait for both tasks to exit
    pub async fn join(self) -> Result<ForwardStats, ForwardError> {
        let (up, down) = tokio::join!(self.uplink, self.downlink);
        Ok(ForwardStats {
            bytes_up: up.map_err(|e| ForwardError::Task(e.to_string()))?,
            bytes_down: down.map_err(|e| ForwardError::Task(e.to_string()))?,
        })
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Local stream -> tunnel
async fn uplink_task<S>(session: ForwardSession, mut reader: ReadHalf<S>) -> u64
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let label = session.inner.label.clone();
    let mut shutdown = session.inner.shutdown.subscribe();
    let mut buf = vec![0u8; session.inner.config.chunk_size.max(1)];
    let mut total = 0u64;

    let local_end = loop {
        let read = tokio::select! {
            biased;
            _ = wait_shutdown(&mut shutdown) => break false,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(session = %label, "Local stream reached EOF");
                break true;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = session.inner.tunnel.send_binary(chunk).await {
                    debug!(session = %label, "Tunnel refused payload: {}", e);
                    break true;
                }
                total += n as u64;
                session.inner.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(session = %label, "Local stream read failed: {}", e);
                break true;
            }
        }
    };

    if local_end {
        session.finish(Teardown::Uplink).await;
    }

    trace!(session = %label, bytes = total, "Uplink task ended");
    total
}

/// Tunnel -> local stream
async fn downlink_task<S>(
    session: ForwardSession,
    mut writer: WriteHalf<S>,
    mut queue: mpsc::Receiver<Bytes>,
) -> u64
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let label = session.inner.label.clone();
    let mut total = 0u64;

    while let Some(chunk) = queue.recv().await {
        if chunk.is_empty() {
            trace!(session = %label, "Downlink got end-of-session marker");
            break;
        }

        if let Err(e) = writer.write_all(&chunk).await {
            warn!(session = %label, "Local stream write failed: {}", e);
            session.finish(Teardown::Downlink).await;
            break;
        }
        total += chunk.len() as u64;
        session
            .inner
            .bytes_down
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    trace!(session = %label, bytes = total, "Downlink task ended");
    total
}
