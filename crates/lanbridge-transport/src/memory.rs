//! In-process tunnel pair
//!
//! Two [`TunnelConnection`]s wired back to back over channels. Used by tests
//! on both sides of the protocol in place of a real WebSocket.

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::{TransportError, TransportResult, TunnelConnection, TunnelMessage};

const CHANNEL_SIZE: usize = 64;

static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

fn next_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Create a connected pair. Each side's `remote_address()` is a distinct
/// loopback address, so several pairs can be registered side by side.
pub fn pair() -> (TunnelConnection, TunnelConnection) {
    let (a_tx, a_rx) = mpsc::channel::<TunnelMessage>(CHANNEL_SIZE);
    let (b_tx, b_rx) = mpsc::channel::<TunnelMessage>(CHANNEL_SIZE);

    let a = TunnelConnection::new(
        a_tx.sink_map_err(|_| TransportError::ConnectionClosed),
        b_rx.map(Ok::<_, TransportError>),
        next_addr(),
    );
    let b = TunnelConnection::new(
        b_tx.sink_map_err(|_| TransportError::ConnectionClosed),
        a_rx.map(Ok::<_, TransportError>),
        next_addr(),
    );
    (a, b)
}

/// Convenience for tests: the next message that is not a keep-alive frame
pub async fn recv_skipping_pings(
    receiver: &mut crate::TunnelReceiver,
) -> Option<TransportResult<TunnelMessage>> {
    loop {
        match receiver.recv().await {
            Some(Ok(TunnelMessage::Ping(_))) | Some(Ok(TunnelMessage::Pong(_))) => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, b) = pair();
        assert_ne!(a.remote_address(), b.remote_address());

        let (a_tx, mut a_rx) = a.split();
        let (b_tx, mut b_rx) = b.split();

        a_tx.send_text("hello").await.unwrap();
        a_tx.send_binary(Bytes::from_static(b"\x00\x01")).await.unwrap();
        b_tx.send_text("world").await.unwrap();

        assert_eq!(
            b_rx.recv().await.unwrap().unwrap(),
            TunnelMessage::Text("hello".into())
        );
        assert_eq!(
            b_rx.recv().await.unwrap().unwrap(),
            TunnelMessage::Binary(Bytes::from_static(b"\x00\x01"))
        );
        assert_eq!(
            a_rx.recv().await.unwrap().unwrap(),
            TunnelMessage::Text("world".into())
        );

        let stats = a_tx.stats();
        assert_eq!(stats.bytes_sent, 7);
        assert_eq!(stats.bytes_received, 5);
    }

    #[tokio::test]
    async fn test_close_reaches_peer() {
        let (a, b) = pair();
        let (a_tx, _a_rx) = a.split();
        let (_b_tx, mut b_rx) = b.split();

        a_tx.close().await;

        assert_eq!(b_rx.recv().await.unwrap().unwrap(), TunnelMessage::Close);
        // The writer exits after the close frame, which drops the channel
        assert!(b_rx.recv().await.is_none());

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !a_tx.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sender should observe the close");
        assert!(a_tx.send_text("late").await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_stream() {
        let (a, b) = pair();
        let (_a_tx, mut a_rx) = a.split();
        drop(b);

        assert!(a_rx.recv().await.is_none());
    }
}
