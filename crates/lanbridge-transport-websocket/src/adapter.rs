//! Adapters from concrete WebSocket implementations to [`TunnelConnection`]

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use lanbridge_transport::{TransportError, TunnelConnection, TunnelMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

/// Adapt a tokio-tungstenite stream (agent side)
pub fn from_tungstenite<S>(
    ws: WebSocketStream<S>,
    remote_addr: SocketAddr,
    keep_alive: Option<Duration>,
) -> TunnelConnection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(map_tungstenite_error)
        .with(|message: TunnelMessage| {
            future::ready(Ok::<_, TransportError>(tunnel_to_tungstenite(message)))
        });
    let stream = stream.filter_map(|result| {
        future::ready(match result {
            Ok(message) => tungstenite_to_tunnel(message).map(Ok),
            Err(e) => Some(Err(map_tungstenite_error(e))),
        })
    });

    match keep_alive {
        Some(interval) => TunnelConnection::with_keep_alive(sink, stream, remote_addr, interval),
        None => TunnelConnection::new(sink, stream, remote_addr),
    }
}

/// Adapt an upgraded axum socket (broker side)
pub fn from_axum(socket: WebSocket, remote_addr: SocketAddr) -> TunnelConnection {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
        .with(|message: TunnelMessage| {
            future::ready(Ok::<_, TransportError>(tunnel_to_axum(message)))
        });
    let stream = stream.filter_map(|result| {
        future::ready(match result {
            Ok(message) => axum_to_tunnel(message).map(Ok),
            Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
        })
    });

    TunnelConnection::new(sink, stream, remote_addr)
}

pub(crate) fn map_tungstenite_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        tungstenite::Error::Http(response) => TransportError::HandshakeRejected {
            status: response.status().as_u16(),
        },
        other => TransportError::WebSocket(other.to_string()),
    }
}

fn tunnel_to_tungstenite(message: TunnelMessage) -> WsMessage {
    match message {
        TunnelMessage::Text(text) => WsMessage::Text(text),
        TunnelMessage::Binary(data) => WsMessage::Binary(data.to_vec()),
        TunnelMessage::Ping(data) => WsMessage::Ping(data.to_vec()),
        TunnelMessage::Pong(data) => WsMessage::Pong(data.to_vec()),
        TunnelMessage::Close => WsMessage::Close(None),
    }
}

fn tungstenite_to_tunnel(message: WsMessage) -> Option<TunnelMessage> {
    match message {
        WsMessage::Text(text) => Some(TunnelMessage::Text(text)),
        WsMessage::Binary(data) => Some(TunnelMessage::Binary(Bytes::from(data))),
        WsMessage::Ping(data) => Some(TunnelMessage::Ping(Bytes::from(data))),
        WsMessage::Pong(data) => Some(TunnelMessage::Pong(Bytes::from(data))),
        WsMessage::Close(_) => Some(TunnelMessage::Close),
        // Raw frames only show up when writing; nothing to deliver
        WsMessage::Frame(_) => None,
    }
}

fn tunnel_to_axum(message: TunnelMessage) -> AxumMessage {
    match message {
        TunnelMessage::Text(text) => AxumMessage::Text(text.into()),
        TunnelMessage::Binary(data) => AxumMessage::Binary(data),
        TunnelMessage::Ping(data) => AxumMessage::Ping(data),
        TunnelMessage::Pong(data) => AxumMessage::Pong(data),
        TunnelMessage::Close => AxumMessage::Close(None),
    }
}

fn axum_to_tunnel(message: AxumMessage) -> Option<TunnelMessage> {
    match message {
        AxumMessage::Text(text) => Some(TunnelMessage::Text(text.as_str().to_owned())),
        AxumMessage::Binary(data) => Some(TunnelMessage::Binary(data)),
        AxumMessage::Ping(data) => Some(TunnelMessage::Ping(data)),
        AxumMessage::Pong(data) => Some(TunnelMessage::Pong(data)),
        AxumMessage::Close(_) => Some(TunnelMessage::Close),
    }
}
