//! WebSocket transport over a real loopback socket: axum accepts, the connector dials

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use lanbridge_transport::memory::recv_skipping_pings;
use lanbridge_transport::{TransportError, TunnelConnector, TunnelMessage};
use lanbridge_transport_websocket::auth::{authorize, UNAUTHORIZED_BODY};
use lanbridge_transport_websocket::{from_axum, BasicAuth, WebSocketConfig, WebSocketConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

async fn echo_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(auth): State<Option<BasicAuth>>,
    headers: HeaderMap,
) -> Response {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !authorize(auth.as_ref(), presented) {
        return (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY).into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let (tx, mut rx) = from_axum(socket, addr).split();
        while let Some(Ok(message)) = rx.recv().await {
            match message {
                TunnelMessage::Text(_) | TunnelMessage::Binary(_) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                TunnelMessage::Close => break,
                _ => {}
            }
        }
    })
}

/// Start an echo broker; returns its address
async fn start_echo_server(auth: Option<BasicAuth>) -> SocketAddr {
    let app = Router::new()
        .route("/_ws4client", get(echo_upgrade))
        .with_state(auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test]
async fn test_text_and_binary_echo() {
    init_tracing();
    let addr = start_echo_server(None).await;

    let connector =
        WebSocketConnector::new(&addr.to_string(), Arc::new(WebSocketConfig::default())).unwrap();
    let connection = connector.connect().await.unwrap();
    assert_eq!(connection.remote_address(), addr);

    let (tx, mut rx) = connection.split();
    tx.send_text(r#"{"type":4098,"index":0,"c":""}"#)
        .await
        .unwrap();
    tx.send_binary(Bytes::from_static(b"\x00\x01\x02\xff"))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), recv_skipping_pings(&mut rx))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        first,
        TunnelMessage::Text(r#"{"type":4098,"index":0,"c":""}"#.into())
    );

    let second = tokio::time::timeout(Duration::from_secs(5), recv_skipping_pings(&mut rx))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        second,
        TunnelMessage::Binary(Bytes::from_static(b"\x00\x01\x02\xff"))
    );

    tx.close().await;
}

#[tokio::test]
async fn test_matching_secret_is_accepted() {
    init_tracing();
    let addr = start_echo_server(BasicAuth::from_secret(Some("lan:s3cret"))).await;

    let config = WebSocketConfig::default().with_secret(Some("lan:s3cret"));
    let connector = WebSocketConnector::new(&addr.to_string(), Arc::new(config)).unwrap();
    let (tx, mut rx) = connector.connect().await.unwrap().split();

    tx.send_text("ping").await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), recv_skipping_pings(&mut rx))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, TunnelMessage::Text("ping".into()));
}

#[tokio::test]
async fn test_wrong_secret_is_rejected_with_401() {
    init_tracing();
    let addr = start_echo_server(BasicAuth::from_secret(Some("lan:s3cret"))).await;

    for secret in [Some("lan:wrong"), None] {
        let config = WebSocketConfig::default().with_secret(secret);
        let connector = WebSocketConnector::new(&addr.to_string(), Arc::new(config)).unwrap();
        let err = connector.connect().await.unwrap_err();
        assert!(
            matches!(err, TransportError::HandshakeRejected { status: 401 }),
            "unexpected error: {:?}",
            err
        );
    }
}
