//! HTTP surface of the broker: tunnel upgrade plus admin routes, all behind the shared secret

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use lanbridge_transport_websocket::auth::{authorize, UNAUTHORIZED_BODY};
use lanbridge_transport_websocket::from_axum;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::admin;
use crate::broker::Broker;

const WWW_AUTHENTICATE: &str = "Basic realm=\"TCP-Forward-Serv\"";
const NO_CACHE: &str = "no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0";
const EXPIRED: &str = "Mon, 3 Jan 2000 12:34:56 GMT";

/// Router served on the tunnel listener
pub fn router(broker: Arc<Broker>) -> Router {
    let path = broker.config().websocket.path.clone();

    Router::new()
        .route(&path, get(tunnel_upgrade))
        .route("/admin", get(admin::admin_page))
        .route("/api/set", get(admin::set_target))
        .route("/api/agents", get(admin::list_agents))
        .layer(middleware::from_fn_with_state(broker.clone(), require_auth))
        .with_state(broker)
}

/// Reject requests whose `Authorization` header does not match the shared secret
pub async fn require_auth(
    State(broker): State<Arc<Broker>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if !authorize(broker.config().websocket.auth.as_ref(), presented) {
        warn!("Authentication failed for {} {}", request.method(), request.uri().path());
        return unauthorized();
    }

    next.run(request).await
}

/// The 401 answer for a failed secret comparison
pub fn unauthorized() -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(WWW_AUTHENTICATE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(header::EXPIRES, HeaderValue::from_static(EXPIRED));
    response
}

async fn tunnel_upgrade(
    State(broker): State<Arc<Broker>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    info!(agent = %remote_addr, "Tunnel upgrade request");

    let max_message_size = broker.config().websocket.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let connection = from_axum(socket, remote_addr);
            if let Err(e) = broker.run_tunnel(connection).await {
                if e.is_duplicate_identity() {
                    error!(agent = %remote_addr, "Registry still holds an open tunnel for this identity: {}", e);
                    std::process::abort();
                }
                warn!(agent = %remote_addr, "Tunnel session failed: {}", e);
            }
        })
}
