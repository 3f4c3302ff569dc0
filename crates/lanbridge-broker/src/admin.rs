//! Admin page and API

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::registry::AgentSnapshot;

const ADMIN_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>lanbridge admin</title></head>
<body>
<p>
  Local network target (host:port):
  <input id="target" value="{target}" />
  <input type="button" value="Set" onclick="setTarget()" />
</p>
<p>Agents: {agents} connected, {free} free</p>
<p id="result"></p>
<script>
function setTarget() {
  var svr = document.getElementById('target').value;
  fetch('/api/set?svr=' + encodeURIComponent(svr), { cache: 'no-store' })
    .then(function (resp) { return resp.text(); })
    .then(function (text) { document.getElementById('result').textContent = text; })
    .catch(function (err) { document.getElementById('result').textContent = err; });
}
</script>
</body>
</html>
"#;

#[derive(Debug, Deserialize)]
pub struct SetParams {
    pub svr: Option<String>,
}

/// Body of `GET /api/agents`
#[derive(Debug, Serialize)]
pub struct AgentList {
    pub agents: Vec<AgentSnapshot>,
    pub total: usize,
    pub free: usize,
    pub target: String,
}

/// `GET /admin`
pub async fn admin_page(State(broker): State<Arc<Broker>>) -> Response {
    let registry = broker.registry();
    let page = ADMIN_HTML
        .replace("{target}", &escape_html(&broker.target().get()))
        .replace("{agents}", &registry.count().to_string())
        .replace("{free}", &registry.free_count().to_string());

    ([(header::CACHE_CONTROL, "no-store")], Html(page)).into_response()
}

/// `GET /api/set?svr=host:port`
///
/// Sends `SetConfig` to one free agent. An empty or unchanged value is a no-op
/// with an empty body.
pub async fn set_target(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<SetParams>,
) -> String {
    let svr = params.svr.unwrap_or_default().trim().to_string();
    if svr.is_empty() || svr == broker.target().get() {
        return String::new();
    }

    info!("Admin requested forward target {}", svr);
    match broker.push_target(&svr).await {
        Ok(()) => format!("Set [{}] OK", svr),
        Err(e) => {
            warn!("Could not push forward target {}: {}", svr, e);
            e.to_string()
        }
    }
}

/// `GET /api/agents`
pub async fn list_agents(State(broker): State<Arc<Broker>>) -> Json<AgentList> {
    let registry = broker.registry();
    let agents = registry.list();
    let free = agents.iter().filter(|a| !a.working).count();

    Json(AgentList {
        total: agents.len(),
        free,
        agents,
        target: broker.target().get(),
    })
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
