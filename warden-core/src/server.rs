//! # HTTP API — REST surface plus an embedded status page
//!
//! Every route delegates to the target monitor; nothing here owns state
//! beyond the shared handles. Validation failures return 400 with
//! `{error}`, platform enumeration failures 500. CORS is wide open — the
//! agent is expected to sit on an operator LAN behind its own perimeter.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::WardenError;
use crate::monitor::TargetMonitor;
use crate::types::MonitorTarget;

#[derive(Clone)]
pub struct ApiState {
    pub monitor: Arc<TargetMonitor>,
    pub config: Arc<RwLock<Config>>,
    /// When set, impact-config updates are persisted here.
    pub config_path: Option<PathBuf>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        let status = match err {
            WardenError::Validation(_) | WardenError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_html))
        .route("/api/processes", get(api_processes))
        .route("/api/system", get(api_system))
        .route("/api/status", get(api_status))
        .route("/api/monitor/targets", get(api_targets))
        .route("/api/monitor/add", post(api_add_target))
        .route("/api/monitor/remove", post(api_remove_target))
        .route("/api/monitor/removeAll", post(api_remove_all))
        .route("/api/monitor/update", post(api_update_target))
        .route("/api/monitor/start", post(api_start))
        .route("/api/monitor/stop", post(api_stop))
        .route("/api/metrics", get(api_metrics))
        .route("/api/metrics/latest", get(api_latest_metrics))
        .route("/api/events", get(api_events))
        .route("/api/process-changes", get(api_process_changes))
        .route("/api/impacts", get(api_impacts))
        .route("/api/impacts/summary", get(api_impacts_summary))
        .route("/api/impacts/clear", post(api_impacts_clear))
        .route("/api/config/impact", get(api_get_impact_config).post(api_set_impact_config))
        .layer(cors)
        .with_state(state)
}

/// Binds and serves until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::WardenResult<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn api_processes(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let snapshot = state.monitor.list_all_processes()?;
    Ok(Json(snapshot.as_ref().clone()))
}

async fn api_system(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.monitor.system_metrics()?))
}

async fn api_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "running": state.monitor.is_running(),
        "targets": state.monitor.target_count(),
    }))
}

async fn api_targets(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.monitor.get_targets())
}

async fn api_add_target(
    State(state): State<ApiState>,
    Json(target): Json<MonitorTarget>,
) -> ApiResult<impl IntoResponse> {
    state.monitor.add(target)?;
    state.monitor.start();
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct PidBody {
    pid: i32,
}

async fn api_remove_target(
    State(state): State<ApiState>,
    Json(body): Json<PidBody>,
) -> impl IntoResponse {
    state.monitor.remove(body.pid);
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_remove_all(State(state): State<ApiState>) -> impl IntoResponse {
    state.monitor.remove_all();
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_update_target(
    State(state): State<ApiState>,
    Json(target): Json<MonitorTarget>,
) -> ApiResult<impl IntoResponse> {
    state.monitor.update(target)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn api_start(State(state): State<ApiState>) -> impl IntoResponse {
    state.monitor.start();
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_stop(State(state): State<ApiState>) -> impl IntoResponse {
    state.monitor.stop();
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct MetricsQuery {
    pid: i32,
    #[serde(default)]
    n: usize,
}

async fn api_metrics(
    State(state): State<ApiState>,
    Query(query): Query<MetricsQuery>,
) -> impl IntoResponse {
    let n = if query.n == 0 { 60 } else { query.n };
    Json(state.monitor.metrics(query.pid, n))
}

async fn api_latest_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.monitor.latest_metrics_per_target())
}

#[derive(Deserialize)]
struct CountQuery {
    #[serde(default)]
    n: usize,
}

async fn api_events(
    State(state): State<ApiState>,
    Query(query): Query<CountQuery>,
) -> impl IntoResponse {
    let n = if query.n == 0 { 50 } else { query.n };
    Json(state.monitor.recent_events(n))
}

async fn api_process_changes(
    State(state): State<ApiState>,
    Query(query): Query<CountQuery>,
) -> impl IntoResponse {
    let n = if query.n == 0 { 50 } else { query.n };
    Json(state.monitor.process_changes(n))
}

async fn api_impacts(
    State(state): State<ApiState>,
    Query(query): Query<CountQuery>,
) -> impl IntoResponse {
    let n = if query.n == 0 { 50 } else { query.n };
    Json(state.monitor.recent_impacts(n))
}

async fn api_impacts_summary(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.monitor.impact_summary())
}

async fn api_impacts_clear(State(state): State<ApiState>) -> impl IntoResponse {
    state.monitor.clear_impacts();
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_get_impact_config(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.config.read().impact.clone())
}

/// Merge-updates the impact thresholds: only keys present in the body are
/// overwritten. The merged config is persisted (when a path is known) and
/// pushed into the running analyzer.
async fn api_set_impact_config(
    State(state): State<ApiState>,
    Json(patch): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let merged = {
        let config = state.config.read();
        let mut current = serde_json::to_value(&config.impact)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let Some(patch_map) = patch.as_object() else {
            return Err(ApiError::bad_request("body must be a JSON object"));
        };
        let Some(current_map) = current.as_object_mut() else {
            return Err(ApiError::bad_request("invalid impact config state"));
        };
        for (key, value) in patch_map {
            current_map.insert(key.clone(), value.clone());
        }
        serde_json::from_value::<crate::types::ImpactConfig>(current)
            .map_err(|e| ApiError::bad_request(format!("invalid impact config: {e}")))?
    };

    {
        let mut config = state.config.write();
        config.impact = merged.clone();
        if let Some(path) = &state.config_path {
            if let Err(e) = config.save(path) {
                warn!(error = %e, "persisting impact config failed");
                return Err(ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: format!("save config failed: {e}"),
                });
            }
        }
    }

    if let Some(analyzer) = state.monitor.analyzer() {
        analyzer.update_config(merged);
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ── Embedded status page ─────────────────────────────────────────────────

async fn index_html() -> impl IntoResponse {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Warden — Host Telemetry Agent</title>
<style>
  :root { --bg: #0b0f14; --card: #131a22; --border: #22303c; --text: #dbe4ec; --accent: #4da3ff; --danger: #ef5350; --warn: #ffb74d; --ok: #66bb6a; --muted: #718396; }
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: var(--bg); color: var(--text); font-family: 'SF Mono', 'Fira Code', monospace; }
  .header { padding: 18px 28px; border-bottom: 1px solid var(--border); display: flex; justify-content: space-between; align-items: center; }
  .header h1 { font-size: 1.3em; color: var(--accent); }
  .header .dot { display: inline-block; width: 8px; height: 8px; border-radius: 50%; background: var(--ok); margin-right: 6px; }
  .grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(240px, 1fr)); gap: 14px; padding: 20px 28px; }
  .card { background: var(--card); border: 1px solid var(--border); border-radius: 8px; padding: 14px; }
  .card h3 { font-size: 0.75em; color: var(--muted); text-transform: uppercase; letter-spacing: 1px; margin-bottom: 6px; }
  .card .value { font-size: 1.8em; font-weight: bold; color: var(--accent); }
  .section { padding: 0 28px 24px; }
  .section h2 { font-size: 1.0em; color: var(--accent); margin-bottom: 10px; }
  .rows { background: var(--card); border: 1px solid var(--border); border-radius: 8px; max-height: 360px; overflow-y: auto; }
  .row { display: grid; grid-template-columns: 150px 130px 80px 1fr; padding: 7px 12px; border-bottom: 1px solid var(--border); font-size: 0.78em; }
  .row:last-child { border-bottom: none; }
  .sev.critical { color: var(--danger); font-weight: bold; }
  .sev.high { color: var(--warn); font-weight: bold; }
  .sev.medium { color: #ffa726; }
  .sev.low { color: var(--muted); }
</style>
</head>
<body>
<div class="header">
  <h1>WARDEN</h1>
  <div><span class="dot"></span><span id="state">--</span></div>
</div>

<div class="grid">
  <div class="card"><h3>Guarded Targets</h3><div class="value" id="targets">--</div></div>
  <div class="card"><h3>System CPU</h3><div class="value" id="cpu">--</div></div>
  <div class="card"><h3>System Memory</h3><div class="value" id="mem">--</div></div>
  <div class="card"><h3>Active Impacts</h3><div class="value" id="impacts">--</div></div>
</div>

<div class="section">
  <h2>Recent Events</h2>
  <div class="rows" id="events"><div class="row">Loading…</div></div>
</div>

<div class="section">
  <h2>Active Impacts</h2>
  <div class="rows" id="impact-list"><div class="row">Loading…</div></div>
</div>

<script>
async function refresh() {
  try {
    const [status, sys, events, impacts, summary] = await Promise.all([
      fetch('/api/status').then(r => r.json()),
      fetch('/api/system').then(r => r.json()),
      fetch('/api/events?n=30').then(r => r.json()),
      fetch('/api/impacts?n=30').then(r => r.json()),
      fetch('/api/impacts/summary').then(r => r.json()),
    ]);

    document.getElementById('state').textContent = status.running ? 'RUNNING' : 'IDLE';
    document.getElementById('targets').textContent = status.targets;
    document.getElementById('cpu').textContent = sys.cpu_percent.toFixed(1) + '%';
    document.getElementById('mem').textContent = sys.memory_percent.toFixed(1) + '%';
    document.getElementById('impacts').textContent = summary.total;

    const eventRows = events.slice().reverse().map(e =>
      `<div class="row"><span>${new Date(e.timestamp).toLocaleTimeString()}</span>` +
      `<span>${e.type}</span><span>${e.pid}</span><span>${e.message}</span></div>`);
    document.getElementById('events').innerHTML =
      eventRows.join('') || '<div class="row">No events</div>';

    const impactRows = impacts.slice().reverse().map(i =>
      `<div class="row"><span>${new Date(i.timestamp).toLocaleTimeString()}</span>` +
      `<span>${i.impact_type}</span><span class="sev ${i.severity}">${i.severity}</span>` +
      `<span>${i.description}</span></div>`);
    document.getElementById('impact-list').innerHTML =
      impactRows.join('') || '<div class="row">No active impacts</div>';
  } catch (err) { console.error('refresh failed:', err); }
}
refresh();
setInterval(refresh, 3000);
</script>
</body>
</html>"#;
