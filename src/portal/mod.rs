// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Control portal — local HTTP server and fleet control surface.
//!
//! Read routes are unauthenticated (node-local trust). Write routes under
//! `/api/fleet/*` require `Authorization: Bearer <fleet.token>`; with no
//! token configured they reply 503. Health routes proxy the IPC socket and
//! reply 503 when it is unreachable.

pub mod events;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::{write_camera_position, write_dotted_key, write_log_level, NodeConfig};
use crate::health::socket::send_command;
use crate::health::HealthBus;
use crate::service::{schedule_reboot, schedule_service_restart, ControlCommand};
use crate::state::CameraState;
use crate::storage::StorageManager;
use crate::update::get_update_info;

const LOG_LINES_DEFAULT: usize = 50;
const LOG_LINES_MAX: usize = 1000;
const WIFI_AP_CONNECTION: &str = "sai-cam-ap";

/// Shared state passed to all handlers.
pub struct AppState {
    pub config: Arc<std::sync::RwLock<NodeConfig>>,
    pub config_path: PathBuf,
    pub bus: Arc<HealthBus>,
    pub storage: Arc<StorageManager>,
    pub control: mpsc::Sender<ControlCommand>,
    pub socket_path: PathBuf,
    pub shutdown: CancellationToken,
    update_running: AtomicBool,
    metrics: Metrics,
}

struct Metrics {
    registry: Registry,
    cpu_percent: IntGauge,
    memory_percent: IntGauge,
    disk_percent: IntGauge,
    pending_images: IntGauge,
    uploaded_images: IntGauge,
    warning_count: IntGauge,
    error_count: IntGauge,
    uptime_seconds: IntGauge,
    camera_up: IntGaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();
        // Static names; construction cannot fail.
        let gauge = |name: &str, help: &str| {
            let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
            let _ = registry.register(Box::new(g.clone()));
            g
        };
        let camera_up = IntGaugeVec::new(
            Opts::new("sai_cam_camera_up", "1 when the camera is healthy"),
            &["camera"],
        )
        .unwrap();
        let _ = registry.register(Box::new(camera_up.clone()));
        Self {
            cpu_percent: gauge("sai_cam_cpu_percent", "CPU usage percent"),
            memory_percent: gauge("sai_cam_memory_percent", "Memory usage percent"),
            disk_percent: gauge("sai_cam_disk_percent", "Disk usage percent"),
            pending_images: gauge("sai_cam_pending_images", "Images stored but not yet uploaded"),
            uploaded_images: gauge("sai_cam_uploaded_images", "Images delivered to the ingest endpoint"),
            warning_count: gauge("sai_cam_warning_count", "Health warnings since start"),
            error_count: gauge("sai_cam_error_count", "Health errors since start"),
            uptime_seconds: gauge("sai_cam_uptime_seconds", "Agent uptime"),
            camera_up,
            registry,
        }
    }
}

impl AppState {
    pub fn new(
        config: Arc<std::sync::RwLock<NodeConfig>>,
        config_path: PathBuf,
        bus: Arc<HealthBus>,
        storage: Arc<StorageManager>,
        control: mpsc::Sender<ControlCommand>,
        socket_path: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            config_path,
            bus,
            storage,
            control,
            socket_path,
            shutdown,
            update_running: AtomicBool::new(false),
            metrics: Metrics::new(),
        }
    }

    fn config_snapshot(&self) -> Option<NodeConfig> {
        self.config.read().ok().map(|c| c.clone())
    }
}

// ──────────────── router ───────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let assets_dir = state
        .config_snapshot()
        .map(|c| c.portal.assets_dir)
        .unwrap_or_else(|| "portal".into());
    // A relative assets dir is resolved next to the service binary.
    let assets_dir = if assets_dir.is_relative() {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&assets_dir)))
            .unwrap_or(assets_dir)
    } else {
        assets_dir
    };
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/status/cameras", get(handle_status_cameras))
        .route("/api/status/system", get(handle_status_system))
        .route("/api/status/network", get(handle_status_network))
        .route("/api/health", get(handle_health))
        .route("/api/health/cameras", get(handle_health_cameras))
        .route("/api/health/threads", get(handle_health_threads))
        .route("/api/health/system", get(handle_health_system))
        .route("/api/logs", get(handle_logs))
        .route("/api/events", get(events::handle_events))
        .route("/api/images/{camera_id}/latest", get(handle_latest_image))
        .route("/api/config", get(handle_config))
        .route("/api/cameras/{camera_id}/capture", post(handle_capture))
        .route("/api/cameras/{camera_id}/restart", post(handle_restart))
        .route("/api/cameras/{camera_id}/position", post(handle_position))
        .route("/api/log_level", get(handle_log_level_get).post(handle_log_level_post))
        .route("/api/wifi_ap/enable", post(handle_wifi_enable))
        .route("/api/wifi_ap/disable", post(handle_wifi_disable))
        // Fleet control plane
        .route("/api/fleet/ping", get(handle_fleet_ping))
        .route("/api/fleet/update/apply", post(handle_fleet_update_apply))
        .route("/api/fleet/service/restart", post(handle_fleet_service_restart))
        .route("/api/fleet/reboot", post(handle_fleet_reboot))
        .route("/api/fleet/config", post(handle_fleet_config))
        .route("/metrics", get(handle_metrics))
        // Static dashboard assets
        .fallback_service(ServeDir::new(assets_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server; returns when cancelled or on bind failure.
pub async fn start_server(state: Arc<AppState>, token: CancellationToken) {
    let Some(cfg) = state.config_snapshot() else {
        return;
    };
    let addr = format!("{}:{}", cfg.portal.host, cfg.portal.port);
    let app = build_router(state);
    info!(addr = %addr, "Control portal listening");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind control portal");
            return;
        }
    };

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "Control portal error");
    }
}

// ──────────────── fleet auth ───────────────────────────────────────────────

/// `Ok(())`, or the error response the route must return.
fn check_fleet_auth(state: &AppState, headers: &HeaderMap) -> Result<(), axum::response::Response> {
    let token = state
        .config_snapshot()
        .and_then(|c| c.fleet.token.clone())
        .filter(|t| !t.is_empty());
    let Some(token) = token else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "fleet control not configured on this node"})),
        )
            .into_response());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(token.as_str()) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid bearer token"})),
        )
            .into_response());
    }
    Ok(())
}

// ──────────────── status projections ───────────────────────────────────────

fn detect_features(cfg: &NodeConfig, wifi_ap_active: bool) -> serde_json::Value {
    json!({
        "wifi_ap": wifi_ap_active,
        "cameras": !cfg.cameras.is_empty(),
        "storage": cfg.storage.base_path.exists(),
        "monitoring": true,
        "onvif": cfg.cameras.iter().any(|c| c.kind.name() == "onvif"),
        "stream": cfg.cameras.iter().any(|c| c.kind.name() == "stream"),
        "direct": cfg.cameras.iter().any(|c| c.kind.name() == "direct"),
        "updates": cfg.updates.enabled,
        "fleet": cfg.fleet.token.is_some(),
    })
}

fn camera_status_list(state: &AppState) -> Vec<serde_json::Value> {
    let Some(cfg) = state.config_snapshot() else {
        return Vec::new();
    };
    let trackers = state.bus.camera_statuses();
    let failed = state.bus.failed_statuses();
    cfg.cameras
        .iter()
        .map(|cam| {
            let tracker = trackers.iter().find(|t| t.camera_id == cam.id);
            let failure = failed.iter().find(|f| f.camera_id == cam.id);
            let latest_image = state
                .storage
                .latest_image(&cam.id)
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
            json!({
                "id": cam.id,
                "type": cam.kind.name(),
                "position": cam.position,
                "capture_interval": cam.capture_interval,
                "online": tracker.is_some_and(|t| t.state == CameraState::Healthy),
                "state": tracker.map(|t| t.state).unwrap_or(CameraState::Offline),
                "consecutive_failures": tracker.map(|t| t.consecutive_failures).unwrap_or(0),
                "error": failure.map(|f| f.error.clone()),
                "retry_in_seconds": failure.map(|f| f.next_retry_seconds),
                "last_success_age": tracker.map(|t| t.last_success_age),
                "latest_image": latest_image,
            })
        })
        .collect()
}

pub(crate) async fn network_info(cfg: &NodeConfig) -> serde_json::Value {
    let mut interfaces = serde_json::Map::new();
    let networks = sysinfo::Networks::new_with_refreshed_list();
    for (name, data) in networks.list() {
        if name == "lo"
            || name == "docker0"
            || name.starts_with("br-")
            || name.starts_with("veth")
        {
            continue;
        }
        let ipv4 = data
            .ip_networks()
            .iter()
            .find(|ip| ip.addr.is_ipv4())
            .map(|ip| ip.addr.to_string());
        if let Some(ip) = ipv4 {
            interfaces.insert(
                name.clone(),
                json!({
                    "ip": ip,
                    "type": if name.starts_with("wl") { "wireless" } else { "ethernet" },
                }),
            );
        }
    }

    let upstream_online = matches!(
        tokio::time::timeout(
            std::time::Duration::from_secs(3),
            tokio::process::Command::new("ping")
                .args(["-c", "1", "-W", "2", "8.8.8.8"])
                .output(),
        )
        .await,
        Ok(Ok(output)) if output.status.success()
    );

    let wan_interface = if cfg.network.mode == "wifi-client" {
        cfg.network
            .wifi_client
            .as_ref()
            .map(|w| w.wifi_iface.clone())
            .unwrap_or_else(|| "wlan0".into())
    } else {
        cfg.network.interface.clone()
    };

    json!({
        "interfaces": interfaces,
        "upstream_online": upstream_online,
        "mode": cfg.network.mode,
        "wan_interface": wan_interface,
    })
}

async fn iw_output(args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        tokio::process::Command::new("iw").args(args).output(),
    )
    .await
    .ok()?
    .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn is_wifi_ap_active() -> bool {
    iw_output(&["dev", "wlan0", "info"])
        .await
        .is_some_and(|out| out.contains("type AP"))
}

pub(crate) async fn wifi_ap_info(cfg: &NodeConfig) -> Option<serde_json::Value> {
    if !is_wifi_ap_active().await {
        return None;
    }
    let clients = iw_output(&["dev", "wlan0", "station", "dump"])
        .await
        .map(|out| out.matches("Station ").count())
        .unwrap_or(0);
    let channel = iw_output(&["dev", "wlan0", "info"])
        .await
        .and_then(|out| {
            out.lines()
                .find(|l| l.contains("channel"))
                .and_then(|l| l.split("channel").nth(1))
                .and_then(|rest| rest.trim().split_whitespace().next().map(str::to_string))
        })
        .unwrap_or_else(|| "N/A".into());
    Some(json!({
        "ssid": format!("SAI-Node-{}", cfg.device.id),
        "connected_clients": clients,
        "channel": channel,
        "interface": "wlan0",
    }))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(cfg) = state.config_snapshot() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "config unavailable"})))
            .into_response();
    };
    let wifi_active = is_wifi_ap_active().await;
    let mut system = state.bus.system();
    system.uptime = state.bus.uptime_seconds();

    let mut body = json!({
        "node": {
            "id": cfg.device.id,
            "location": cfg.device.location,
            "description": cfg.device.description,
            "version": crate::VERSION,
        },
        "features": detect_features(&cfg, wifi_active),
        "data": {
            "system": system,
            "cameras": camera_status_list(&state),
            "storage": state.storage.stats(),
            "network": network_info(&cfg).await,
            "wifi_ap": wifi_ap_info(&cfg).await,
        },
        "timestamp": Utc::now().to_rfc3339(),
    });
    if cfg.updates.enabled {
        body["update"] = serde_json::to_value(get_update_info(&cfg.updates.state_path))
            .unwrap_or(serde_json::Value::Null);
    }
    (StatusCode::OK, Json(body)).into_response()
}

async fn handle_status_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(camera_status_list(&state))
}

async fn handle_status_system(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut system = state.bus.system();
    system.uptime = state.bus.uptime_seconds();
    Json(serde_json::to_value(system).unwrap_or_default())
}

async fn handle_status_network(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.config_snapshot() {
        Some(cfg) => Json(network_info(&cfg).await).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// ──────────────── health proxies ───────────────────────────────────────────

async fn health_snapshot_via_socket(state: &AppState) -> Result<serde_json::Value, axum::response::Response> {
    send_command(&state.socket_path, &json!({"action": "health"}))
        .await
        .map_err(|e| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": format!("health socket unavailable: {e}")})),
            )
                .into_response()
        })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match health_snapshot_via_socket(&state).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(resp) => resp,
    }
}

async fn health_field(state: &AppState, field: &str) -> axum::response::Response {
    match health_snapshot_via_socket(state).await {
        Ok(mut snapshot) => {
            let value = snapshot
                .get_mut(field)
                .map(serde_json::Value::take)
                .unwrap_or(serde_json::Value::Null);
            (StatusCode::OK, Json(value)).into_response()
        }
        Err(resp) => resp,
    }
}

async fn handle_health_cameras(State(state): State<Arc<AppState>>) -> axum::response::Response {
    health_field(&state, "cameras").await
}

async fn handle_health_threads(State(state): State<Arc<AppState>>) -> axum::response::Response {
    health_field(&state, "threads").await
}

async fn handle_health_system(State(state): State<Arc<AppState>>) -> axum::response::Response {
    health_field(&state, "system").await
}

// ──────────────── logs ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LogsParams {
    #[serde(default)]
    lines: Option<String>,
}

/// Clamp the `lines` parameter to `[1, 1000]`; anything unparseable falls
/// back to the default of 50.
pub fn clamp_log_lines(raw: Option<&str>) -> usize {
    match raw.and_then(|v| v.parse::<i64>().ok()) {
        Some(n) => n.clamp(1, LOG_LINES_MAX as i64) as usize,
        None => LOG_LINES_DEFAULT,
    }
}

pub fn log_paths(cfg: &NodeConfig) -> (PathBuf, PathBuf) {
    let camera = cfg.logging.log_dir.join(&cfg.logging.log_file);
    let update = cfg.logging.log_dir.join("self-update.log");
    (camera, update)
}

fn tail_lines(path: &std::path::Path, max: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].iter().map(|l| l.trim_end().to_string()).collect()
}

async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsParams>,
) -> impl IntoResponse {
    let lines = clamp_log_lines(params.lines.as_deref());
    let Some(cfg) = state.config_snapshot() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "config unavailable"})))
            .into_response();
    };
    let (camera_log, update_log) = log_paths(&cfg);
    let mut merged = tail_lines(&camera_log, lines);
    merged.extend(tail_lines(&update_log, lines));
    // Lines start with timestamps, so a lexicographic sort interleaves the
    // two files chronologically.
    merged.sort();
    let start = merged.len().saturating_sub(lines);
    (StatusCode::OK, Json(json!({"logs": merged[start..].to_vec()}))).into_response()
}

// ──────────────── images & config ──────────────────────────────────────────

async fn handle_latest_image(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> axum::response::Response {
    let Some(path) = state.storage.latest_image(&camera_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "No images found"}))).into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [("content-type", "image/jpeg"), ("cache-control", "no-cache")],
            bytes,
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Cannot read image: {e}")})),
        )
            .into_response(),
    }
}

async fn handle_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.config_snapshot() {
        Some(cfg) => (StatusCode::OK, Json(cfg.redacted())).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// ──────────────── camera commands ──────────────────────────────────────────

async fn camera_command(state: &AppState, action: &str, camera_id: &str) -> axum::response::Response {
    let request = json!({"action": action, "camera_id": camera_id});
    match send_command(&state.socket_path, &request).await {
        Ok(response) => {
            let status = if response.get("error").is_some() {
                if response["error"] == "not found" {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            } else {
                StatusCode::OK
            };
            (status, Json(response)).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": format!("health socket unavailable: {e}")})),
        )
            .into_response(),
    }
}

async fn handle_capture(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> axum::response::Response {
    camera_command(&state, "force_capture", &camera_id).await
}

async fn handle_restart(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> axum::response::Response {
    camera_command(&state, "restart_camera", &camera_id).await
}

#[derive(Deserialize)]
pub struct PositionBody {
    position: String,
}

async fn handle_position(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
    Json(body): Json<PositionBody>,
) -> axum::response::Response {
    // Update the file first, then mirror into the running config.
    if let Err(e) = write_camera_position(&state.config_path, &camera_id, &body.position) {
        let status = match e {
            crate::error::AgentError::CameraNotFound { .. } => StatusCode::NOT_FOUND,
            crate::error::AgentError::Io(ref io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                StatusCode::FORBIDDEN
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return (status, Json(json!({"error": e.to_string()}))).into_response();
    }
    if let Ok(mut cfg) = state.config.write() {
        if let Some(cam) = cfg.cameras.iter_mut().find(|c| c.id == camera_id) {
            cam.position = body.position.clone();
        }
    }
    (StatusCode::OK, Json(json!({"ok": true, "camera_id": camera_id, "position": body.position})))
        .into_response()
}

// ──────────────── log level ────────────────────────────────────────────────

const LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR"];

async fn handle_log_level_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let level = state
        .config_snapshot()
        .map(|c| c.logging.level)
        .unwrap_or_else(|| "INFO".into());
    Json(json!({"level": level}))
}

#[derive(Deserialize)]
pub struct LogLevelBody {
    level: String,
}

async fn handle_log_level_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LogLevelBody>,
) -> axum::response::Response {
    let level = body.level.to_uppercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("level must be one of {LOG_LEVELS:?}")})),
        )
            .into_response();
    }
    if let Err(e) = write_log_level(&state.config_path, &level) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
            .into_response();
    }
    // The reload path re-reads the file and flips the live filter.
    let _ = state.control.send(ControlCommand::Reload).await;
    (StatusCode::OK, Json(json!({"ok": true, "level": level}))).into_response()
}

// ──────────────── WiFi AP ──────────────────────────────────────────────────

async fn nmcli_connection(action: &str) -> axum::response::Response {
    info!(action, connection = WIFI_AP_CONNECTION, "Switching WiFi AP");
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        tokio::process::Command::new("nmcli")
            .args(["con", action, WIFI_AP_CONNECTION])
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => (
            StatusCode::OK,
            Json(json!({"success": true, "message": format!("WiFi AP {action} successful")})),
        )
            .into_response(),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let message = if stderr.is_empty() { stdout } else { stderr };
            error!(error = %message, "WiFi AP switch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": message})),
            )
                .into_response()
        }
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": "Operation timed out"})),
        )
            .into_response(),
    }
}

async fn handle_wifi_enable() -> axum::response::Response {
    nmcli_connection("up").await
}

async fn handle_wifi_disable() -> axum::response::Response {
    nmcli_connection("down").await
}

// ──────────────── fleet routes ─────────────────────────────────────────────

async fn handle_fleet_ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node_id = state
        .config_snapshot()
        .map(|c| c.device.id)
        .unwrap_or_else(|| "unknown".into());
    Json(json!({
        "ok": true,
        "version": crate::VERSION,
        "node_id": node_id,
        "uptime": state.bus.uptime_seconds(),
    }))
}

async fn handle_fleet_update_apply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(resp) = check_fleet_auth(&state, &headers) {
        return resp;
    }
    let Some(cfg) = state.config_snapshot() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    if state
        .update_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return (StatusCode::CONFLICT, Json(json!({"error": "update already running"})))
            .into_response();
    }

    let script = cfg.updates.script_path.clone();
    let channel = cfg.updates.channel.clone();
    let state_clone = state.clone();
    tokio::spawn(async move {
        info!(script = %script.display(), channel = %channel, "Starting self-update procedure");
        let result = tokio::process::Command::new(&script)
            .env("UPDATE_CHANNEL", &channel)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                info!("Self-update procedure finished");
            }
            Ok(output) => {
                error!(
                    code = output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Self-update procedure failed"
                );
            }
            Err(e) => error!(error = %e, "Could not start self-update procedure"),
        }
        state_clone.update_running.store(false, Ordering::SeqCst);
    });

    (StatusCode::OK, Json(json!({"ok": true, "triggered": true}))).into_response()
}

async fn handle_fleet_service_restart(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(resp) = check_fleet_auth(&state, &headers) {
        return resp;
    }
    match schedule_service_restart().await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true, "triggered": true}))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn handle_fleet_reboot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Err(resp) = check_fleet_auth(&state, &headers) {
        return resp;
    }
    match schedule_reboot().await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true, "triggered": true}))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct FleetConfigBody {
    key: String,
    value: serde_json::Value,
}

async fn handle_fleet_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FleetConfigBody>,
) -> axum::response::Response {
    if let Err(resp) = check_fleet_auth(&state, &headers) {
        return resp;
    }
    let allowed = state
        .config_snapshot()
        .map(|c| c.fleet.allowed_config_keys)
        .unwrap_or_default();
    if !allowed.iter().any(|k| k == &body.key) {
        warn!(key = %body.key, "Fleet config write for non-allow-listed key");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": format!("key '{}' is not in fleet.allowed_config_keys", body.key)})),
        )
            .into_response();
    }
    let yaml_value: serde_yaml::Value =
        serde_yaml::to_value(&body.value).unwrap_or(serde_yaml::Value::Null);
    if let Err(e) = write_dotted_key(&state.config_path, &body.key, yaml_value) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
            .into_response();
    }
    // Pick up whatever subset of the change is live-reloadable.
    let _ = state.control.send(ControlCommand::Reload).await;
    (StatusCode::OK, Json(json!({"ok": true, "key": body.key}))).into_response()
}

// ──────────────── metrics ──────────────────────────────────────────────────

async fn handle_metrics(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let enabled = state.config_snapshot().map(|c| c.portal.metrics).unwrap_or(false);
    if !enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let system = state.bus.system();
    let stats = state.storage.stats();
    let (_, warnings, errors) = state.bus.counters();
    let m = &state.metrics;
    m.cpu_percent.set(system.cpu_percent as i64);
    m.memory_percent.set(system.memory_percent as i64);
    m.disk_percent.set(system.disk_percent as i64);
    m.pending_images.set(stats.pending_images as i64);
    m.uploaded_images.set(stats.uploaded_images as i64);
    m.warning_count.set(warnings as i64);
    m.error_count.set(errors as i64);
    m.uptime_seconds.set(state.bus.uptime_seconds() as i64);
    for status in state.bus.camera_statuses() {
        let up = i64::from(status.state == CameraState::Healthy);
        m.camera_up.with_label_values(&[&status.camera_id]).set(up);
    }

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&m.registry.gather(), &mut buf).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
