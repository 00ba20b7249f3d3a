use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::util::redact::redact_url_credentials;

/// Top-level configuration loaded from a YAML file.
///
/// String values may reference environment variables with `${NAME}` or
/// `${NAME:-default}`; expansion happens once, on the raw file text, before
/// deserialization.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    /// Node identity.
    pub device: DeviceConfig,
    /// List of cameras to drive.
    pub cameras: Vec<CameraConfig>,
    /// Local bounded storage policy.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ingest endpoint settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Health monitoring thresholds.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Capture loop tuning.
    #[serde(default)]
    pub advanced: AdvancedConfig,
    /// Logging policy.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Local control portal (optional).
    #[serde(default)]
    pub portal: PortalConfig,
    /// Network description used by status projections (optional).
    #[serde(default)]
    pub network: NetworkConfig,
    /// Fleet control settings (optional; fleet routes reply 503 without a token).
    #[serde(default)]
    pub fleet: FleetConfig,
    /// Self-update settings (optional).
    #[serde(default)]
    pub updates: UpdatesConfig,
    /// Directory for the IPC socket.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
}

/// Per-camera configuration with a tagged per-kind payload.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Unique identifier used for file naming and API addressing.
    pub id: String,
    #[serde(flatten)]
    pub kind: CameraKindConfig,
    /// Seconds between captures.
    #[serde(default = "default_capture_interval")]
    pub capture_interval: u64,
    /// Requested resolution `[width, height]`.
    #[serde(default = "default_resolution")]
    pub resolution: [u32; 2],
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Free-text mounting position, editable through the portal.
    #[serde(default)]
    pub position: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CameraKindConfig {
    /// Local video device (v4l2).
    Direct {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_index: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brightness: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contrast: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        saturation: Option<i32>,
        #[serde(default = "default_true")]
        auto_exposure: bool,
    },
    /// Buffered network stream (RTSP).
    Stream {
        /// URL with embedded credentials accepted; always redacted when logged.
        stream_url: String,
        #[serde(default)]
        buffer_size: u32,
    },
    /// ONVIF device captured over snapshot-over-HTTP.
    Onvif {
        address: String,
        #[serde(default = "default_onvif_port")]
        port: u16,
        #[serde(default = "default_onvif_username")]
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wsdl_dir: Option<PathBuf>,
        #[serde(default = "default_onvif_timeout")]
        timeout: u64,
    },
}

impl CameraKindConfig {
    pub fn name(&self) -> &'static str {
        match self {
            CameraKindConfig::Direct { .. } => "direct",
            CameraKindConfig::Stream { .. } => "stream",
            CameraKindConfig::Onvif { .. } => "onvif",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: f64,
    #[serde(default = "default_cleanup_threshold_gb")]
    pub cleanup_threshold_gb: f64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_storage_path(),
            max_size_gb: default_max_size_gb(),
            cleanup_threshold_gb: default_cleanup_threshold_gb(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Ingest endpoint URL. Empty disables uploads.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    /// Per-upload timeout in seconds.
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: String::new(),
            ssl_verify: true,
            cert_path: None,
            timeout: default_server_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitoringConfig {
    /// Seconds between health samples.
    #[serde(default = "default_health_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_max_percent")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_percent")]
    pub max_memory_percent: f32,
    #[serde(default)]
    pub restart_on_failure: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_interval(),
            max_cpu_percent: default_max_percent(),
            max_memory_percent: default_max_percent(),
            restart_on_failure: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AdvancedConfig {
    /// Seconds slept between capture-loop polls.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: f64,
    /// Seconds to wait before a reconnect attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Seconds a freshly opened source is given to stabilize.
    #[serde(default = "default_init_wait")]
    pub camera_init_wait: u64,
    #[serde(default)]
    pub ffmpeg_debug: bool,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            reconnect_delay: default_reconnect_delay(),
            reconnect_attempts: default_reconnect_attempts(),
            camera_init_wait: default_init_wait(),
            ffmpeg_debug: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_log_max_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_log_backups")]
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            max_size_bytes: default_log_max_bytes(),
            backup_count: default_log_backups(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PortalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_portal_port")]
    pub port: u16,
    #[serde(default = "default_portal_host")]
    pub host: String,
    /// Static dashboard assets, served from disk.
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
    /// Prometheus exposition at `/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_portal_port(),
            host: default_portal_host(),
            assets_dir: default_assets_dir(),
            metrics: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_network_mode")]
    pub mode: String,
    #[serde(default = "default_wan_interface")]
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_client: Option<WifiClientConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: default_network_mode(),
            interface: default_wan_interface(),
            wifi_client: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WifiClientConfig {
    #[serde(default = "default_wifi_iface")]
    pub wifi_iface: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FleetConfig {
    /// Bearer token required on `/api/fleet/*` write routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Dotted YAML keys the fleet may rewrite via `/api/fleet/config`.
    #[serde(default)]
    pub allowed_config_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UpdatesConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_update_channel")]
    pub channel: String,
    #[serde(default = "default_update_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_update_script")]
    pub script_path: PathBuf,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: default_update_channel(),
            state_path: default_update_state_path(),
            script_path: default_update_script(),
        }
    }
}

fn default_true() -> bool { true }
fn default_capture_interval() -> u64 { 300 }
fn default_resolution() -> [u32; 2] { [1280, 720] }
fn default_fps() -> u32 { 30 }
fn default_onvif_port() -> u16 { 8000 }
fn default_onvif_username() -> String { "admin".into() }
fn default_onvif_timeout() -> u64 { 30 }
fn default_storage_path() -> PathBuf { "/opt/sai-cam/storage".into() }
fn default_max_size_gb() -> f64 { 10.0 }
fn default_cleanup_threshold_gb() -> f64 { 8.0 }
fn default_retention_days() -> u64 { 30 }
fn default_server_timeout() -> u64 { 30 }
fn default_health_interval() -> u64 { 60 }
fn default_max_percent() -> f32 { 90.0 }
fn default_polling_interval() -> f64 { 0.1 }
fn default_reconnect_delay() -> u64 { 5 }
fn default_reconnect_attempts() -> u32 { 3 }
fn default_init_wait() -> u64 { 2 }
fn default_log_level() -> String { "INFO".into() }
fn default_log_dir() -> PathBuf { "/var/log/sai-cam".into() }
fn default_log_file() -> String { "camera_service.log".into() }
fn default_log_max_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_log_backups() -> u32 { 5 }
fn default_portal_port() -> u16 { 8080 }
fn default_portal_host() -> String { "0.0.0.0".into() }
fn default_assets_dir() -> PathBuf { "portal".into() }
fn default_network_mode() -> String { "ethernet".into() }
fn default_wan_interface() -> String { "eth0".into() }
fn default_wifi_iface() -> String { "wlan0".into() }
fn default_update_channel() -> String { "stable".into() }
fn default_update_state_path() -> PathBuf { "/var/lib/sai-cam/update-state.json".into() }
fn default_update_script() -> PathBuf { "/opt/sai-cam/bin/self-update.sh".into() }
fn default_runtime_dir() -> PathBuf { "/run/sai-cam".into() }

impl NodeConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("Cannot read config file: {e}")))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text (after env expansion).
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let mut config: NodeConfig = serde_yaml::from_str(&expanded)
            .map_err(|e| AgentError::Config(format!("Invalid YAML: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `CAMERA_IP` / `CAMERA_PORT` / `CAMERA_USERNAME` / `CAMERA_PASSWORD`
    /// take precedence over configured ONVIF credentials.
    fn apply_env_overrides(&mut self) {
        for cam in &mut self.cameras {
            if let CameraKindConfig::Onvif { address, port, username, password, .. } = &mut cam.kind {
                if let Ok(v) = std::env::var("CAMERA_IP") {
                    if !v.is_empty() {
                        *address = v;
                    }
                }
                if let Ok(v) = std::env::var("CAMERA_PORT") {
                    if let Ok(p) = v.parse() {
                        *port = p;
                    }
                }
                if let Ok(v) = std::env::var("CAMERA_USERNAME") {
                    if !v.is_empty() {
                        *username = v;
                    }
                }
                if let Ok(v) = std::env::var("CAMERA_PASSWORD") {
                    if !v.is_empty() {
                        *password = v;
                    }
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.device.id.is_empty() {
            return Err(AgentError::Config("device.id must not be empty".into()));
        }
        if self.cameras.is_empty() {
            return Err(AgentError::Config("No cameras defined".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(&cam.id) {
                return Err(AgentError::Config(format!("Duplicate camera id '{}'", cam.id)));
            }
            if cam.capture_interval == 0 {
                return Err(AgentError::Config(format!(
                    "Camera '{}': capture_interval must be > 0", cam.id
                )));
            }
            if cam.resolution[0] == 0 || cam.resolution[1] == 0 {
                return Err(AgentError::Config(format!(
                    "Camera '{}': resolution values must be > 0", cam.id
                )));
            }
            match &cam.kind {
                CameraKindConfig::Stream { stream_url, .. } if stream_url.is_empty() => {
                    return Err(AgentError::Config(format!(
                        "Camera '{}': stream cameras require 'stream_url'", cam.id
                    )));
                }
                CameraKindConfig::Onvif { address, .. } if address.is_empty() => {
                    return Err(AgentError::Config(format!(
                        "Camera '{}': onvif cameras require 'address'", cam.id
                    )));
                }
                _ => {}
            }
        }
        if self.storage.max_size_gb <= 0.0 {
            return Err(AgentError::Config("storage.max_size_gb must be > 0".into()));
        }
        if self.storage.cleanup_threshold_gb <= 0.0
            || self.storage.cleanup_threshold_gb > self.storage.max_size_gb
        {
            return Err(AgentError::Config(
                "storage.cleanup_threshold_gb must be > 0 and <= max_size_gb".into(),
            ));
        }
        Ok(())
    }

    /// Configuration view with every credential replaced by `***` and URL
    /// passwords elided. This is the only shape `/api/config` may return.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(server) = value.get_mut("server") {
            if let Some(tok) = server.get_mut("auth_token") {
                if tok.as_str().is_some_and(|s| !s.is_empty()) {
                    *tok = serde_json::Value::String("***".into());
                }
            }
        }
        if let Some(fleet) = value.get_mut("fleet") {
            if fleet.get("token").is_some_and(|t| !t.is_null()) {
                fleet["token"] = serde_json::Value::String("***".into());
            }
        }
        if let Some(cams) = value.get_mut("cameras").and_then(|c| c.as_array_mut()) {
            for cam in cams {
                if let Some(pw) = cam.get_mut("password") {
                    if pw.as_str().is_some_and(|s| !s.is_empty()) {
                        *pw = serde_json::Value::String("***".into());
                    }
                }
                if let Some(url) = cam.get_mut("stream_url") {
                    if let Some(s) = url.as_str() {
                        *url = serde_json::Value::String(redact_url_credentials(s));
                    }
                }
            }
        }
        value
    }
}

/// Expand `${NAME}` and `${NAME:-default}` references against the process
/// environment. Unknown variables without a default are left untouched.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let expr = &after[..end];
                let (name, default) = match expr.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (expr, None),
                };
                match std::env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => match default {
                        Some(d) => out.push_str(d),
                        // Keep the reference verbatim so the problem is visible downstream.
                        None => {
                            out.push_str("${");
                            out.push_str(expr);
                            out.push('}');
                        }
                    },
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Outcome of applying a reloaded configuration.
#[derive(Debug, Default)]
pub struct ReloadOutcome {
    /// Dotted paths applied live.
    pub applied: Vec<String>,
    /// Dotted paths that changed but require a restart.
    pub requires_restart: Vec<String>,
}

/// Apply the allow-listed subset of a freshly parsed config onto the running
/// one. Everything else is reported as requiring a restart and left alone.
pub fn apply_reload(current: &mut NodeConfig, fresh: &NodeConfig) -> ReloadOutcome {
    let mut outcome = ReloadOutcome::default();

    if current.logging.level != fresh.logging.level {
        current.logging.level = fresh.logging.level.clone();
        outcome.applied.push("logging.level".into());
    }
    if current.monitoring != fresh.monitoring {
        current.monitoring = fresh.monitoring.clone();
        outcome.applied.push("monitoring".into());
    }
    if current.server.url != fresh.server.url {
        current.server.url = fresh.server.url.clone();
        outcome.applied.push("server.url".into());
    }
    if current.server.auth_token != fresh.server.auth_token {
        current.server.auth_token = fresh.server.auth_token.clone();
        outcome.applied.push("server.auth_token".into());
    }
    if current.server.timeout != fresh.server.timeout {
        current.server.timeout = fresh.server.timeout;
        outcome.applied.push("server.timeout".into());
    }
    if current.server.ssl_verify != fresh.server.ssl_verify {
        current.server.ssl_verify = fresh.server.ssl_verify;
        outcome.applied.push("server.ssl_verify".into());
    }
    if current.advanced.polling_interval != fresh.advanced.polling_interval {
        current.advanced.polling_interval = fresh.advanced.polling_interval;
        outcome.applied.push("advanced.polling_interval".into());
    }
    if current.advanced.reconnect_delay != fresh.advanced.reconnect_delay {
        current.advanced.reconnect_delay = fresh.advanced.reconnect_delay;
        outcome.applied.push("advanced.reconnect_delay".into());
    }
    if current.advanced.reconnect_attempts != fresh.advanced.reconnect_attempts {
        current.advanced.reconnect_attempts = fresh.advanced.reconnect_attempts;
        outcome.applied.push("advanced.reconnect_attempts".into());
    }

    let cur_cams = serde_json::to_value(&current.cameras).unwrap_or_default();
    let new_cams = serde_json::to_value(&fresh.cameras).unwrap_or_default();
    if cur_cams != new_cams {
        outcome.requires_restart.push("cameras".into());
    }
    if current.storage.base_path != fresh.storage.base_path {
        outcome.requires_restart.push("storage.base_path".into());
    }
    let cur_net = serde_json::to_value(&current.network).unwrap_or_default();
    let new_net = serde_json::to_value(&fresh.network).unwrap_or_default();
    if cur_net != new_net {
        outcome.requires_restart.push("network".into());
    }
    let cur_dev = serde_json::to_value(&current.device).unwrap_or_default();
    let new_dev = serde_json::to_value(&fresh.device).unwrap_or_default();
    if cur_dev != new_dev {
        outcome.requires_restart.push("device".into());
    }

    outcome
}

// ──────────────── on-disk YAML edits ───────────────────────────────────────
//
// The portal writes a handful of fields back to the config file (camera
// position, logging level, fleet-allowed keys). Edits go through the parsed
// Value tree and an atomic rename so concurrent readers never see a torn file.

fn load_yaml_tree(path: &Path) -> Result<serde_yaml::Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("Cannot read config file: {e}")))?;
    serde_yaml::from_str(&content)
        .map_err(|e| AgentError::Config(format!("Invalid YAML: {e}")))
}

fn write_yaml_tree(path: &Path, tree: &serde_yaml::Value) -> Result<()> {
    use std::io::Write;

    let text = serde_yaml::to_string(tree)
        .map_err(|e| AgentError::Config(format!("Cannot serialize config: {e}")))?;
    let tmp = path.with_extension("yaml.tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Rewrite one camera's `position` field in the YAML file.
pub fn write_camera_position(path: &Path, camera_id: &str, position: &str) -> Result<()> {
    let mut tree = load_yaml_tree(path)?;
    let cams = tree
        .get_mut("cameras")
        .and_then(|c| c.as_sequence_mut())
        .ok_or_else(|| AgentError::Config("No cameras section in config".into()))?;
    let cam = cams
        .iter_mut()
        .find(|c| c.get("id").and_then(|i| i.as_str()) == Some(camera_id))
        .ok_or_else(|| AgentError::CameraNotFound { id: camera_id.to_string() })?;
    cam.as_mapping_mut()
        .ok_or_else(|| AgentError::Config("Camera entry is not a mapping".into()))?
        .insert("position".into(), serde_yaml::Value::String(position.to_string()));
    write_yaml_tree(path, &tree)
}

/// Rewrite `logging.level` in the YAML file.
pub fn write_log_level(path: &Path, level: &str) -> Result<()> {
    write_dotted_key(path, "logging.level", serde_yaml::Value::String(level.to_string()))
}

/// Set a dotted key (`section.field...`) in the YAML file, creating
/// intermediate mappings as needed.
pub fn write_dotted_key(path: &Path, key: &str, value: serde_yaml::Value) -> Result<()> {
    let mut tree = load_yaml_tree(path)?;
    let mut node = &mut tree;
    let mut value = Some(value);
    let parts: Vec<&str> = key.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| AgentError::Config(format!("'{key}' does not address a mapping")))?;
        let entry_key = serde_yaml::Value::String(part.to_string());
        if i == parts.len() - 1 {
            map.insert(entry_key, value.take().unwrap_or(serde_yaml::Value::Null));
            break;
        }
        node = map
            .entry(entry_key)
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    }
    write_yaml_tree(path, &tree)
}
