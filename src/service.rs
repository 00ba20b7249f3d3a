// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Capture service supervisor.
//!
//! Owns the camera set, the failed-camera retry queue, the upload worker, the
//! health bus, the IPC socket, the portal and signal handling. Control flow
//! (signals, IPC commands, HTTP commands) fans into one actor loop; no
//! failure in a single camera, the upload worker or the portal may kill the
//! process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotate::Annotator;
use crate::camera::{create_camera, CameraAdapter};
use crate::config::{apply_reload, CameraConfig, NodeConfig};
use crate::error::{AgentError, Result};
use crate::health::monitor::HealthMonitor;
use crate::health::socket::HealthSocket;
use crate::health::{FailedCamera, HealthBus};
use crate::instance::CameraInstance;
use crate::portal;
use crate::state::{CameraStateTracker, MAX_BACKOFF_MULTIPLIER};
use crate::storage::StorageManager;
use crate::upload::{upload_channel, UploadItem, Uploader};
use crate::util::clock::{system_clock, SharedClock};
use crate::util::ratelimit::RateLimiter;

const RETRY_TICK: Duration = Duration::from_secs(10);
const RETRY_STATUS_INTERVAL: Duration = Duration::from_secs(300);
const CAMERA_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Applies a new log level to the live subscriber.
pub type LogLevelSetter = Arc<dyn Fn(&str) + Send + Sync>;

/// Commands accepted by the supervisor actor loop.
pub enum ControlCommand {
    ForceCapture {
        camera_id: String,
        reply: oneshot::Sender<bool>,
    },
    RestartCamera {
        camera_id: String,
        reply: oneshot::Sender<RestartOutcome>,
    },
    /// Re-read the config file and apply the allow-listed subset.
    Reload,
    /// Schedule a whole-service restart (resource thresholds, fleet command).
    RestartService,
}

#[derive(Debug)]
pub enum RestartOutcome {
    Restarted,
    RetryQueued,
    RestartFailed(String),
    NotFound,
}

struct CameraHandle {
    config: CameraConfig,
    force: Arc<AtomicBool>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct CaptureService {
    config_path: PathBuf,
    config: Arc<std::sync::RwLock<NodeConfig>>,
    clock: SharedClock,
    storage: Arc<StorageManager>,
    bus: Arc<HealthBus>,
    annotator: Arc<Annotator>,
    cameras: HashMap<String, CameraHandle>,
    upload_tx: mpsc::Sender<UploadItem>,
    upload_rx: Option<mpsc::Receiver<UploadItem>>,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: mpsc::Receiver<ControlCommand>,
    token: CancellationToken,
    upload_enabled: bool,
    log_setter: LogLevelSetter,
    retry_limiter: RateLimiter,
}

impl CaptureService {
    pub fn new(
        config: NodeConfig,
        config_path: PathBuf,
        upload_enabled: bool,
        log_setter: LogLevelSetter,
    ) -> Result<Self> {
        if config.advanced.ffmpeg_debug && std::env::var_os("GST_DEBUG").is_none() {
            std::env::set_var("GST_DEBUG", "3");
        }
        let storage = Arc::new(StorageManager::new(&config.storage)?);
        let clock = system_clock();
        let (upload_tx, upload_rx) = upload_channel();
        let (control_tx, control_rx) = mpsc::channel(32);
        Ok(Self {
            config_path,
            config: Arc::new(std::sync::RwLock::new(config)),
            annotator: Arc::new(Annotator::new(clock.clone())),
            retry_limiter: RateLimiter::new(clock.clone(), RETRY_STATUS_INTERVAL),
            clock,
            storage,
            bus: Arc::new(HealthBus::new()),
            cameras: HashMap::new(),
            upload_tx,
            upload_rx: Some(upload_rx),
            control_tx,
            control_rx,
            token: CancellationToken::new(),
            upload_enabled,
            log_setter,
        })
    }

    pub fn control_sender(&self) -> mpsc::Sender<ControlCommand> {
        self.control_tx.clone()
    }

    fn config_snapshot(&self) -> Result<NodeConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| AgentError::Config("config lock poisoned".into()))
    }

    /// Unified camera bring-up used by startup, the retry loop and the
    /// restart command.
    async fn try_initialize_camera(
        &self,
        config: &CameraConfig,
        is_retry: bool,
    ) -> Result<Box<dyn CameraAdapter>> {
        let advanced = self.config_snapshot()?.advanced;
        let mut adapter = create_camera(config, &advanced);
        debug!(camera = %config.id, kind = config.kind.name(), is_retry, "Initializing camera");
        adapter.setup().await?;
        Ok(adapter)
    }

    fn spawn_camera(&mut self, config: CameraConfig, adapter: Box<dyn CameraAdapter>) {
        let tracker = Arc::new(CameraStateTracker::new(
            config.id.clone(),
            Duration::from_secs(config.capture_interval),
            self.clock.clone(),
        ));
        let force = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        self.bus
            .register_camera(&config.id, tracker.clone(), alive.clone());

        let device = match self.config_snapshot() {
            Ok(cfg) => cfg.device,
            Err(_) => return,
        };
        let instance = CameraInstance::new(
            config.clone(),
            device,
            adapter,
            tracker,
            force.clone(),
            alive,
            self.clock.clone(),
            self.config.clone(),
            self.storage.clone(),
            self.upload_tx.clone(),
            self.annotator.clone(),
            self.bus.clone(),
        );
        let child = self.token.child_token();
        let task = tokio::spawn(instance.run(child.clone()));
        info!(camera = %config.id, "Started capture task");
        self.cameras.insert(
            config.id.clone(),
            CameraHandle { config, force, token: child, task },
        );
    }

    fn failed_retry_delay(config: &CameraConfig, attempts: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempts.saturating_sub(1)).min(MAX_BACKOFF_MULTIPLIER);
        Duration::from_secs(config.capture_interval) * exp
    }

    fn queue_failed(&self, config: CameraConfig, attempts: u32, error: String) {
        let delay = Self::failed_retry_delay(&config, attempts);
        warn!(
            camera = %config.id,
            attempts,
            retry_secs = delay.as_secs(),
            error = %error,
            "Camera initialization failed, queued for retry"
        );
        self.bus.set_failed(FailedCamera {
            next_retry: Instant::now() + delay,
            config,
            attempts,
            last_error: error,
        });
    }

    /// Build every configured camera. Failures become failed-map entries with
    /// `attempts = 1` and a scheduled retry.
    pub async fn initialize_cameras(&mut self) -> Result<()> {
        let cameras = self.config_snapshot()?.cameras;
        info!(count = cameras.len(), "Initializing cameras");
        for cam_cfg in cameras {
            match self.try_initialize_camera(&cam_cfg, false).await {
                Ok(adapter) => self.spawn_camera(cam_cfg, adapter),
                Err(e) => self.queue_failed(cam_cfg, 1, e.to_string()),
            }
        }
        info!(
            initialized = self.cameras.len(),
            failed = self.bus.failed_ids().len(),
            "Camera initialization complete"
        );
        Ok(())
    }

    /// Initialize every camera once, release the handles and report; used by
    /// `--dry-run`.
    pub async fn dry_run(&self) {
        let cameras = match self.config_snapshot() {
            Ok(cfg) => cfg.cameras,
            Err(e) => {
                error!(error = %e, "Dry run aborted");
                return;
            }
        };
        for cam_cfg in cameras {
            match self.try_initialize_camera(&cam_cfg, false).await {
                Ok(mut adapter) => {
                    info!(camera = %cam_cfg.id, "Dry run: camera initialized");
                    adapter.cleanup();
                }
                Err(e) => {
                    warn!(camera = %cam_cfg.id, error = %e, "Dry run: camera failed");
                }
            }
        }
    }

    /// Tear everything down in an orderly fashion before exit.
    async fn shutdown(&mut self) {
        info!("Shutting down");
        self.token.cancel();
        for (id, handle) in self.cameras.drain() {
            handle.token.cancel();
            if tokio::time::timeout(CAMERA_STOP_TIMEOUT, handle.task).await.is_err() {
                warn!(camera = %id, "Capture task did not stop in time");
            } else {
                info!(camera = %id, "Stopped camera");
            }
            self.bus.unregister_camera(&id);
        }
        info!("Service stopped");
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::ForceCapture { camera_id, reply } => {
                let found = match self.cameras.get(&camera_id) {
                    Some(handle) => {
                        handle.force.store(true, Ordering::SeqCst);
                        info!(camera = %camera_id, "Force capture requested");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            ControlCommand::RestartCamera { camera_id, reply } => {
                let outcome = self.restart_camera(&camera_id).await;
                let _ = reply.send(outcome);
            }
            ControlCommand::Reload => self.reload_config(),
            ControlCommand::RestartService => {
                if let Err(e) = schedule_service_restart().await {
                    error!(error = %e, "Could not schedule service restart");
                }
            }
        }
    }

    /// Restart a running camera, or reset a failed one so the retry loop
    /// picks it up on its next tick.
    async fn restart_camera(&mut self, camera_id: &str) -> RestartOutcome {
        if let Some(handle) = self.cameras.remove(camera_id) {
            info!(camera = %camera_id, "Restarting camera");
            handle.token.cancel();
            if tokio::time::timeout(CAMERA_STOP_TIMEOUT, handle.task).await.is_err() {
                warn!(camera = %camera_id, "Old capture task did not stop in time");
            }
            self.bus.unregister_camera(camera_id);

            match self.try_initialize_camera(&handle.config, true).await {
                Ok(adapter) => {
                    self.spawn_camera(handle.config, adapter);
                    RestartOutcome::Restarted
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.queue_failed(handle.config, 1, reason.clone());
                    RestartOutcome::RestartFailed(reason)
                }
            }
        } else if self.bus.reset_failed_backoff(camera_id, Instant::now()) {
            info!(camera = %camera_id, "Failed camera reset, retry loop will pick it up");
            RestartOutcome::RetryQueued
        } else {
            RestartOutcome::NotFound
        }
    }

    /// One pass of the failed-camera retry loop.
    async fn retry_failed_cameras(&mut self) {
        for failed in self.bus.due_failed(Instant::now()) {
            let id = failed.config.id.clone();
            match self.try_initialize_camera(&failed.config, true).await {
                Ok(adapter) => {
                    self.bus.take_failed(&id);
                    info!(camera = %id, attempts = failed.attempts, "Failed camera recovered");
                    self.spawn_camera(failed.config, adapter);
                }
                Err(e) => {
                    let attempts = failed.attempts + 1;
                    let delay = Self::failed_retry_delay(&failed.config, attempts);
                    debug!(
                        camera = %id,
                        attempts,
                        retry_secs = delay.as_secs(),
                        error = %e,
                        "Retry failed"
                    );
                    self.bus.set_failed(FailedCamera {
                        next_retry: Instant::now() + delay,
                        config: failed.config,
                        attempts,
                        last_error: e.to_string(),
                    });
                }
            }
        }

        let failing = self.bus.failed_ids();
        if !failing.is_empty() {
            if let Some(suppressed) = self.retry_limiter.check("failed_cameras", None) {
                info!(
                    cameras = failing.join(", "),
                    "{}",
                    RateLimiter::format("Cameras still failing initialization", suppressed)
                );
            }
        }
    }

    /// Re-read the config file and apply only the allow-listed subset live.
    fn reload_config(&mut self) {
        info!(path = %self.config_path.display(), "Reload signal received, re-reading config");
        let fresh = match NodeConfig::from_file(&self.config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "Reload failed, keeping running configuration");
                return;
            }
        };
        let outcome = match self.config.write() {
            Ok(mut current) => apply_reload(&mut current, &fresh),
            Err(_) => {
                error!("Config lock poisoned, reload skipped");
                return;
            }
        };
        for path in &outcome.applied {
            info!(setting = %path, "Applied live");
            if path == "logging.level" {
                (self.log_setter)(&fresh.logging.level);
            }
        }
        for path in &outcome.requires_restart {
            warn!(setting = %path, "Changed in file but requires a service restart");
        }
        if outcome.applied.is_empty() && outcome.requires_restart.is_empty() {
            info!("Config unchanged");
        }
    }

    /// Run the supervisor until a termination signal arrives.
    pub async fn run(mut self) -> Result<()> {
        let config = self.config_snapshot()?;

        // IPC socket.
        let socket_path = config.runtime_dir.join("health.sock");
        let health_socket =
            HealthSocket::new(socket_path.clone(), self.bus.clone(), self.control_tx.clone());
        let listener = health_socket.bind()?;
        let socket_task = tokio::spawn(health_socket.run(listener, self.token.clone()));

        // Upload worker.
        let uploader = Uploader::new(self.storage.clone(), self.config.clone(), self.upload_enabled);
        let upload_rx = self
            .upload_rx
            .take()
            .ok_or_else(|| AgentError::Config("service already running".into()))?;
        let upload_task = tokio::spawn(uploader.run(upload_rx, self.token.clone()));

        // Health monitor.
        let monitor =
            HealthMonitor::new(self.bus.clone(), self.config.clone(), self.control_tx.clone());
        let monitor_task = tokio::spawn(monitor.run(self.token.clone()));

        // Storage cleanup loop.
        let storage = self.storage.clone();
        let storage_token = self.token.clone();
        let cleanup_task = tokio::spawn(async move { storage.run_periodic(storage_token).await });

        // Control portal.
        let portal_task = if config.portal.enabled {
            let state = portal::AppState::new(
                self.config.clone(),
                self.config_path.clone(),
                self.bus.clone(),
                self.storage.clone(),
                self.control_tx.clone(),
                socket_path.clone(),
                self.token.clone(),
            );
            let token = self.token.clone();
            Some(tokio::spawn(async move {
                portal::start_server(Arc::new(state), token).await;
            }))
        } else {
            None
        };

        // systemd watchdog.
        let watchdog_task = spawn_watchdog(self.token.clone());

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| AgentError::Config(format!("Cannot install SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| AgentError::Config(format!("Cannot install SIGINT handler: {e}")))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| AgentError::Config(format!("Cannot install SIGHUP handler: {e}")))?;

        let mut retry_tick = tokio::time::interval(RETRY_TICK);
        retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(version = crate::VERSION, "Capture service running");
        loop {
            tokio::select! {
                command = self.control_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                _ = retry_tick.tick() => self.retry_failed_cameras().await,
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    break;
                }
                _ = sighup.recv() => self.reload_config(),
            }
        }

        self.shutdown().await;
        for task in [Some(socket_task), Some(upload_task), Some(monitor_task), Some(cleanup_task), portal_task, watchdog_task]
            .into_iter()
            .flatten()
        {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        Ok(())
    }
}

// ──────────────── OS-level operations ──────────────────────────────────────

/// Schedule a service restart a couple of seconds out so in-flight HTTP
/// responses can complete before systemd recycles us.
pub async fn schedule_service_restart() -> Result<()> {
    info!("Scheduling service restart");
    run_privileged(&[
        "systemd-run",
        "--on-active=2",
        "--unit=sai-cam-restart",
        "systemctl",
        "restart",
        "sai-cam.service",
    ])
    .await
}

/// Schedule a host reboot with a one-minute delay.
pub async fn schedule_reboot() -> Result<()> {
    warn!("Scheduling host reboot in 1 minute");
    run_privileged(&["shutdown", "-r", "+1"]).await
}

async fn run_privileged(argv: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .await
        .map_err(|e| AgentError::Config(format!("Cannot run {}: {e}", argv[0])))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentError::Config(format!(
            "{} failed: {}",
            argv[0],
            stderr.trim()
        )));
    }
    Ok(())
}

// ──────────────── systemd watchdog ─────────────────────────────────────────

/// Notify liveness at half the platform-provided timeout, when enabled.
fn spawn_watchdog(token: CancellationToken) -> Option<JoinHandle<()>> {
    let usec: u64 = std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if usec == 0 {
        info!("Watchdog not enabled");
        // READY still matters for Type=notify units without a watchdog.
        tokio::spawn(async { sd_notify("READY=1").await });
        return None;
    }
    info!(timeout_secs = usec as f64 / 1_000_000.0, "Watchdog enabled");
    Some(tokio::spawn(async move {
        sd_notify("READY=1").await;
        let period = Duration::from_micros(usec / 2);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => sd_notify("WATCHDOG=1").await,
            }
        }
    }))
}

/// Minimal sd_notify: one datagram to `$NOTIFY_SOCKET`.
async fn sd_notify(message: &str) {
    let Ok(path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    if path.starts_with('@') {
        // Abstract-namespace sockets are not used by our unit files.
        debug!("Abstract NOTIFY_SOCKET unsupported, skipping notification");
        return;
    }
    match tokio::net::UnixDatagram::unbound() {
        Ok(sock) => {
            if let Err(e) = sock.send_to(message.as_bytes(), &path).await {
                debug!(error = %e, "sd_notify send failed");
            }
        }
        Err(e) => debug!(error = %e, "sd_notify socket failed"),
    }
}
