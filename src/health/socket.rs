// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Local IPC endpoint.
//!
//! A Unix stream socket at `<runtime_dir>/health.sock`, mode 0666 so the
//! portal process class can connect. Each connection carries exactly one JSON
//! command envelope and one JSON response:
//!
//! ```text
//! {"action":"health"}
//! {"action":"force_capture","camera_id":"cam1"}
//! {"action":"restart_camera","camera_id":"cam1"}
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::health::HealthBus;
use crate::service::{ControlCommand, RestartOutcome};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    action: String,
    #[serde(default)]
    camera_id: Option<String>,
}

pub struct HealthSocket {
    path: PathBuf,
    bus: Arc<HealthBus>,
    control: mpsc::Sender<ControlCommand>,
}

impl HealthSocket {
    pub fn new(path: PathBuf, bus: Arc<HealthBus>, control: mpsc::Sender<ControlCommand>) -> Self {
        Self { path, bus, control }
    }

    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Ipc(format!("Cannot create runtime dir: {e}")))?;
        }
        // A stale socket from an unclean shutdown blocks the bind.
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path)
            .map_err(|e| AgentError::Ipc(format!("Cannot bind {}: {e}", self.path.display())))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o666))
            .map_err(|e| AgentError::Ipc(format!("Cannot chmod socket: {e}")))?;
        info!(path = %self.path.display(), "Health socket listening");
        Ok(listener)
    }

    pub async fn run(self, listener: UnixListener, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let bus = self.bus.clone();
                            let control = self.control.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, bus, control).await {
                                    debug!(error = %e, "IPC connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "IPC accept failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(error = %e, "Could not remove health socket");
            }
        }
        info!("Health socket closed");
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    bus: Arc<HealthBus>,
    control: mpsc::Sender<ControlCommand>,
) -> Result<()> {
    let envelope = read_envelope(&mut stream).await?;
    let response = dispatch(envelope, &bus, &control).await;
    let body = serde_json::to_vec(&response)
        .map_err(|e| AgentError::Ipc(format!("Cannot serialize response: {e}")))?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one JSON envelope. Clients may half-close after sending, or keep the
/// connection open and just wait for the reply, so parsing is attempted after
/// every chunk.
async fn read_envelope(stream: &mut UnixStream) -> Result<CommandEnvelope> {
    let mut buf = Vec::with_capacity(256);
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| AgentError::Ipc("request read timed out".into()))??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(AgentError::Ipc("request too large".into()));
        }
        if let Ok(envelope) = serde_json::from_slice::<CommandEnvelope>(&buf) {
            return Ok(envelope);
        }
    }
    serde_json::from_slice(&buf).map_err(|e| AgentError::Ipc(format!("invalid request: {e}")))
}

async fn dispatch(
    envelope: CommandEnvelope,
    bus: &Arc<HealthBus>,
    control: &mpsc::Sender<ControlCommand>,
) -> serde_json::Value {
    match envelope.action.as_str() {
        "health" => serde_json::to_value(bus.snapshot()).unwrap_or_else(|_| json!({})),
        "force_capture" => {
            let Some(camera_id) = envelope.camera_id else {
                return json!({"error": "camera_id required"});
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = ControlCommand::ForceCapture { camera_id, reply: reply_tx };
            if control.send(cmd).await.is_err() {
                return json!({"error": "service shutting down"});
            }
            match reply_rx.await {
                Ok(true) => json!({"ok": true}),
                Ok(false) => json!({"error": "not found"}),
                Err(_) => json!({"error": "service shutting down"}),
            }
        }
        "restart_camera" => {
            let Some(camera_id) = envelope.camera_id else {
                return json!({"error": "camera_id required"});
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = ControlCommand::RestartCamera { camera_id, reply: reply_tx };
            if control.send(cmd).await.is_err() {
                return json!({"error": "service shutting down"});
            }
            match reply_rx.await {
                Ok(RestartOutcome::Restarted) => json!({"ok": true, "action": "restarted"}),
                Ok(RestartOutcome::RetryQueued) => json!({"ok": true, "action": "retry_queued"}),
                Ok(RestartOutcome::RestartFailed(reason)) => {
                    json!({"ok": false, "action": "restart_failed", "error": reason})
                }
                Ok(RestartOutcome::NotFound) => json!({"error": "not found"}),
                Err(_) => json!({"error": "service shutting down"}),
            }
        }
        _ => json!({"error": "unknown action"}),
    }
}

/// Client helper used by the portal: one request, one response.
pub async fn send_command(path: &Path, request: &serde_json::Value) -> Result<serde_json::Value> {
    let mut stream = UnixStream::connect(path)
        .await
        .map_err(|e| AgentError::Ipc(format!("Cannot connect to health socket: {e}")))?;
    let body = serde_json::to_vec(request)
        .map_err(|e| AgentError::Ipc(format!("Cannot serialize request: {e}")))?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .map_err(|_| AgentError::Ipc("response read timed out".into()))??;
    serde_json::from_slice(&response).map_err(|e| AgentError::Ipc(format!("invalid response: {e}")))
}
