// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Health socket tests: one JSON envelope per connection, command dispatch.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sai_cam::health::socket::{send_command, HealthSocket};
use sai_cam::health::HealthBus;
use sai_cam::service::{ControlCommand, RestartOutcome};
use sai_cam::state::CameraStateTracker;
use sai_cam::util::clock::system_clock;

struct Fixture {
    _dir: TempDir,
    socket_path: std::path::PathBuf,
    token: CancellationToken,
}

/// Start a socket backed by a stub supervisor that knows one camera, "cam1".
async fn start_socket() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let socket_path = dir.path().join("health.sock");

    let bus = Arc::new(HealthBus::new());
    let tracker = Arc::new(CameraStateTracker::new(
        "cam1",
        Duration::from_secs(60),
        system_clock(),
    ));
    bus.register_camera("cam1", tracker, Arc::new(AtomicBool::new(true)));

    let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(8);
    tokio::spawn(async move {
        while let Some(cmd) = control_rx.recv().await {
            match cmd {
                ControlCommand::ForceCapture { camera_id, reply } => {
                    let _ = reply.send(camera_id == "cam1");
                }
                ControlCommand::RestartCamera { camera_id, reply } => {
                    let outcome = if camera_id == "cam1" {
                        RestartOutcome::Restarted
                    } else {
                        RestartOutcome::NotFound
                    };
                    let _ = reply.send(outcome);
                }
                _ => {}
            }
        }
    });

    let socket = HealthSocket::new(socket_path.clone(), bus, control_tx);
    let listener = socket.bind().expect("bind socket");
    let token = CancellationToken::new();
    tokio::spawn(socket.run(listener, token.clone()));

    Fixture { _dir: dir, socket_path, token }
}

#[tokio::test]
async fn test_health_action_returns_snapshot() {
    let fx = start_socket().await;
    let response = send_command(&fx.socket_path, &json!({"action": "health"}))
        .await
        .expect("health");
    assert_eq!(response["version"], sai_cam::VERSION);
    assert_eq!(response["cameras"][0]["camera_id"], "cam1");
    assert_eq!(response["cameras"][0]["state"], "healthy");
    assert_eq!(response["threads"][0]["alive"], true);
    fx.token.cancel();
}

#[tokio::test]
async fn test_force_capture_known_and_unknown() {
    let fx = start_socket().await;
    let ok = send_command(
        &fx.socket_path,
        &json!({"action": "force_capture", "camera_id": "cam1"}),
    )
    .await
    .expect("force");
    assert_eq!(ok["ok"], true);

    let missing = send_command(
        &fx.socket_path,
        &json!({"action": "force_capture", "camera_id": "nope"}),
    )
    .await
    .expect("force missing");
    assert_eq!(missing["error"], "not found");
    fx.token.cancel();
}

#[tokio::test]
async fn test_restart_camera_outcomes() {
    let fx = start_socket().await;
    let ok = send_command(
        &fx.socket_path,
        &json!({"action": "restart_camera", "camera_id": "cam1"}),
    )
    .await
    .expect("restart");
    assert_eq!(ok["ok"], true);
    assert_eq!(ok["action"], "restarted");

    let missing = send_command(
        &fx.socket_path,
        &json!({"action": "restart_camera", "camera_id": "nope"}),
    )
    .await
    .expect("restart missing");
    assert_eq!(missing["error"], "not found");
    fx.token.cancel();
}

#[tokio::test]
async fn test_unknown_action() {
    let fx = start_socket().await;
    let response = send_command(&fx.socket_path, &json!({"action": "dance"}))
        .await
        .expect("unknown");
    assert_eq!(response["error"], "unknown action");
    fx.token.cancel();
}

#[tokio::test]
async fn test_socket_file_removed_on_shutdown() {
    let fx = start_socket().await;
    assert!(fx.socket_path.exists());
    fx.token.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fx.socket_path.exists());
}
