// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! In-process health bus.
//!
//! The bus is owned by the supervisor and shared (via `Arc`) with the IPC
//! socket, the portal and the monitor loop. It aggregates per-camera tracker
//! state, the failed-camera map, task liveness flags, coarse health counters
//! and the latest system sample into an on-demand [`HealthSnapshot`].

pub mod monitor;
pub mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;
use crate::state::{CameraStateTracker, TrackerStatus};

/// Latest system resource sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_percent: f32,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub uptime: u64,
}

/// A camera that failed to initialize and is waiting for the retry loop.
#[derive(Debug, Clone)]
pub struct FailedCamera {
    pub config: CameraConfig,
    pub attempts: u32,
    pub next_retry: Instant,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCameraStatus {
    pub camera_id: String,
    pub camera_type: String,
    pub attempts: u32,
    pub next_retry_seconds: f64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadLiveness {
    pub camera_id: String,
    pub alive: bool,
}

/// Full health document served over IPC and projected by the portal.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub system: SystemSample,
    pub cameras: Vec<TrackerStatus>,
    pub failed_cameras: Vec<FailedCameraStatus>,
    pub threads: Vec<ThreadLiveness>,
    pub checks_performed: u64,
    pub warning_count: u64,
    pub error_count: u64,
}

pub struct HealthBus {
    started: Instant,
    trackers: Mutex<HashMap<String, Arc<CameraStateTracker>>>,
    liveness: Mutex<HashMap<String, Arc<AtomicBool>>>,
    failed: Mutex<HashMap<String, FailedCamera>>,
    system: Mutex<SystemSample>,
    checks: AtomicU64,
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl HealthBus {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            trackers: Mutex::new(HashMap::new()),
            liveness: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            system: Mutex::new(SystemSample::default()),
            checks: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn register_camera(
        &self,
        camera_id: &str,
        tracker: Arc<CameraStateTracker>,
        alive: Arc<AtomicBool>,
    ) {
        self.trackers.lock().insert(camera_id.to_string(), tracker);
        self.liveness.lock().insert(camera_id.to_string(), alive);
    }

    pub fn unregister_camera(&self, camera_id: &str) {
        self.trackers.lock().remove(camera_id);
        self.liveness.lock().remove(camera_id);
    }

    pub fn tracker(&self, camera_id: &str) -> Option<Arc<CameraStateTracker>> {
        self.trackers.lock().get(camera_id).cloned()
    }

    pub fn camera_statuses(&self) -> Vec<TrackerStatus> {
        let mut statuses: Vec<TrackerStatus> =
            self.trackers.lock().values().map(|t| t.status()).collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    // ── failed-camera map (mutated only by the supervisor) ────────────────

    pub fn set_failed(&self, camera: FailedCamera) {
        self.failed.lock().insert(camera.config.id.clone(), camera);
    }

    pub fn take_failed(&self, camera_id: &str) -> Option<FailedCamera> {
        self.failed.lock().remove(camera_id)
    }

    pub fn failed_contains(&self, camera_id: &str) -> bool {
        self.failed.lock().contains_key(camera_id)
    }

    /// Reset a failed camera so the retry loop picks it up on its next tick.
    pub fn reset_failed_backoff(&self, camera_id: &str, now: Instant) -> bool {
        let mut failed = self.failed.lock();
        match failed.get_mut(camera_id) {
            Some(entry) => {
                entry.attempts = 0;
                entry.next_retry = now;
                true
            }
            None => false,
        }
    }

    /// Failed cameras due for a retry at `now`.
    pub fn due_failed(&self, now: Instant) -> Vec<FailedCamera> {
        self.failed
            .lock()
            .values()
            .filter(|f| now >= f.next_retry)
            .cloned()
            .collect()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.failed.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn failed_statuses(&self) -> Vec<FailedCameraStatus> {
        let now = Instant::now();
        let mut statuses: Vec<FailedCameraStatus> = self
            .failed
            .lock()
            .values()
            .map(|f| FailedCameraStatus {
                camera_id: f.config.id.clone(),
                camera_type: f.config.kind.name().to_string(),
                attempts: f.attempts,
                next_retry_seconds: f.next_retry.saturating_duration_since(now).as_secs_f64(),
                error: f.last_error.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    // ── counters & system sample ──────────────────────────────────────────

    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.checks.load(Ordering::Relaxed),
            self.warnings.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }

    pub fn set_system(&self, sample: SystemSample) {
        *self.system.lock() = sample;
    }

    pub fn system(&self) -> SystemSample {
        self.system.lock().clone()
    }

    /// Assemble a fresh snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        let threads: Vec<ThreadLiveness> = {
            let mut threads: Vec<ThreadLiveness> = self
                .liveness
                .lock()
                .iter()
                .map(|(id, alive)| ThreadLiveness {
                    camera_id: id.clone(),
                    alive: alive.load(Ordering::Relaxed),
                })
                .collect();
            threads.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
            threads
        };
        let (checks, warnings, errors) = self.counters();
        let mut system = self.system();
        system.uptime = self.uptime_seconds();
        HealthSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            version: crate::VERSION.to_string(),
            uptime_seconds: self.uptime_seconds(),
            system,
            cameras: self.camera_statuses(),
            failed_cameras: self.failed_statuses(),
            threads,
            checks_performed: checks,
            warning_count: warnings,
            error_count: errors,
        }
    }
}

impl Default for HealthBus {
    fn default() -> Self {
        Self::new()
    }
}
