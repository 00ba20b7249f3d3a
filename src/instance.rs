// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-camera capture loop.
//!
//! Each instance owns exactly one adapter and one state tracker and runs a
//! single cooperative loop: wait out backoff, honor the capture cadence (or a
//! force-capture signal), capture, validate, annotate, enrich, store, enqueue
//! for upload. Failures are folded into the tracker, which decides when a
//! reconnect may be attempted.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotate::Annotator;
use crate::camera::{validate_frame, CameraAdapter};
use crate::config::{CameraConfig, DeviceConfig, NodeConfig};
use crate::health::HealthBus;
use crate::metadata::ImageMetadata;
use crate::state::CameraStateTracker;
use crate::storage::StorageManager;
use crate::upload::UploadItem;
use crate::util::clock::SharedClock;

const JPEG_QUALITY: u8 = 90;
/// Upper bound on the post-failure sleep so stop requests are seen promptly.
const MAX_FAILURE_SLEEP: Duration = Duration::from_secs(10);
const MIN_FAILURE_SLEEP: Duration = Duration::from_secs(1);

pub struct CameraInstance {
    config: CameraConfig,
    device: DeviceConfig,
    adapter: Box<dyn CameraAdapter>,
    tracker: Arc<CameraStateTracker>,
    force_capture: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    clock: SharedClock,
    live_config: Arc<std::sync::RwLock<NodeConfig>>,
    storage: Arc<StorageManager>,
    upload_tx: mpsc::Sender<UploadItem>,
    annotator: Arc<Annotator>,
    bus: Arc<HealthBus>,
}

impl CameraInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CameraConfig,
        device: DeviceConfig,
        adapter: Box<dyn CameraAdapter>,
        tracker: Arc<CameraStateTracker>,
        force_capture: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
        clock: SharedClock,
        live_config: Arc<std::sync::RwLock<NodeConfig>>,
        storage: Arc<StorageManager>,
        upload_tx: mpsc::Sender<UploadItem>,
        annotator: Arc<Annotator>,
        bus: Arc<HealthBus>,
    ) -> Self {
        Self {
            config,
            device,
            adapter,
            tracker,
            force_capture,
            alive,
            clock,
            live_config,
            storage,
            upload_tx,
            annotator,
            bus,
        }
    }

    fn polling_interval(&self) -> Duration {
        let secs = self
            .live_config
            .read()
            .map(|c| c.advanced.polling_interval)
            .unwrap_or(0.1);
        Duration::from_secs_f64(secs.max(0.01))
    }

    /// Run until cancelled. Consumes the instance; the supervisor keeps the
    /// tracker, force flag and liveness flag through shared handles.
    pub async fn run(mut self, token: CancellationToken) {
        let camera_id = self.config.id.clone();
        let interval = Duration::from_secs(self.config.capture_interval);
        self.alive.store(true, Ordering::Relaxed);
        info!(camera = %camera_id, interval_secs = interval.as_secs(), "Capture loop started");

        // First capture fires immediately.
        let mut last_capture: Option<Instant> = None;

        while !token.is_cancelled() {
            if !self.tracker.should_attempt_capture() {
                if self.adapter.is_buffered() {
                    self.adapter.grab_frame();
                }
                sleep_or_cancel(&token, self.polling_interval()).await;
                continue;
            }

            let forced = self.force_capture.swap(false, Ordering::SeqCst);
            if forced {
                debug!(camera = %camera_id, "Force-capture signal received");
            } else if let Some(last) = last_capture {
                if self.clock.now().duration_since(last) < interval {
                    if self.adapter.is_buffered() {
                        self.adapter.grab_frame();
                    }
                    sleep_or_cancel(&token, self.polling_interval()).await;
                    continue;
                }
            }

            match self.adapter.capture_frame().await {
                Ok(frame) if validate_frame(&camera_id, &frame) => {
                    self.handle_capture(frame).await;
                    last_capture = Some(self.clock.now());
                }
                Ok(_) => self.handle_failure(&token, "invalid frame").await,
                Err(e) => self.handle_failure(&token, &e.to_string()).await,
            }
        }

        self.adapter.cleanup();
        self.alive.store(false, Ordering::Relaxed);
        info!(camera = %camera_id, "Capture loop stopped");
    }

    async fn handle_failure(&mut self, token: &CancellationToken, reason: &str) {
        let attempt_reconnect = self.tracker.record_failure(reason);
        if attempt_reconnect {
            if let Err(e) = self.adapter.reconnect().await {
                debug!(camera = %self.config.id, error = %e, "Reconnection failed");
            }
        }
        let sleep = self
            .tracker
            .time_until_next_attempt()
            .min(MAX_FAILURE_SLEEP)
            .max(MIN_FAILURE_SLEEP);
        sleep_or_cancel(token, sleep).await;
    }

    async fn handle_capture(&mut self, mut frame: crate::camera::Frame) {
        self.tracker.record_success();

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        self.annotator.stamp(&mut frame.image, &self.config.id, &timestamp);

        let metadata = ImageMetadata::build(
            &timestamp,
            &self.device,
            &self.config,
            &frame,
            &self.bus.system(),
            self.bus.uptime_seconds(),
        );

        let mut jpeg = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), JPEG_QUALITY);
        if let Err(e) = encoder.encode_image(&frame.image) {
            error!(camera = %self.config.id, error = %e, "JPEG encoding failed, frame dropped");
            return;
        }

        let key = format!("{}_{}.jpg", self.config.id, timestamp);
        info!(
            camera = %self.config.id,
            key = %key,
            size_kb = format!("{:.1}", jpeg.len() as f64 / 1024.0),
            "Captured image"
        );

        let metadata_value = match serde_json::to_value(&metadata) {
            Ok(v) => v,
            Err(e) => {
                warn!(camera = %self.config.id, error = %e, "Metadata serialization failed");
                serde_json::Value::Null
            }
        };

        if let Err(e) = self.storage.store(&jpeg, &key, Some(&metadata)) {
            error!(camera = %self.config.id, key = %key, error = %e, "Store failed, image dropped");
            return;
        }

        let item = UploadItem {
            key: key.clone(),
            bytes: jpeg.into(),
            metadata: metadata_value,
            camera_id: self.config.id.clone(),
        };
        if self.upload_tx.try_send(item).is_err() {
            // Queue full or uploads disabled; the item stays pending on disk.
            debug!(camera = %self.config.id, key = %key, "Upload queue unavailable");
        }

        debug!(
            camera = %self.config.id,
            next_in_secs = self.config.capture_interval,
            "Next capture scheduled"
        );
    }
}

async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
