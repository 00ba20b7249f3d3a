// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Direct-device adapter (v4l2).
//!
//! Pipeline: `v4l2src → videoconvert → videoscale → videorate → RGB appsink`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use serde_json::json;
use tracing::{debug, error, info};

use crate::camera::pipeline::FrameSource;
use crate::camera::{CameraAdapter, Frame};
use crate::config::{AdvancedConfig, CameraConfig, CameraKindConfig};
use crate::error::{AgentError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DirectCamera {
    config: CameraConfig,
    advanced: AdvancedConfig,
    source: Option<FrameSource>,
    connected: bool,
}

impl DirectCamera {
    pub fn new(config: CameraConfig, advanced: AdvancedConfig) -> Self {
        Self { config, advanced, source: None, connected: false }
    }

    /// Prefer `device_path` when it exists, then `device_index`, then the
    /// first video device.
    fn resolve_device(&self) -> PathBuf {
        if let CameraKindConfig::Direct { device_path, device_index, .. } = &self.config.kind {
            if let Some(path) = device_path {
                if path.exists() {
                    return path.clone();
                }
                debug!(
                    camera = %self.config.id,
                    path = %path.display(),
                    "Configured device path does not exist, falling back"
                );
            }
            if let Some(idx) = device_index {
                return PathBuf::from(format!("/dev/video{idx}"));
            }
        }
        PathBuf::from("/dev/video0")
    }

    fn pipeline_string(&self) -> String {
        let device = self.resolve_device();
        let [width, height] = self.config.resolution;
        let fps = self.config.fps;

        let mut controls = Vec::new();
        if let CameraKindConfig::Direct {
            brightness, contrast, saturation, auto_exposure, ..
        } = &self.config.kind
        {
            if let Some(b) = brightness {
                controls.push(format!("brightness={b}"));
            }
            if let Some(c) = contrast {
                controls.push(format!("contrast={c}"));
            }
            if let Some(s) = saturation {
                controls.push(format!("saturation={s}"));
            }
            if !auto_exposure {
                // 1 = manual exposure mode in the v4l2 control enum.
                controls.push("auto_exposure=1".to_string());
            }
        }
        let extra = if controls.is_empty() {
            String::new()
        } else {
            format!(" extra-controls=\"controls,{}\"", controls.join(","))
        };

        format!(
            "v4l2src device={device}{extra} ! videoconvert ! videoscale ! videorate ! \
             video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 ! \
             appsink name=sink max-buffers=1 drop=true sync=false",
            device = device.display(),
        )
    }
}

#[async_trait]
impl CameraAdapter for DirectCamera {
    async fn setup(&mut self) -> Result<()> {
        let device = self.resolve_device();
        info!(camera = %self.config.id, device = %device.display(), "Initializing direct camera");

        let mut source = FrameSource::open(&self.pipeline_string(), 1)?;
        tokio::time::sleep(Duration::from_secs(self.advanced.camera_init_wait)).await;

        // A device node can open while the sensor never delivers; require a
        // probe frame before declaring the camera up.
        match source.read_frame(PROBE_TIMEOUT).await {
            Some(frame) => {
                info!(
                    camera = %self.config.id,
                    width = frame.width,
                    height = frame.height,
                    fps = self.config.fps,
                    "Direct camera initialized"
                );
                self.source = Some(source);
                self.connected = true;
                Ok(())
            }
            None => {
                error!(camera = %self.config.id, "Device opened but probe frame failed");
                source.stop();
                self.connected = false;
                Err(AgentError::CameraConnection {
                    id: self.config.id.clone(),
                    reason: "probe frame failed".into(),
                })
            }
        }
    }

    async fn capture_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(AgentError::Capture("not connected".into()));
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| AgentError::Capture("no open device".into()))?;
        match source.read_frame(READ_TIMEOUT).await {
            Some(raw) => {
                let image = RgbImage::from_raw(raw.width, raw.height, raw.data)
                    .ok_or_else(|| AgentError::Capture("frame buffer size mismatch".into()))?;
                Ok(Frame::new(image))
            }
            None => {
                self.connected = false;
                Err(AgentError::Capture("frame read timed out".into()))
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        debug!(camera = %self.config.id, "Direct camera reconnecting");
        self.cleanup();
        tokio::time::sleep(Duration::from_secs(self.advanced.reconnect_delay)).await;
        self.setup().await
    }

    fn cleanup(&mut self) {
        if let Some(source) = self.source.take() {
            source.stop();
        }
        self.connected = false;
    }

    fn info(&self) -> serde_json::Value {
        json!({
            "camera_id": self.config.id,
            "type": "direct",
            "device": self.resolve_device().display().to_string(),
            "resolution": self.config.resolution,
            "fps": self.config.fps,
            "is_connected": self.connected,
            "capture_interval": self.config.capture_interval,
        })
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}
