//! RTSP stream adapter.
//!
//! Pipeline: `rtspsrc (TCP) → decodebin → videoconvert → videoscale → RGB
//! appsink`. The adapter keeps the stream open between captures; the capture
//! loop calls [`CameraAdapter::grab_frame`] during backoff so the source
//! keeps flowing. On a read failure the adapter only flags itself
//! disconnected — the owning `CameraInstance` decides when to reconnect.

use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use serde_json::json;
use tracing::{debug, error, info};

use crate::camera::pipeline::FrameSource;
use crate::camera::{CameraAdapter, Frame};
use crate::config::{AdvancedConfig, CameraConfig, CameraKindConfig};
use crate::error::{AgentError, Result};
use crate::util::redact::redact_url_credentials;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StreamCamera {
    config: CameraConfig,
    advanced: AdvancedConfig,
    source: Option<FrameSource>,
    connected: bool,
}

impl StreamCamera {
    pub fn new(config: CameraConfig, advanced: AdvancedConfig) -> Self {
        Self { config, advanced, source: None, connected: false }
    }

    fn stream_url(&self) -> &str {
        match &self.config.kind {
            CameraKindConfig::Stream { stream_url, .. } => stream_url,
            _ => "",
        }
    }

    fn buffer_hint(&self) -> u32 {
        match &self.config.kind {
            CameraKindConfig::Stream { buffer_size, .. } if *buffer_size > 0 => *buffer_size,
            _ => 1,
        }
    }

    fn pipeline_string(&self) -> String {
        let [width, height] = self.config.resolution;
        format!(
            "rtspsrc location={url} latency=200 protocols=tcp ! \
             decodebin ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={width},height={height} ! \
             appsink name=sink max-buffers={buffers} drop=true sync=false",
            url = self.stream_url(),
            buffers = self.buffer_hint(),
        )
    }
}

#[async_trait]
impl CameraAdapter for StreamCamera {
    async fn setup(&mut self) -> Result<()> {
        info!(
            camera = %self.config.id,
            url = %redact_url_credentials(self.stream_url()),
            "Initializing stream camera"
        );

        let mut source = FrameSource::open(&self.pipeline_string(), self.buffer_hint() as usize)?;
        tokio::time::sleep(Duration::from_secs(self.advanced.camera_init_wait)).await;

        // Some stream servers report a successful open before rejecting the
        // credentials; only a real probe frame proves the session.
        match source.read_frame(PROBE_TIMEOUT).await {
            Some(frame) => {
                info!(
                    camera = %self.config.id,
                    width = frame.width,
                    height = frame.height,
                    "Stream initialized and validated"
                );
                self.source = Some(source);
                self.connected = true;
                Ok(())
            }
            None => {
                error!(
                    camera = %self.config.id,
                    "Stream opened but test frame failed (likely auth rejected or codec unsupported)"
                );
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
            .ok_or_else(|| AgentError::Capture("no open stream".into()))?;
        match source.read_frame(READ_TIMEOUT).await {
            Some(raw) => {
                let image = RgbImage::from_raw(raw.width, raw.height, raw.data)
                    .ok_or_else(|| AgentError::Capture("frame buffer size mismatch".into()))?;
                Ok(Frame::new(image))
            }
            None => {
                self.connected = false;
                Err(AgentError::Capture("stream read failed (stream may have dropped)".into()))
            }
        }
    }

    fn grab_frame(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        match self.source.as_mut() {
            Some(source) => source.drain_one(),
            None => false,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        debug!(camera = %self.config.id, "Stream reconnecting");
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
            "type": "stream",
            "stream_url": redact_url_credentials(self.stream_url()),
            "resolution": self.config.resolution,
            "fps": self.config.fps,
            "is_connected": self.connected,
            "capture_interval": self.config.capture_interval,
        })
    }

    fn kind(&self) -> &'static str {
        "stream"
    }

    fn is_buffered(&self) -> bool {
        true
    }
}
