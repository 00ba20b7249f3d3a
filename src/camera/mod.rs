// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Camera adapters — one uniform capture contract, three transports.
//!
//! `direct` drives a local v4l2 device, `stream` a buffered RTSP source (both
//! through GStreamer pipelines), `onvif` pulls JPEG snapshots over HTTP.
//! Construction goes through [`create_camera`], keyed by the config's `type`.

pub mod direct;
pub mod onvif;
pub mod pipeline;
pub mod stream;

use async_trait::async_trait;
use image::RgbImage;
use tracing::warn;

use crate::config::{AdvancedConfig, CameraConfig, CameraKindConfig};
use crate::error::Result;

/// A single captured frame, RGB, ready for annotation and JPEG encoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Mean pixel value across all channels, 0–255.
    pub fn mean_brightness(&self) -> f64 {
        let raw = self.image.as_raw();
        if raw.is_empty() {
            return 0.0;
        }
        let sum: u64 = raw.iter().map(|&b| b as u64).sum();
        sum as f64 / raw.len() as f64
    }
}

/// Uniform capture contract implemented by every adapter.
#[async_trait]
pub trait CameraAdapter: Send {
    /// Open the source, apply resolution/fps hints, wait for it to settle and
    /// read one probe frame. A handle that opens but cannot produce a probe
    /// frame is released and reported as a setup failure.
    async fn setup(&mut self) -> Result<()>;

    /// Capture one frame.
    async fn capture_frame(&mut self) -> Result<Frame>;

    /// Drain one buffered frame to keep a stream alive between captures.
    /// Adapters without buffering no-op and return `false`.
    fn grab_frame(&mut self) -> bool {
        false
    }

    /// Tear down and re-run setup. The owning capture loop decides when.
    async fn reconnect(&mut self) -> Result<()>;

    /// Release the underlying handle. Idempotent.
    fn cleanup(&mut self);

    /// Adapter description for status output.
    fn info(&self) -> serde_json::Value;

    fn kind(&self) -> &'static str;

    /// Whether this adapter keeps a buffered stream open between captures.
    fn is_buffered(&self) -> bool {
        false
    }
}

/// Reject only null/empty frames. Extreme darkness or brightness is a true
/// observation — log it, keep the frame.
pub fn validate_frame(camera_id: &str, frame: &Frame) -> bool {
    if frame.is_empty() {
        return false;
    }
    let avg = frame.mean_brightness();
    if avg < 5.0 {
        warn!(
            camera = camera_id,
            avg = format!("{avg:.1}"),
            "Low brightness frame detected, possible low light conditions"
        );
    } else if avg > 250.0 {
        warn!(
            camera = camera_id,
            avg = format!("{avg:.1}"),
            "High brightness frame detected, possible overexposure"
        );
    }
    true
}

/// Build the adapter for a camera config.
pub fn create_camera(config: &CameraConfig, advanced: &AdvancedConfig) -> Box<dyn CameraAdapter> {
    match &config.kind {
        CameraKindConfig::Direct { .. } => {
            Box::new(direct::DirectCamera::new(config.clone(), advanced.clone()))
        }
        CameraKindConfig::Stream { .. } => {
            Box::new(stream::StreamCamera::new(config.clone(), advanced.clone()))
        }
        CameraKindConfig::Onvif { .. } => {
            Box::new(onvif::OnvifCamera::new(config.clone(), advanced.clone()))
        }
    }
}
