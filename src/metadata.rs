// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Sidecar metadata emitted with every stored image.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};

use crate::camera::Frame;
use crate::config::{CameraConfig, DeviceConfig};
use crate::health::SystemSample;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub timestamp: String,
    pub device_id: String,
    pub camera_id: String,
    pub location: String,
    pub version: String,
    pub camera_type: String,
    pub device: DeviceSection,
    pub system: SystemSection,
    pub camera: CameraSection,
    pub image: ImageSection,
    pub environment: EnvironmentSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    pub uptime_seconds: u64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSection {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSection {
    pub capture_interval: u64,
    pub position: String,
    pub resolution: [u32; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSection {
    pub avg_brightness: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSection {
    pub captured_at_utc: String,
    pub tz_offset_seconds: i32,
}

impl ImageMetadata {
    pub fn build(
        timestamp: &str,
        device: &DeviceConfig,
        camera: &CameraConfig,
        frame: &Frame,
        system: &SystemSample,
        uptime_seconds: u64,
    ) -> Self {
        let now_local = Local::now();
        Self {
            timestamp: timestamp.to_string(),
            device_id: device.id.clone(),
            camera_id: camera.id.clone(),
            location: device.location.clone(),
            version: crate::VERSION.to_string(),
            camera_type: camera.kind.name().to_string(),
            device: DeviceSection {
                uptime_seconds,
                description: device.description.clone(),
            },
            system: SystemSection {
                cpu_percent: system.cpu_percent,
                memory_percent: system.memory_percent,
                disk_percent: system.disk_percent,
                cpu_temperature: system.temperature,
            },
            camera: CameraSection {
                capture_interval: camera.capture_interval,
                position: camera.position.clone(),
                resolution: camera.resolution,
            },
            image: ImageSection {
                avg_brightness: frame.mean_brightness(),
                width: frame.width(),
                height: frame.height(),
            },
            environment: EnvironmentSection {
                captured_at_utc: Utc::now().to_rfc3339(),
                tz_offset_seconds: now_local.offset().local_minus_utc(),
            },
        }
    }
}
