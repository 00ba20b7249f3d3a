// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("GStreamer error: {0}")]
    GStreamer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera '{id}' connection failed: {reason}")]
    CameraConnection { id: String, reason: String },

    #[error("Camera '{id}' not found")]
    CameraNotFound { id: String },

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("ONVIF error: {0}")]
    Onvif(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Update state error: {0}")]
    UpdateState(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
