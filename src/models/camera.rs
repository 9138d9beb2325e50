// Data structures for camera capture

use serde::{Deserialize, Serialize};

/// A camera device that can be opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: String,
    pub name: String,
    pub is_front_facing: bool,
}

/// Resolution and frame rate requested when opening a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Error types for camera operations
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("Web camera devices are not found")]
    NoDevices,

    #[error("Failed to open camera {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    #[error("Camera did not report a valid frame size within {waited_ms} ms")]
    NotReady { waited_ms: u64 },

    #[error("Camera is not playing")]
    NotPlaying,

    #[error("Frame is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    FrameSizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

pub type CameraResult<T> = Result<T, CameraError>;
