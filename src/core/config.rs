use crate::core::asset_provisioner::{pose_assets, AssetSpec};
use crate::models::camera::CaptureRequest;
use crate::models::pose::PoseOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest width a camera reports before it delivers real frames
pub const MIN_FRAME_DIMENSION: u32 = 16;
const MAX_FRAME_DIMENSION: u32 = 4096;

/// Tracking session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    pub camera: CameraSettings,
    pub graph: GraphSettings,
    pub assets: AssetSettings,
    pub pose: PoseOptions,
}

/// Requested camera stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// How long to wait for the device to report a real frame size
    pub ready_timeout_ms: u64,
}

/// Where the graph comes from and which streams the pump uses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphSettings {
    /// Text-format graph config file
    pub config_path: Option<PathBuf>,
    /// Inline text-format graph config, takes precedence over `config_path`
    pub config_text: Option<String>,
    pub input_stream: String,
    pub output_stream: String,
}

/// Model files staged before the graph is built
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssetSettings {
    pub source_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub models: Vec<AssetSpec>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            ready_timeout_ms: 5_000,
        }
    }
}

impl CameraSettings {
    pub fn capture_request(&self) -> CaptureRequest {
        CaptureRequest {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            config_path: Some(PathBuf::from("graphs/pose_tracking_cpu.pbtxt")),
            config_text: None,
            input_stream: "input_video".to_string(),
            output_stream: "output_video".to_string(),
        }
    }
}

impl Default for AssetSettings {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());

        let mut cache_dir = PathBuf::from(home);
        cache_dir.push(".pose_tracker");
        cache_dir.push("assets");

        Self {
            source_dir: PathBuf::from("assets"),
            cache_dir,
            models: pose_assets(PoseOptions::default().model_complexity),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            graph: GraphSettings::default(),
            assets: AssetSettings::default(),
            pose: PoseOptions::default(),
        }
    }
}

impl TrackingConfig {
    /// Load and validate a JSON configuration file
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TrackingConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate and write the configuration as pretty JSON
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        let camera = &self.camera;
        for (label, value) in [("width", camera.width), ("height", camera.height)] {
            if value <= MIN_FRAME_DIMENSION || value > MAX_FRAME_DIMENSION {
                return Err(ConfigError::Invalid(format!(
                    "Invalid camera {}: {}. Must be between {} and {}",
                    label,
                    value,
                    MIN_FRAME_DIMENSION + 1,
                    MAX_FRAME_DIMENSION
                )));
            }
        }

        if camera.fps == 0 || camera.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "Invalid camera FPS: {}. Must be between 1 and 120",
                camera.fps
            )));
        }

        for (label, rotation) in [
            ("input", self.pose.input_rotation),
            ("output", self.pose.output_rotation),
        ] {
            if ![0, 90, 180, 270].contains(&rotation) {
                return Err(ConfigError::Invalid(format!(
                    "Invalid {} rotation: {}. Must be one of: 0, 90, 180, 270",
                    label, rotation
                )));
            }
        }

        if self.graph.config_text.is_none() && self.graph.config_path.is_none() {
            return Err(ConfigError::Invalid(
                "Either graph.config_text or graph.config_path must be set".to_string(),
            ));
        }

        if self.graph.input_stream.is_empty() || self.graph.output_stream.is_empty() {
            return Err(ConfigError::Invalid(
                "Graph input and output stream names must not be empty".to_string(),
            ));
        }

        for asset in &self.assets.models {
            asset.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        Ok(())
    }
}

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.camera.height, 480);
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.graph.input_stream, "input_video");
        assert_eq!(config.graph.output_stream, "output_video");

        let names: Vec<&str> = config.assets.models.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["pose_detection.bytes", "pose_landmark_full.bytes"]);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = TrackingConfig::default();
        config.camera.width = 16;
        assert!(config.validate().is_err());

        let mut config = TrackingConfig::default();
        config.camera.fps = 0;
        assert!(config.validate().is_err());

        let mut config = TrackingConfig::default();
        config.pose.output_rotation = 45;
        assert!(config.validate().is_err());

        let mut config = TrackingConfig::default();
        config.graph.config_path = None;
        assert!(config.validate().is_err());
        config.graph.config_text = Some("input_stream: \"input_video\"".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir =
            std::env::temp_dir().join(format!("pose_tracker_config_{}", uuid::Uuid::new_v4()));
        let path = dir.join("tracking.json");

        let mut config = TrackingConfig::default();
        config.camera.fps = 60;
        config.pose.smooth_landmarks = false;
        config.save_to(&path).unwrap();

        let loaded = TrackingConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: TrackingConfig =
            serde_json::from_str(r#"{ "camera": { "width": 1280, "height": 720 } }"#).unwrap();
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.graph.output_stream, "output_video");
    }
}
