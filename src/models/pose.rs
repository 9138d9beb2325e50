// Session options for the pose tracking graph

use crate::models::graph::{PacketData, SidePacket};
use serde::{Deserialize, Serialize};

// ==============================================================================
// Side packet names understood by pose tracking graphs
// ==============================================================================

pub const OUTPUT_ROTATION: &str = "output_rotation";
pub const OUTPUT_HORIZONTALLY_FLIPPED: &str = "output_horizontally_flipped";
pub const OUTPUT_VERTICALLY_FLIPPED: &str = "output_vertically_flipped";
pub const INPUT_ROTATION: &str = "input_rotation";
pub const INPUT_HORIZONTALLY_FLIPPED: &str = "input_horizontally_flipped";
pub const INPUT_VERTICALLY_FLIPPED: &str = "input_vertically_flipped";
pub const MODEL_COMPLEXITY: &str = "model_complexity";
pub const SMOOTH_LANDMARKS: &str = "smooth_landmarks";
pub const ENABLE_SEGMENTATION: &str = "enable_segmentation";
pub const SMOOTH_SEGMENTATION: &str = "smooth_segmentation";

/// Model file used by the pose detector for every complexity
pub const POSE_DETECTION_ASSET: &str = "pose_detection.bytes";

// ==============================================================================
// Configuration
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelComplexity {
    Lite = 0,   // Fastest, less accurate
    Full = 1,   // Balanced
    Heavy = 2,  // Slowest, most accurate
}

impl ModelComplexity {
    /// Landmark model file matching this complexity
    pub fn landmark_asset(&self) -> &'static str {
        match self {
            ModelComplexity::Lite => "pose_landmark_lite.bytes",
            ModelComplexity::Full => "pose_landmark_full.bytes",
            ModelComplexity::Heavy => "pose_landmark_heavy.bytes",
        }
    }
}

/// Per-session graph options, fixed once the graph starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseOptions {
    pub input_rotation: u32,                   // Degrees: 0, 90, 180 or 270
    pub input_horizontally_flipped: bool,
    pub input_vertically_flipped: bool,
    pub output_rotation: u32,                  // Degrees: 0, 90, 180 or 270
    pub output_horizontally_flipped: bool,
    pub output_vertically_flipped: bool,
    pub model_complexity: ModelComplexity,
    pub smooth_landmarks: bool,
    pub enable_segmentation: bool,
    pub smooth_segmentation: bool,
}

impl Default for PoseOptions {
    fn default() -> Self {
        Self {
            input_rotation: 0,
            input_horizontally_flipped: false,
            input_vertically_flipped: false,
            output_rotation: 0,
            output_horizontally_flipped: false,
            // Camera images arrive bottom-up relative to the display
            output_vertically_flipped: true,
            model_complexity: ModelComplexity::Full,
            smooth_landmarks: true,
            enable_segmentation: false,
            smooth_segmentation: false,
        }
    }
}

impl PoseOptions {
    /// Side packets passed to the graph at run start
    pub fn to_side_packet(&self) -> SidePacket {
        let mut side_packet = SidePacket::new();
        side_packet.emplace(OUTPUT_ROTATION, PacketData::Int(self.output_rotation as i64));
        side_packet.emplace(
            OUTPUT_HORIZONTALLY_FLIPPED,
            PacketData::Bool(self.output_horizontally_flipped),
        );
        side_packet.emplace(
            OUTPUT_VERTICALLY_FLIPPED,
            PacketData::Bool(self.output_vertically_flipped),
        );
        side_packet.emplace(INPUT_ROTATION, PacketData::Int(self.input_rotation as i64));
        side_packet.emplace(
            INPUT_HORIZONTALLY_FLIPPED,
            PacketData::Bool(self.input_horizontally_flipped),
        );
        side_packet.emplace(
            INPUT_VERTICALLY_FLIPPED,
            PacketData::Bool(self.input_vertically_flipped),
        );
        side_packet.emplace(MODEL_COMPLEXITY, PacketData::Int(self.model_complexity as i64));
        side_packet.emplace(SMOOTH_LANDMARKS, PacketData::Bool(self.smooth_landmarks));
        side_packet.emplace(ENABLE_SEGMENTATION, PacketData::Bool(self.enable_segmentation));
        side_packet.emplace(SMOOTH_SEGMENTATION, PacketData::Bool(self.smooth_segmentation));
        side_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_options_default() {
        let options = PoseOptions::default();
        assert_eq!(options.model_complexity, ModelComplexity::Full);
        assert!(options.output_vertically_flipped);
        assert!(options.smooth_landmarks);
        assert!(!options.enable_segmentation);
        assert!(!options.smooth_segmentation);
        assert_eq!(options.output_rotation, 0);
    }

    #[test]
    fn test_side_packet_carries_every_option() {
        let options = PoseOptions {
            input_rotation: 90,
            model_complexity: ModelComplexity::Heavy,
            enable_segmentation: true,
            ..Default::default()
        };
        let side_packet = options.to_side_packet();

        assert_eq!(side_packet.len(), 10);
        assert_eq!(side_packet.get_int(INPUT_ROTATION), Some(90));
        assert_eq!(side_packet.get_int(MODEL_COMPLEXITY), Some(2));
        assert_eq!(side_packet.get_bool(ENABLE_SEGMENTATION), Some(true));
        assert_eq!(side_packet.get_bool(OUTPUT_VERTICALLY_FLIPPED), Some(true));
        assert_eq!(side_packet.get_bool(INPUT_HORIZONTALLY_FLIPPED), Some(false));
    }

    #[test]
    fn test_landmark_asset_per_complexity() {
        assert_eq!(ModelComplexity::Lite.landmark_asset(), "pose_landmark_lite.bytes");
        assert_eq!(ModelComplexity::Full.landmark_asset(), "pose_landmark_full.bytes");
        assert_eq!(ModelComplexity::Heavy.landmark_asset(), "pose_landmark_heavy.bytes");
    }
}
