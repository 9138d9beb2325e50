// Camera backends
// Each backend implements the CameraBackend trait defined in core/camera.rs

pub mod synthetic;

pub use synthetic::{SyntheticCamera, TestPattern};
