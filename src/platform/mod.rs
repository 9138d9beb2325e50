// Platform backends for the camera and GPU seams
// Real device backends implement CameraBackend / GpuBackend the same way

pub mod camera;
pub mod gpu;

pub use camera::{SyntheticCamera, TestPattern};
pub use gpu::HeadlessGpu;
