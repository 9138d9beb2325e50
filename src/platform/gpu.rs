// GPU backend for hosts without a graphics device

use crate::core::gpu::{GpuBackend, GpuDeviceInfo, GpuResult};
use async_trait::async_trait;

/// Backend that always succeeds; graphs bound to it run CPU calculators only
#[derive(Debug, Default)]
pub struct HeadlessGpu;

impl HeadlessGpu {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GpuBackend for HeadlessGpu {
    async fn create_resources(&self) -> GpuResult<GpuDeviceInfo> {
        Ok(GpuDeviceInfo {
            name: "headless".to_string(),
            backend: "cpu".to_string(),
        })
    }
}
