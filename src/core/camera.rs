// Camera abstraction layer - unified interface for all camera backends

use crate::core::config::{CameraSettings, MIN_FRAME_DIMENSION};
use crate::models::camera::{CameraDevice, CameraError, CameraResult, CaptureRequest};
use crate::models::frame::Texture;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Platform-agnostic camera trait
#[async_trait]
pub trait CameraBackend: Send + Sync {
    /// Get list of available devices
    async fn devices(&self) -> CameraResult<Vec<CameraDevice>>;

    /// Open a device and start streaming
    async fn open(&mut self, device: &CameraDevice, request: CaptureRequest) -> CameraResult<()>;

    /// Size of the frames currently delivered; `(0, 0)` while closed
    fn dimensions(&mut self) -> (u32, u32);

    /// Copy the most recent frame as tightly packed RGBA into `buffer`
    fn read_pixels(&mut self, buffer: &mut [u8]) -> CameraResult<()>;

    /// Stop streaming
    async fn stop(&mut self) -> CameraResult<()>;

    fn is_playing(&self) -> bool;
}

/// A started camera streaming at the requested size
pub struct WebCamera {
    backend: Box<dyn CameraBackend>,
    device: CameraDevice,
    request: CaptureRequest,
}

impl WebCamera {
    /// Open the first enumerated device and wait until it delivers real frames
    pub async fn start(
        mut backend: Box<dyn CameraBackend>,
        settings: &CameraSettings,
    ) -> CameraResult<Self> {
        let devices = backend.devices().await?;
        debug!("Found {} camera device(s)", devices.len());

        let device = devices.into_iter().next().ok_or(CameraError::NoDevices)?;
        let request = settings.capture_request();
        backend.open(&device, request).await?;

        let mut camera = Self {
            backend,
            device,
            request,
        };
        camera
            .wait_until_ready(Duration::from_millis(settings.ready_timeout_ms))
            .await?;

        info!(
            "Started camera {} ({}x{} @ {} fps)",
            camera.device.name, request.width, request.height, request.fps
        );
        Ok(camera)
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> CameraResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (width, _) = self.backend.dimensions();
            if width > MIN_FRAME_DIMENSION {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CameraError::NotReady {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Copy the latest frame into the texture's backing store
    pub fn read_frame(&mut self, texture: &mut Texture) -> CameraResult<()> {
        if !self.backend.is_playing() {
            return Err(CameraError::NotPlaying);
        }

        let (width, height) = self.backend.dimensions();
        if (width, height) != (texture.width(), texture.height()) {
            return Err(CameraError::FrameSizeMismatch {
                expected_width: texture.width(),
                expected_height: texture.height(),
                actual_width: width,
                actual_height: height,
            });
        }

        self.backend.read_pixels(texture.raw_data_mut())
    }

    /// Stop capture if it is still running
    pub async fn stop(&mut self) -> CameraResult<()> {
        if self.backend.is_playing() {
            self.backend.stop().await?;
            info!("Stopped camera {}", self.device.name);
        }
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.backend.is_playing()
    }

    pub fn device(&self) -> &CameraDevice {
        &self.device
    }

    pub fn request(&self) -> CaptureRequest {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::camera::{SyntheticCamera, TestPattern};

    fn settings(width: u32, height: u32) -> CameraSettings {
        CameraSettings {
            width,
            height,
            fps: 30,
            ready_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_start_fails_without_devices() {
        let backend = SyntheticCamera::new(TestPattern::Gradient).without_devices();
        let result = WebCamera::start(Box::new(backend), &settings(64, 48)).await;
        assert!(matches!(result, Err(CameraError::NoDevices)));
    }

    #[tokio::test]
    async fn test_start_waits_for_warmup() {
        let backend = SyntheticCamera::new(TestPattern::Gradient).with_warmup_polls(3);
        let mut camera = WebCamera::start(Box::new(backend), &settings(64, 48)).await.unwrap();
        assert!(camera.is_playing());
        assert_eq!(camera.device().name, "Synthetic Camera");

        let mut texture = Texture::new(64, 48);
        camera.read_frame(&mut texture).unwrap();
        assert!(texture.raw_data().iter().any(|b| *b != 0));

        camera.stop().await.unwrap();
        assert!(!camera.is_playing());
        assert!(matches!(camera.read_frame(&mut texture), Err(CameraError::NotPlaying)));
    }

    #[tokio::test]
    async fn test_start_times_out_when_never_ready() {
        let backend = SyntheticCamera::new(TestPattern::Gradient).with_warmup_polls(u32::MAX);
        let mut camera_settings = settings(64, 48);
        camera_settings.ready_timeout_ms = 30;

        let result = WebCamera::start(Box::new(backend), &camera_settings).await;
        assert!(matches!(result, Err(CameraError::NotReady { waited_ms: 30 })));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_size_mismatch() {
        let backend = SyntheticCamera::new(TestPattern::Gradient);
        let mut camera = WebCamera::start(Box::new(backend), &settings(64, 48)).await.unwrap();

        let mut texture = Texture::new(32, 32);
        assert!(matches!(
            camera.read_frame(&mut texture),
            Err(CameraError::FrameSizeMismatch { actual_width: 64, .. })
        ));
    }
}
