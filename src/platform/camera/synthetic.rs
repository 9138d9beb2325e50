// Synthetic camera producing generated RGBA frames
// Behaves like a real device: reports a 16x16 placeholder size until it warms up

use crate::core::camera::CameraBackend;
use crate::core::config::MIN_FRAME_DIMENSION;
use crate::models::camera::{CameraDevice, CameraError, CameraResult, CaptureRequest};
use crate::models::frame::RGBA_BYTES_PER_PIXEL;
use async_trait::async_trait;

/// Image generated for every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Every pixel has the same RGBA value
    Solid([u8; 4]),
    /// Diagonal gradient that shifts by one pixel per frame
    Gradient,
}

pub struct SyntheticCamera {
    devices: Vec<CameraDevice>,
    pattern: TestPattern,
    warmup_polls: u32,
    polls: u32,
    request: Option<CaptureRequest>,
    playing: bool,
    frame_index: u64,
}

impl SyntheticCamera {
    /// One synthetic device producing `pattern`, ready on the first poll
    pub fn new(pattern: TestPattern) -> Self {
        Self {
            devices: vec![CameraDevice {
                id: "synthetic-0".to_string(),
                name: "Synthetic Camera".to_string(),
                is_front_facing: true,
            }],
            pattern,
            warmup_polls: 0,
            polls: 0,
            request: None,
            playing: false,
            frame_index: 0,
        }
    }

    pub fn with_devices(mut self, devices: Vec<CameraDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn without_devices(self) -> Self {
        self.with_devices(Vec::new())
    }

    /// Report the placeholder size for the first `polls` dimension queries
    pub fn with_warmup_polls(mut self, polls: u32) -> Self {
        self.warmup_polls = polls;
        self
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_index
    }

    fn fill(&self, buffer: &mut [u8], width: u32) {
        match self.pattern {
            TestPattern::Solid(rgba) => {
                for pixel in buffer.chunks_exact_mut(RGBA_BYTES_PER_PIXEL) {
                    pixel.copy_from_slice(&rgba);
                }
            }
            TestPattern::Gradient => {
                let shift = self.frame_index;
                for (i, pixel) in buffer.chunks_exact_mut(RGBA_BYTES_PER_PIXEL).enumerate() {
                    let x = (i as u64 % width as u64) + shift;
                    let y = i as u64 / width as u64;
                    let (r, g, b) = (x % 256, y % 256, (x + y) % 256);
                    pixel.copy_from_slice(&[r as u8, g as u8, b as u8, 255]);
                }
            }
        }
    }
}

#[async_trait]
impl CameraBackend for SyntheticCamera {
    async fn devices(&self) -> CameraResult<Vec<CameraDevice>> {
        Ok(self.devices.clone())
    }

    async fn open(&mut self, device: &CameraDevice, request: CaptureRequest) -> CameraResult<()> {
        if !self.devices.contains(device) {
            return Err(CameraError::OpenFailed {
                device: device.name.clone(),
                reason: "unknown device".to_string(),
            });
        }
        self.request = Some(request);
        self.playing = true;
        self.polls = 0;
        Ok(())
    }

    fn dimensions(&mut self) -> (u32, u32) {
        let Some(request) = self.request.filter(|_| self.playing) else {
            return (0, 0);
        };

        if self.polls < self.warmup_polls {
            self.polls += 1;
            return (MIN_FRAME_DIMENSION, MIN_FRAME_DIMENSION);
        }
        (request.width, request.height)
    }

    fn read_pixels(&mut self, buffer: &mut [u8]) -> CameraResult<()> {
        let request = match self.request {
            Some(request) if self.playing => request,
            _ => return Err(CameraError::NotPlaying),
        };

        let expected = request.width as usize * request.height as usize * RGBA_BYTES_PER_PIXEL;
        if buffer.len() != expected {
            return Err(CameraError::CaptureFailed(format!(
                "buffer holds {} bytes, frame needs {}",
                buffer.len(),
                expected
            )));
        }

        self.fill(buffer, request.width);
        self.frame_index += 1;
        Ok(())
    }

    async fn stop(&mut self) -> CameraResult<()> {
        self.playing = false;
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CaptureRequest {
        CaptureRequest {
            width: 32,
            height: 24,
            fps: 30,
        }
    }

    #[tokio::test]
    async fn test_warmup_reports_placeholder_size() {
        let mut camera = SyntheticCamera::new(TestPattern::Gradient).with_warmup_polls(2);
        assert_eq!(camera.dimensions(), (0, 0), "Closed camera has no size");

        let device = camera.devices().await.unwrap().remove(0);
        camera.open(&device, request()).await.unwrap();

        assert_eq!(camera.dimensions(), (16, 16));
        assert_eq!(camera.dimensions(), (16, 16));
        assert_eq!(camera.dimensions(), (32, 24));
    }

    #[tokio::test]
    async fn test_solid_pattern_fills_every_pixel() {
        let mut camera = SyntheticCamera::new(TestPattern::Solid([128, 128, 128, 255]));
        let device = camera.devices().await.unwrap().remove(0);
        camera.open(&device, request()).await.unwrap();

        let mut buffer = vec![0u8; 32 * 24 * 4];
        camera.read_pixels(&mut buffer).unwrap();
        assert!(buffer.chunks_exact(4).all(|p| p == [128, 128, 128, 255]));
        assert_eq!(camera.frames_read(), 1);

        camera.stop().await.unwrap();
        assert!(matches!(camera.read_pixels(&mut buffer), Err(CameraError::NotPlaying)));
    }

    #[tokio::test]
    async fn test_gradient_changes_between_frames() {
        let mut camera = SyntheticCamera::new(TestPattern::Gradient);
        let device = camera.devices().await.unwrap().remove(0);
        camera.open(&device, request()).await.unwrap();

        let mut first = vec![0u8; 32 * 24 * 4];
        let mut second = vec![0u8; 32 * 24 * 4];
        camera.read_pixels(&mut first).unwrap();
        camera.read_pixels(&mut second).unwrap();
        assert_ne!(first, second);
    }
}
