// Pixel buffers exchanged between the camera, the graph and the display

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pixel layout of an image frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    /// 8-bit RGBA, 4 bytes per pixel
    Srgba,
    /// 8-bit RGB, 3 bytes per pixel
    Srgb,
    /// 8-bit single channel
    Gray8,
}

impl ImageFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            ImageFormat::Srgba => 4,
            ImageFormat::Srgb => 3,
            ImageFormat::Gray8 => 1,
        }
    }
}

/// Bytes per pixel of every texture (RGBA32)
pub const RGBA_BYTES_PER_PIXEL: usize = 4;

/// A dense image carried through the graph as a packet payload.
///
/// Rows may be padded: `width_step` is the distance in bytes between the
/// starts of two consecutive rows and is at least `width * bytes_per_pixel`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    format: ImageFormat,
    width: u32,
    height: u32,
    width_step: usize,
    data: Vec<u8>,
}

impl ImageFrame {
    /// Wrap raw bytes as an image frame
    pub fn new(
        format: ImageFormat,
        width: u32,
        height: u32,
        width_step: usize,
        data: Vec<u8>,
    ) -> FrameResult<Self> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions(format!("{}x{}", width, height)));
        }

        let row_bytes = width as usize * format.bytes_per_pixel();
        if width_step < row_bytes {
            return Err(FrameError::InvalidStride {
                width_step,
                row_bytes,
            });
        }

        let expected = width_step * height as usize;
        if data.len() < expected {
            return Err(FrameError::BufferTooSmall {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            format,
            width,
            height,
            width_step,
            data,
        })
    }

    /// Tightly packed RGBA frame
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> FrameResult<Self> {
        Self::new(
            ImageFormat::Srgba,
            width,
            height,
            width as usize * RGBA_BYTES_PER_PIXEL,
            data,
        )
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width_step(&self) -> usize {
        self.width_step
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pixel bytes of row `y`, without padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.width_step;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }

    /// Bytes of the pixel at (`x`, `y`)
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let start = y as usize * self.width_step + x as usize * bpp;
        &self.data[start..start + bpp]
    }

    /// Copy the pixels into a tightly packed `width` x `height` RGBA buffer.
    ///
    /// Returns `false` without touching `out` when the frame is not RGBA, its
    /// dimensions differ from `width` x `height`, or `out` is the wrong size.
    pub fn read_pixel_data(&self, width: u32, height: u32, out: &mut [u8]) -> bool {
        if self.format != ImageFormat::Srgba || (self.width, self.height) != (width, height) {
            return false;
        }

        let row_bytes = self.width as usize * RGBA_BYTES_PER_PIXEL;
        if out.len() != row_bytes * self.height as usize {
            return false;
        }

        for (y, dst) in out.chunks_exact_mut(row_bytes).enumerate() {
            dst.copy_from_slice(self.row(y as u32));
        }
        true
    }
}

/// RGBA pixel store backing the input and display surfaces
#[derive(Debug, Clone)]
pub struct Texture {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    uploads: u64,
}

impl Texture {
    /// Create a transparent black texture
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * RGBA_BYTES_PER_PIXEL],
            uploads: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.pixels
    }

    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Reallocate as a transparent black `width` x `height` texture
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * RGBA_BYTES_PER_PIXEL];
    }

    /// Replace every pixel of the texture
    pub fn set_pixels(&mut self, pixels: &[u8]) -> FrameResult<()> {
        if pixels.len() != self.pixels.len() {
            return Err(FrameError::BufferTooSmall {
                expected: self.pixels.len(),
                actual: pixels.len(),
            });
        }
        self.pixels.copy_from_slice(pixels);
        Ok(())
    }

    /// Mark the current contents as uploaded to the display
    pub fn apply(&mut self) {
        self.uploads += 1;
    }

    /// Number of times `apply` has been called
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    pub fn to_image(&self) -> Option<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// Write the current contents to disk; the format follows the extension
    pub fn save(&self, path: &Path) -> image::ImageResult<()> {
        image::save_buffer(
            path,
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
        )
    }
}

/// Error types for frame construction and copies
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Row stride {width_step} is smaller than the {row_bytes} bytes of a row")]
    InvalidStride { width_step: usize, row_bytes: usize },

    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
}

pub type FrameResult<T> = Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pixel_data_drops_row_padding() {
        // 2x2 RGBA with 4 bytes of padding per row
        let mut data = Vec::new();
        data.extend_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2, 0xAA, 0xAA, 0xAA, 0xAA]);
        data.extend_from_slice(&[3, 3, 3, 3, 4, 4, 4, 4, 0xAA, 0xAA, 0xAA, 0xAA]);
        let frame = ImageFrame::new(ImageFormat::Srgba, 2, 2, 12, data).unwrap();

        let mut out = vec![0u8; 16];
        assert!(frame.read_pixel_data(2, 2, &mut out));
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]);
    }

    #[test]
    fn test_read_pixel_data_rejects_wrong_size() {
        let frame = ImageFrame::from_rgba(2, 2, vec![7; 16]).unwrap();
        let mut out = vec![9u8; 12];
        assert!(!frame.read_pixel_data(2, 2, &mut out));
        assert!(out.iter().all(|b| *b == 9), "Buffer should be untouched");
    }

    #[test]
    fn test_read_pixel_data_rejects_transposed_frame() {
        // Same byte count, different shape
        let frame = ImageFrame::from_rgba(3, 2, vec![7; 24]).unwrap();
        let mut out = vec![9u8; 24];
        assert!(!frame.read_pixel_data(2, 3, &mut out));
        assert!(out.iter().all(|b| *b == 9), "Buffer should be untouched");
        assert!(frame.read_pixel_data(3, 2, &mut out));
    }

    #[test]
    fn test_frame_validation() {
        assert!(matches!(
            ImageFrame::from_rgba(0, 4, vec![]),
            Err(FrameError::InvalidDimensions(_))
        ));
        assert!(matches!(
            ImageFrame::new(ImageFormat::Srgba, 4, 1, 8, vec![0; 16]),
            Err(FrameError::InvalidStride { .. })
        ));
        assert!(matches!(
            ImageFrame::from_rgba(2, 2, vec![0; 15]),
            Err(FrameError::BufferTooSmall { expected: 16, actual: 15 })
        ));
    }

    #[test]
    fn test_texture_set_pixels_and_apply() {
        let mut texture = Texture::new(2, 1);
        assert_eq!(texture.raw_data(), &[0; 8]);
        assert!(texture.set_pixels(&[1; 4]).is_err());

        texture.set_pixels(&[5; 8]).unwrap();
        texture.apply();
        assert_eq!(texture.raw_data(), &[5; 8]);
        assert_eq!(texture.upload_count(), 1);

        let image = texture.to_image().expect("Texture should convert to an image");
        assert_eq!(image.dimensions(), (2, 1));

        texture.resize(1, 3);
        assert_eq!((texture.width(), texture.height()), (1, 3));
        assert_eq!(texture.raw_data(), &[0; 12]);
        assert_eq!(texture.upload_count(), 1);
    }
}
