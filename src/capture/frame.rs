use bytes::Bytes;
use image::{imageops, GrayImage, ImageBuffer, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CaptureError;

/// Decoded frame, immutable once produced. Cloning shares the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    /// Tightly packed 3-channel pixels, `width * height * 3` bytes
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Stream PTS if available
}

/// Channel orderings a source may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn from_rgb(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, PixelFormat::Rgb24, sequence)
    }

    pub fn with_device_timestamp(mut self, pts: Option<Duration>) -> Self {
        Arc::make_mut(&mut self.meta).device_timestamp = pts;
        self
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    fn expected_len(&self) -> usize {
        self.meta.width as usize * self.meta.height as usize * 3
    }

    /// Zero-sized or truncated payloads count as corrupt frames.
    pub fn is_empty(&self) -> bool {
        self.meta.width == 0
            || self.meta.height == 0
            || self.data.is_empty()
            || self.data.len() < self.expected_len()
    }

    /// Copy into an RGB image, swapping channels if the source is BGR.
    pub fn to_rgb_image(&self) -> Result<RgbImage, CaptureError> {
        if self.is_empty() {
            return Err(CaptureError::InvalidFrame(format!(
                "{}x{} frame with {} bytes",
                self.meta.width,
                self.meta.height,
                self.data.len()
            )));
        }

        let mut pixels = self.data[..self.expected_len()].to_vec();
        if self.meta.format == PixelFormat::Bgr24 {
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }

        ImageBuffer::from_raw(self.meta.width, self.meta.height, pixels)
            .ok_or_else(|| CaptureError::InvalidFrame("pixel buffer size mismatch".into()))
    }

    /// Single-channel luma using BT.601 weights.
    pub fn to_luma(&self) -> Result<GrayImage, CaptureError> {
        if self.is_empty() {
            return Err(CaptureError::InvalidFrame("empty frame".into()));
        }

        let (r, b) = match self.meta.format {
            PixelFormat::Rgb24 => (0, 2),
            PixelFormat::Bgr24 => (2, 0),
        };
        let pixels = &self.data[..self.expected_len()];

        Ok(GrayImage::from_fn(self.meta.width, self.meta.height, |x, y| {
            let i = (y as usize * self.meta.width as usize + x as usize) * 3;
            let px = &pixels[i..i + 3];
            let luma = (299 * px[r] as u32 + 587 * px[1] as u32 + 114 * px[b] as u32 + 500) / 1000;
            Luma([luma as u8])
        }))
    }

    /// Returns an owned RGB copy at `size`, reusing the buffer when it already matches.
    pub fn resized(&self, size: (u32, u32)) -> Result<Frame, CaptureError> {
        if self.dimensions() == size && self.meta.format == PixelFormat::Rgb24 {
            return Ok(self.clone());
        }

        let rgb = self.to_rgb_image()?;
        let scaled = if rgb.dimensions() == size {
            rgb
        } else {
            imageops::resize(&rgb, size.0, size.1, imageops::FilterType::Triangle)
        };

        let mut frame = Frame::from_rgb(scaled, self.meta.sequence);
        frame.timestamp = self.timestamp;
        Ok(frame.with_device_timestamp(self.meta.device_timestamp))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
