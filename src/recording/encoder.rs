//! Video encoders used to finalize a recording session.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, RgbImage};
use tracing::debug;

use crate::error::EncodeError;

/// Turns an ordered frame sequence into a playable file.
pub trait VideoEncoder: Send + Sync {
    /// File extension of the produced container, without the dot.
    fn extension(&self) -> &'static str;

    fn encode(&self, frames: &[RgbImage], fps: u32, path: &Path) -> Result<(), EncodeError>;
}

/// Pure-Rust fallback: looping animated GIF, decodable while it downloads.
pub struct GifSequenceEncoder {
    /// 1 (best quantization) ..= 30 (fastest)
    speed: i32,
}

impl GifSequenceEncoder {
    pub fn new(speed: i32) -> Self {
        Self {
            speed: speed.clamp(1, 30),
        }
    }
}

impl Default for GifSequenceEncoder {
    fn default() -> Self {
        Self::new(20)
    }
}

impl VideoEncoder for GifSequenceEncoder {
    fn extension(&self) -> &'static str {
        "gif"
    }

    fn encode(&self, frames: &[RgbImage], fps: u32, path: &Path) -> Result<(), EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::Empty);
        }

        let file = BufWriter::new(File::create(path)?);
        let mut encoder = GifEncoder::new_with_speed(file, self.speed);
        encoder.set_repeat(Repeat::Infinite)?;

        let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
        for frame in frames {
            let rgba = DynamicImage::ImageRgb8(frame.clone()).into_rgba8();
            encoder.encode_frame(image::Frame::from_parts(rgba, 0, 0, delay))?;
        }

        debug!(frames = frames.len(), path = %path.display(), "gif written");
        Ok(())
    }
}

/// H.264/MP4 when GStreamer is compiled in, GIF otherwise.
pub fn default_encoder() -> Arc<dyn VideoEncoder> {
    #[cfg(feature = "gstreamer-pipeline")]
    {
        Arc::new(super::gst_encoder::Mp4Encoder::default())
    }

    #[cfg(not(feature = "gstreamer-pipeline"))]
    {
        Arc::new(GifSequenceEncoder::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gif_encoder_writes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        let frames: Vec<RgbImage> = (0..3)
            .map(|i| RgbImage::from_pixel(16, 12, image::Rgb([i * 80, 40, 200])))
            .collect();

        GifSequenceEncoder::default()
            .encode(&frames, 15, &path)
            .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"GIF89a"));

        let decoder =
            image::codecs::gif::GifDecoder::new(std::io::Cursor::new(bytes)).unwrap();
        use image::AnimationDecoder;
        assert_eq!(decoder.into_frames().count(), 3);
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gif");
        assert!(matches!(
            GifSequenceEncoder::default().encode(&[], 15, &path),
            Err(EncodeError::Empty)
        ));
        assert!(!path.exists());
    }

    #[test]
    fn default_encoder_follows_the_build() {
        let expected = if cfg!(feature = "gstreamer-pipeline") { "mp4" } else { "gif" };
        assert_eq!(default_encoder().extension(), expected);
    }
}
