//! Synthetic frame source for `stub://` URIs.
//!
//! Produces a flat gray scene with a bright block that jumps every few
//! seconds, enough to exercise live view, motion detection and recording
//! without a camera.

use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::source::StreamBackend;
use crate::error::CaptureError;

pub const SCHEME: &str = "stub://";

pub struct SyntheticSource {
    width: u32,
    height: u32,
    connected: bool,
    frame_count: u64,
    /// Frames between block jumps.
    period: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            connected: false,
            frame_count: 0,
            period: 90,
        }
    }

    pub fn with_period(mut self, period: u64) -> Self {
        self.period = period.max(1);
        self
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![96u8; w * h * 3];

        let block = (w.min(h) / 4).max(1);
        let slot = (self.frame_count / self.period) as usize;
        let x0 = (slot * block) % w.saturating_sub(block).max(1);
        let y0 = (slot * block / 2) % h.saturating_sub(block).max(1);

        for y in y0..(y0 + block).min(h) {
            let row = y * w * 3;
            pixels[row + x0 * 3..row + (x0 + block).min(w) * 3].fill(240);
        }
        pixels
    }
}

impl StreamBackend for SyntheticSource {
    fn connect(&mut self, uri: &str) -> Result<(), CaptureError> {
        if !uri.starts_with(SCHEME) {
            return Err(CaptureError::Unsupported(uri.to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.connected {
            return Err(CaptureError::NotConnected);
        }
        self.frame_count += 1;
        Ok(Some(Frame::new(
            self.render(),
            self.width,
            self.height,
            PixelFormat::Bgr24,
            self.frame_count,
        )))
    }

    fn release(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_full_frames_once_connected() {
        let mut source = SyntheticSource::new(64, 48);
        assert!(source.read_frame().is_err());

        source.connect("stub://test").unwrap();
        let frame = source.read_frame().unwrap().unwrap();
        assert_eq!(frame.dimensions(), (64, 48));
        assert!(!frame.is_empty());
    }

    #[test]
    fn block_moves_after_period() {
        let mut source = SyntheticSource::new(64, 48).with_period(2);
        source.connect("stub://test").unwrap();

        let a = source.read_frame().unwrap().unwrap();
        let b = source.read_frame().unwrap().unwrap();
        let c = source.read_frame().unwrap().unwrap();
        assert_ne!(a.data, b.data);
        assert_eq!(b.data, c.data);
    }

    #[test]
    fn rejects_foreign_scheme() {
        let mut source = SyntheticSource::new(8, 8);
        assert!(matches!(
            source.connect("rtsp://cam"),
            Err(CaptureError::Unsupported(_))
        ));
    }
}
