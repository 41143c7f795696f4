pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod source;
pub mod synthetic;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{CaptureState, CaptureStats, SourceConnector, StopFlag, StreamBackend};
pub use synthetic::SyntheticSource;

use crate::error::CaptureError;
use crate::CaptureConfig;

/// Pick a backend for `uri`: `stub://` is synthetic, anything else goes through GStreamer.
pub fn open_backend(
    uri: &str,
    config: &CaptureConfig,
) -> Result<Box<dyn StreamBackend>, CaptureError> {
    if uri.starts_with(synthetic::SCHEME) {
        let (width, height) = config.capture_size().unwrap_or(config.output_size());
        return Ok(Box::new(SyntheticSource::new(width, height)));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    {
        Ok(Box::new(gst_capture::GstStreamSource::new(
            config.capture_size(),
            config.read_timeout(),
        )?))
    }

    #[cfg(not(feature = "gstreamer-pipeline"))]
    {
        Err(CaptureError::Unsupported(format!(
            "{} (build with the gstreamer-pipeline feature)",
            source::redact(uri)
        )))
    }
}
