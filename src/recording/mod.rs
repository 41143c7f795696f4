pub mod encoder;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_encoder;
pub mod recorder;

pub use encoder::{default_encoder, GifSequenceEncoder, VideoEncoder};
pub use recorder::{Recorder, RecorderState, RecordingSession};
