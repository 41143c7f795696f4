use thiserror::Error;

/// Failures while talking to the video source.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open stream {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("stream is not connected")]
    NotConnected,

    #[error("stream read failed: {0}")]
    Read(String),

    #[error("no frame within {0:?}")]
    Timeout(std::time::Duration),

    #[error("unsupported stream uri: {0}")]
    Unsupported(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Failures while encoding live-view images or recordings.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] CaptureError),

    #[error("encoder backend failed: {0}")]
    Backend(String),

    #[error("nothing to encode")]
    Empty,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Incomplete(Vec<&'static str>),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// A rejected command. Never fatal for the pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid direction: {0}")]
    InvalidDirection(String),

    #[error("step must be a positive integer, got {0}")]
    InvalidStep(i64),

    #[error("camera movement out of range: {0}")]
    RangeExceeded(String),

    #[error("camera control error: {0}")]
    Ptz(String),

    #[error("camera control is not configured")]
    PtzUnavailable,

    #[error("pipeline is not armed")]
    NotArmed,
}

impl CommandError {
    /// Machine-readable reason reported back to the transport layer.
    pub fn reason(&self) -> &'static str {
        match self {
            CommandError::MissingParameter(_) => "missing_parameter",
            CommandError::InvalidDirection(_) => "invalid_direction",
            CommandError::InvalidStep(_) => "invalid_step",
            CommandError::RangeExceeded(_) => "range_exceeded",
            CommandError::Ptz(_) => "ptz_error",
            CommandError::PtzUnavailable => "ptz_unavailable",
            CommandError::NotArmed => "not_armed",
        }
    }
}
