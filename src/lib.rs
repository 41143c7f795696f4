pub mod capture;
pub mod control;
pub mod error;
pub mod events;
pub mod motion;
pub mod pipeline;
pub mod recording;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureState, Frame, PixelFormat};
pub use error::{CaptureError, CommandError, ConfigError, EncodeError};
pub use events::{Event, EventBus};
pub use pipeline::{Pipeline, PreflightReport, PreflightStatus};

/// Environment variable prefix, e.g. `CAMPIPE_CAMERA__HOST`.
pub const ENV_PREFIX: &str = "CAMPIPE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub motion: MotionConfig,
    pub recording: RecordingConfig,
    pub preflight: PreflightConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Full stream URI. Derived from host and credentials when empty.
    pub stream_uri: String,
    pub stream_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Output resolution handed to live view, recording and motion.
    pub width: u32,
    pub height: u32,
    /// Resolution requested from the backend, if different from the output.
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub live_width: Option<u32>,
    pub live_height: Option<u32>,
    pub jpeg_quality: u8,
    pub reconnect_interval_ms: u64,
    pub read_timeout_ms: u64,
    /// 0 disables pacing.
    pub max_fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub blur_kernel: u32,
    pub diff_threshold: u8,
    pub min_area: u32,
    pub dilate_iterations: u32,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub queue_capacity: usize,
    pub pop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            stream_uri: String::new(),
            stream_path: "stream1".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            capture_width: None,
            capture_height: None,
            live_width: None,
            live_height: None,
            jpeg_quality: 80,
            reconnect_interval_ms: 1000,
            read_timeout_ms: 2000,
            max_fps: 30, // ~33ms between live frames
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 21,
            diff_threshold: 28,
            min_area: 1200,
            dilate_iterations: 2,
            debounce_ms: 5000,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            width: 640,
            height: 480,
            fps: 15,
            queue_capacity: 100,
            pop_timeout_ms: 1000,
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMPIPE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

impl CameraConfig {
    /// Lists every required field that is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("camera.host");
        }
        if self.username.is_empty() {
            missing.push("camera.username");
        }
        if self.password.is_empty() {
            missing.push("camera.password");
        }
        if self.stream_uri.trim().is_empty() && self.stream_path.trim().is_empty() {
            missing.push("camera.stream_uri");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Incomplete(missing))
        }
    }

    pub fn stream_url(&self) -> String {
        if !self.stream_uri.trim().is_empty() {
            return self.stream_uri.clone();
        }
        format!(
            "rtsp://{}:{}@{}/{}",
            self.username,
            self.password,
            self.host,
            self.stream_path.trim_start_matches('/')
        )
    }
}

impl CaptureConfig {
    pub fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn live_size(&self) -> (u32, u32) {
        (
            self.live_width.unwrap_or(self.width),
            self.live_height.unwrap_or(self.height),
        )
    }

    pub fn capture_size(&self) -> Option<(u32, u32)> {
        self.capture_width.zip(self.capture_height)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn frame_interval(&self) -> Option<Duration> {
        (self.max_fps > 0).then(|| Duration::from_secs(1) / self.max_fps)
    }
}

impl MotionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl RecordingConfig {
    pub fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}
