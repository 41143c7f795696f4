//! Command inbox types and the optional pan/tilt control capability.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::CommandError;

pub const DEFAULT_STEP: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    /// `(horizontal, vertical)` delta for a move of `step`.
    pub fn delta(self, step: u32) -> (i32, i32) {
        let step = step.min(i32::MAX as u32) as i32;
        match self {
            Direction::Left => (-step, 0),
            Direction::Right => (step, 0),
            Direction::Up => (0, step),
            Direction::Down => (0, -step),
        }
    }
}

impl FromStr for Direction {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            _ => Err(CommandError::InvalidDirection(s.to_string())),
        }
    }
}

/// Failure reported by the camera control collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ControlFailure(pub String);

/// Remote pan/tilt sink. Implemented by whatever client talks to the camera.
pub trait CameraControl: Send + Sync {
    fn authenticate(&self) -> Result<(), ControlFailure>;

    fn move_by(&self, dx: i32, dy: i32) -> Result<(), ControlFailure>;
}

/// Camera control as an optional capability.
#[derive(Clone, Default)]
pub enum PtzControl {
    #[default]
    NotConfigured,
    Configured(Arc<dyn CameraControl>),
}

impl PtzControl {
    pub fn new(control: Arc<dyn CameraControl>) -> Self {
        PtzControl::Configured(control)
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, PtzControl::Configured(_))
    }

    /// Forward one relative move. Collaborator errors become domain errors.
    pub fn move_camera(&self, direction: Direction, step: u32) -> Result<(), CommandError> {
        let PtzControl::Configured(control) = self else {
            return Err(CommandError::PtzUnavailable);
        };

        let (dx, dy) = direction.delta(step);
        control.move_by(dx, dy).map_err(|e| {
            warn!(?direction, step, error = %e, "camera move failed");
            translate_failure(&e)
        })?;
        info!(?direction, step, "camera moved");
        Ok(())
    }
}

impl std::fmt::Debug for PtzControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtzControl::NotConfigured => f.write_str("NotConfigured"),
            PtzControl::Configured(_) => f.write_str("Configured"),
        }
    }
}

pub fn translate_failure(failure: &ControlFailure) -> CommandError {
    let message = failure.0.to_ascii_lowercase();
    if ["range", "limit", "boundary"]
        .iter()
        .any(|word| message.contains(word))
    {
        CommandError::RangeExceeded(failure.0.clone())
    } else {
        CommandError::Ptz(failure.0.clone())
    }
}

/// Commands accepted from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartRecording,
    StopRecording,
    Move {
        #[serde(default)]
        direction: Option<String>,
        #[serde(default)]
        step: Option<i64>,
    },
}

impl Command {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Validate raw move parameters: direction required, step defaults to 10.
pub fn parse_move(direction: Option<&str>, step: Option<i64>) -> Result<(Direction, u32), CommandError> {
    let direction = direction
        .filter(|d| !d.trim().is_empty())
        .ok_or(CommandError::MissingParameter("direction"))?
        .parse::<Direction>()?;

    let step = match step {
        None => DEFAULT_STEP,
        Some(step) if step > 0 && step <= u32::MAX as i64 => step as u32,
        Some(step) => return Err(CommandError::InvalidStep(step)),
    };
    Ok((direction, step))
}

/// Successful command outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandReply {
    RecordingStarted { filename: String },
    RecordingStopped { filename: Option<String> },
    /// Accepted but nothing to do, e.g. starting while already recording.
    Ignored { reason: &'static str },
    Moved { direction: Direction, step: u32 },
}

/// One inbox entry; the reply channel is optional for fire-and-forget callers.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: Option<oneshot::Sender<Result<CommandReply, CommandError>>>,
}

impl Request {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<Result<CommandReply, CommandError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        moves: Mutex<Vec<(i32, i32)>>,
        fail_with: Option<String>,
    }

    impl CameraControl for RecordingControl {
        fn authenticate(&self) -> Result<(), ControlFailure> {
            Ok(())
        }

        fn move_by(&self, dx: i32, dy: i32) -> Result<(), ControlFailure> {
            if let Some(message) = &self.fail_with {
                return Err(ControlFailure(message.clone()));
            }
            self.moves.lock().unwrap().push((dx, dy));
            Ok(())
        }
    }

    #[test]
    fn up_fifteen_is_one_vertical_move() {
        let control = Arc::new(RecordingControl::default());
        let ptz = PtzControl::new(control.clone());

        let (direction, step) = parse_move(Some("up"), Some(15)).unwrap();
        ptz.move_camera(direction, step).unwrap();

        assert_eq!(*control.moves.lock().unwrap(), vec![(0, 15)]);
    }

    #[test]
    fn step_defaults_to_ten() {
        assert_eq!(parse_move(Some("left"), None).unwrap(), (Direction::Left, 10));
        assert_eq!(Direction::Left.delta(10), (-10, 0));
        assert_eq!(Direction::Down.delta(3), (0, -3));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert_eq!(
            parse_move(None, Some(5)),
            Err(CommandError::MissingParameter("direction"))
        );
        assert_eq!(
            parse_move(Some("sideways"), None).unwrap_err().reason(),
            "invalid_direction"
        );
        assert_eq!(parse_move(Some("up"), Some(0)), Err(CommandError::InvalidStep(0)));
        assert_eq!(parse_move(Some("up"), Some(-4)), Err(CommandError::InvalidStep(-4)));
    }

    #[test]
    fn range_messages_map_to_range_exceeded() {
        for message in ["Position out of RANGE", "pan limit reached", "hit boundary"] {
            let control = Arc::new(RecordingControl {
                fail_with: Some(message.into()),
                ..Default::default()
            });
            let err = PtzControl::new(control)
                .move_camera(Direction::Right, 10)
                .unwrap_err();
            assert_eq!(err.reason(), "range_exceeded", "{message}");
        }

        let err = translate_failure(&ControlFailure("connection reset".into()));
        assert_eq!(err, CommandError::Ptz("connection reset".into()));
        assert_eq!(err.reason(), "ptz_error");
    }

    #[test]
    fn unconfigured_control_is_uniformly_unavailable() {
        let ptz = PtzControl::default();
        assert!(!ptz.is_configured());
        assert_eq!(
            ptz.move_camera(Direction::Up, 10),
            Err(CommandError::PtzUnavailable)
        );
    }

    #[test]
    fn commands_parse_from_json() {
        assert_eq!(
            Command::parse(r#"{"command":"start_recording"}"#).unwrap(),
            Command::StartRecording
        );
        assert_eq!(
            Command::parse(r#"{"command":"move","direction":"up","step":15}"#).unwrap(),
            Command::Move {
                direction: Some("up".into()),
                step: Some(15),
            }
        );
        assert_eq!(
            Command::parse(r#"{"command":"move"}"#).unwrap(),
            Command::Move {
                direction: None,
                step: None,
            }
        );
        assert!(Command::parse(r#"{"command":"reboot"}"#).is_err());
    }
}
