//! Client notification channel.
//!
//! A fan-out broadcast: any number of readers may subscribe, publishing never
//! waits for them. Readers that fall behind lose the oldest events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Started,
    Stopped,
}

/// Events published to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Base64 JPEG of the latest live frame.
    VideoFrame { frame: String },
    MotionStatus { motion: bool },
    MotionDetected { motion: bool },
    RecordingStatus {
        status: RecordingStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::VideoFrame { .. } => "video_frame",
            Event::MotionStatus { .. } => "motion_status",
            Event::MotionDetected { .. } => "motion_detected",
            Event::RecordingStatus { .. } => "recording_status",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Best effort: an absent reader is not an error.
    pub fn publish(&self, event: Event) {
        if self.sender.send(event).is_err() {
            trace!("no subscribers attached");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::EventsConfig::default().capacity)
    }
}
