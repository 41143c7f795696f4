//! Recording state machine: Idle -> Recording -> Finalizing -> Idle.
//!
//! While recording, a consumer task drains the [`FrameQueue`] into an
//! in-memory session. Stopping flips the state flag, waits for the consumer
//! to leave its loop and encode the session, then returns to Idle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use image::{imageops, RgbImage};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::events::{Event, EventBus, RecordingStatus};
use crate::pipeline::FrameQueue;
use crate::recording::encoder::VideoEncoder;
use crate::utils;
use crate::RecordingConfig;

const IDLE: u8 = 0;
const RECORDING: u8 = 1;
const FINALIZING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Finalizing,
}

impl From<u8> for RecorderState {
    fn from(raw: u8) -> Self {
        match raw {
            RECORDING => RecorderState::Recording,
            FINALIZING => RecorderState::Finalizing,
            _ => RecorderState::Idle,
        }
    }
}

/// One recording attempt, owned by the consumer task.
pub struct RecordingSession {
    path: PathBuf,
    frame_size: (u32, u32),
    fps: u32,
    frames: Vec<RgbImage>,
}

impl RecordingSession {
    pub fn new(path: PathBuf, frame_size: (u32, u32), fps: u32) -> Self {
        Self {
            path,
            frame_size,
            fps: fps.max(1),
            frames: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Resize to the session size in encoder (RGB) channel order and keep it.
    pub fn append(&mut self, frame: &Frame) {
        let rgb = match frame.to_rgb_image() {
            Ok(rgb) => rgb,
            Err(e) => {
                warn!(error = %e, "skipping unrecordable frame");
                return;
            }
        };

        let (w, h) = self.frame_size;
        let rgb = if rgb.dimensions() == (w, h) {
            rgb
        } else {
            imageops::resize(&rgb, w, h, imageops::FilterType::Triangle)
        };
        self.frames.push(rgb);
    }

    /// Encode to disk. Returns the written path, or `None` when nothing was written.
    pub fn finalize(self, encoder: &dyn VideoEncoder) -> Option<PathBuf> {
        if self.frames.is_empty() {
            info!(path = %self.path.display(), "no frames recorded, skipping video file");
            return None;
        }

        match encoder.encode(&self.frames, self.fps, &self.path) {
            Ok(()) => {
                info!(
                    path = %self.path.display(),
                    frames = self.frames.len(),
                    fps = self.fps,
                    "recording saved"
                );
                Some(self.path)
            }
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "failed to finalize recording");
                if self.path.exists() {
                    if let Err(e) = std::fs::remove_file(&self.path) {
                        warn!(error = %e, "failed to remove partial recording");
                    }
                }
                None
            }
        }
    }
}

struct ActiveSession {
    path: PathBuf,
    task: JoinHandle<Option<PathBuf>>,
}

pub struct Recorder {
    state: Arc<AtomicU8>,
    queue: FrameQueue,
    events: EventBus,
    encoder: Arc<dyn VideoEncoder>,
    output_dir: PathBuf,
    pop_timeout: Duration,
    runtime: Handle,
    /// Held across the state transitions so start/stop cannot interleave.
    session: Mutex<Option<ActiveSession>>,
}

impl Recorder {
    /// Must be called inside a Tokio runtime; the consumer task runs on it.
    pub fn new(config: &RecordingConfig, encoder: Arc<dyn VideoEncoder>, events: EventBus) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(IDLE)),
            queue: FrameQueue::new(config.queue_capacity),
            events,
            encoder,
            output_dir: config.output_dir.clone(),
            pop_timeout: config.pop_timeout(),
            runtime: Handle::current(),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    /// Non-blocking hand-off from the capture path. Dropped unless recording.
    pub fn offer(&self, frame: Frame) -> bool {
        self.is_recording() && self.queue.push(frame)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Start a session. No-op (returns `None`) unless Idle.
    pub fn start(&self, frame_size: (u32, u32), fps: u32) -> Option<PathBuf> {
        let mut active = self.lock_session();
        if !self.transition(IDLE, RECORDING) {
            debug!(state = ?self.state(), "start ignored, recorder busy");
            return None;
        }

        let stale = self.queue.clear();
        if stale > 0 {
            debug!(stale, "discarded stale queued frames");
        }

        let path = match utils::next_recording_path(
            &self.output_dir,
            &Local::now(),
            self.encoder.extension(),
        ) {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, dir = %self.output_dir.display(), "cannot prepare recording");
                self.state.store(IDLE, Ordering::Release);
                return None;
            }
        };

        let session = RecordingSession::new(path.clone(), frame_size, fps);
        let queue = self.queue.clone();
        let state = self.state.clone();
        let encoder = self.encoder.clone();
        let pop_timeout = self.pop_timeout;

        let task = self.runtime.spawn_blocking(move || {
            consume(session, &queue, &state, pop_timeout, encoder.as_ref())
        });
        *active = Some(ActiveSession {
            path: path.clone(),
            task,
        });
        drop(active);

        info!(path = %path.display(), ?frame_size, fps, "recording started");
        self.events.publish(Event::RecordingStatus {
            status: RecordingStatus::Started,
            filename: Some(display_name(&path)),
        });
        Some(path)
    }

    /// Stop and finalize. Resolves once the session is on disk (or discarded).
    ///
    /// No-op (returns `None`) unless Recording. Finalization runs as its own
    /// task, so dropping this future does not leave the recorder Finalizing.
    pub async fn stop(&self) -> Option<PathBuf> {
        let active = {
            let mut active = self.lock_session();
            if !self.transition(RECORDING, FINALIZING) {
                debug!(state = ?self.state(), "stop ignored, not recording");
                return None;
            }
            active.take()
        };

        let state = self.state.clone();
        let events = self.events.clone();
        let finish = self.runtime.spawn(async move {
            let written = match active {
                Some(ActiveSession { path, task }) => match task.await {
                    Ok(written) => written,
                    Err(e) => {
                        error!(error = %e, path = %path.display(), "recording task failed");
                        None
                    }
                },
                None => None,
            };

            state.store(IDLE, Ordering::Release);
            info!(written = ?written, "recording stopped");
            events.publish(Event::RecordingStatus {
                status: RecordingStatus::Stopped,
                filename: written.as_deref().map(display_name),
            });
            written
        });

        match finish.await {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "recording finalization failed");
                self.state.store(IDLE, Ordering::Release);
                None
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Consumer loop; runs on the blocking pool until the state leaves Recording,
/// then drains what is left in the queue and finalizes.
fn consume(
    mut session: RecordingSession,
    queue: &FrameQueue,
    state: &AtomicU8,
    pop_timeout: Duration,
    encoder: &dyn VideoEncoder,
) -> Option<PathBuf> {
    debug!(path = %session.path().display(), "recording consumer started");
    while state.load(Ordering::Acquire) == RECORDING {
        if let Some(frame) = queue.pop_timeout(pop_timeout) {
            session.append(&frame);
        }
    }
    // Frames accepted before the stop still belong to this session
    while let Some(frame) = queue.try_pop() {
        session.append(&frame);
    }
    debug!(frames = session.len(), "recording consumer finalizing");
    session.finalize(encoder)
}
