//! Top-level controller: pre-flight, capture lifecycle, recording and commands.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{self, CaptureState, SourceConnector, StopFlag, StreamBackend};
use crate::control::{self, Command, CommandReply, PtzControl, Request};
use crate::error::{CaptureError, CommandError};
use crate::events::EventBus;
use crate::motion::{MotionDetector, MotionParams};
use crate::pipeline::distributor::FrameDistributor;
use crate::pipeline::preflight::{self, PreflightReport};
use crate::recording::{self, Recorder, VideoEncoder};
use crate::Config;

/// Opens a fresh backend for a stream URI.
pub type BackendFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn StreamBackend>, CaptureError> + Send + Sync>;

struct CaptureTask {
    stop: StopFlag,
    state: watch::Receiver<CaptureState>,
    task: JoinHandle<()>,
}

pub struct PipelineBuilder {
    config: Config,
    control: PtzControl,
    encoder: Option<Arc<dyn VideoEncoder>>,
    backends: Option<BackendFactory>,
    events: Option<EventBus>,
}

impl PipelineBuilder {
    pub fn control(mut self, control: PtzControl) -> Self {
        self.control = control;
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn VideoEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn backends(mut self, backends: BackendFactory) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Pipeline {
        let config = self.config;
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.events.capacity));
        let encoder = self.encoder.unwrap_or_else(recording::default_encoder);
        let backends = self.backends.unwrap_or_else(|| {
            let capture = config.capture.clone();
            Arc::new(move |uri: &str| capture::open_backend(uri, &capture))
        });

        let recorder = Arc::new(Recorder::new(&config.recording, encoder, events.clone()));
        let detector = MotionDetector::new(MotionParams::from(&config.motion), events.clone());
        let distributor = Arc::new(FrameDistributor::new(
            &config.capture,
            events.clone(),
            recorder.clone(),
            detector,
        ));

        Pipeline {
            config,
            events,
            recorder,
            distributor,
            control: self.control,
            backends,
            preflight: Mutex::new(None),
            capture: Mutex::new(None),
        }
    }
}

pub struct Pipeline {
    config: Config,
    events: EventBus,
    recorder: Arc<Recorder>,
    distributor: Arc<FrameDistributor>,
    control: PtzControl,
    backends: BackendFactory,
    preflight: Mutex<Option<PreflightReport>>,
    capture: Mutex<Option<CaptureTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder {
            config,
            control: PtzControl::NotConfigured,
            encoder: None,
            backends: None,
            events: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Run the connectivity check and remember its outcome.
    pub async fn preflight(&self) -> PreflightReport {
        let report =
            preflight::run_preflight(&self.config, |uri| (self.backends)(uri), &self.control).await;
        *lock(&self.preflight) = Some(report.clone());
        report
    }

    /// Pre-flight, then start capture if it passed. A failed check leaves the pipeline unarmed.
    pub async fn arm(&self) -> PreflightReport {
        let report = self.preflight().await;
        if !report.is_ok() {
            warn!(status = report.status.code(), hint = ?report.hint, "pipeline not armed");
            return report;
        }
        if let Err(e) = self.start_capture() {
            warn!(error = %e, "failed to start capture");
            let report = PreflightReport::unreachable(e.to_string());
            *lock(&self.preflight) = Some(report.clone());
            return report;
        }
        report
    }

    pub fn last_preflight(&self) -> Option<PreflightReport> {
        lock(&self.preflight).clone()
    }

    /// Spawn the capture loop. No-op if it is already running.
    pub fn start_capture(&self) -> Result<(), CaptureError> {
        let mut capture = lock(&self.capture);
        if capture.is_some() {
            debug!("capture already running");
            return Ok(());
        }

        let uri = self.config.camera.stream_url();
        let backend = (self.backends)(&uri)?;
        let mut connector = SourceConnector::new(backend, uri, &self.config.capture);
        let state = connector.watch_state();
        let stop = StopFlag::new();

        let distributor = self.distributor.clone();
        let loop_stop = stop.clone();
        let task = tokio::task::spawn_blocking(move || {
            connector.run(&loop_stop, |frame| distributor.on_frame(frame));
        });

        *capture = Some(CaptureTask { stop, state, task });
        info!("capture started");
        Ok(())
    }

    /// Cooperative stop; resolves once the source handle is released.
    pub async fn stop_capture(&self) {
        let Some(CaptureTask { stop, task, .. }) = lock(&self.capture).take() else {
            return;
        };
        stop.stop();
        if let Err(e) = task.await {
            warn!(error = %e, "capture task failed");
        }
        self.distributor.join_detection().await;
        info!("capture stopped");
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.capture).is_some()
    }

    pub fn capture_state(&self) -> CaptureState {
        match lock(&self.capture).as_ref() {
            Some(capture) => *capture.state.borrow(),
            None => CaptureState::Disconnected,
        }
    }

    /// Begin recording at the configured size and rate. `None` if already recording.
    pub fn start_recording(&self) -> Option<PathBuf> {
        self.recorder
            .start(self.config.recording.frame_size(), self.config.recording.fps)
    }

    /// Stop and finalize. Returns the written file, if any.
    pub async fn stop_recording(&self) -> Option<PathBuf> {
        self.recorder.stop().await
    }

    pub async fn handle_command(&self, command: Command) -> Result<CommandReply, CommandError> {
        match command {
            Command::StartRecording => {
                if !self.is_capturing() {
                    return Err(CommandError::NotArmed);
                }
                Ok(match self.start_recording() {
                    Some(path) => CommandReply::RecordingStarted {
                        filename: file_name(&path),
                    },
                    None => CommandReply::Ignored {
                        reason: "already_recording",
                    },
                })
            }
            Command::StopRecording => {
                if !self.recorder.is_recording() {
                    return Ok(CommandReply::Ignored {
                        reason: "not_recording",
                    });
                }
                let written = self.stop_recording().await;
                Ok(CommandReply::RecordingStopped {
                    filename: written.as_deref().map(file_name),
                })
            }
            Command::Move { direction, step } => {
                let (direction, step) = control::parse_move(direction.as_deref(), step)?;
                let ptz = self.control.clone();
                tokio::task::spawn_blocking(move || ptz.move_camera(direction, step))
                    .await
                    .map_err(|e| CommandError::Ptz(e.to_string()))??;
                Ok(CommandReply::Moved { direction, step })
            }
        }
    }

    /// Serve the command inbox until every sender is dropped.
    pub async fn run_inbox(&self, inbox: flume::Receiver<Request>) {
        while let Ok(Request { command, reply }) = inbox.recv_async().await {
            debug!(?command, "command received");
            let result = self.handle_command(command).await;
            if let Err(e) = &result {
                warn!(reason = e.reason(), error = %e, "command rejected");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
    }

    /// Finalize any recording, stop capture and wait for background work.
    pub async fn shutdown(&self) {
        self.stop_recording().await;
        self.stop_capture().await;
        self.distributor.join_detection().await;
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
