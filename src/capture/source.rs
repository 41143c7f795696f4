//! Source connector: owns the stream handle, resizes frames, reconnects forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::Frame;
use crate::error::CaptureError;
use crate::CaptureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// A decoder for one stream. `read_frame` returns `Ok(None)` at end of stream.
pub trait StreamBackend: Send {
    fn connect(&mut self, uri: &str) -> Result<(), CaptureError>;
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
    fn release(&mut self);
}

impl<B: StreamBackend + ?Sized> StreamBackend for Box<B> {
    fn connect(&mut self, uri: &str) -> Result<(), CaptureError> {
        (**self).connect(uri)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Cooperative cancellation shared between a loop and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    const SLICE: Duration = Duration::from_millis(20);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps up to `duration`; returns false if stopped meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(Self::SLICE.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub empty_frames: u64,
    pub reconnects: u64,
}

pub struct SourceConnector<B> {
    backend: B,
    uri: String,
    output_size: (u32, u32),
    reconnect_interval: Duration,
    frame_interval: Option<Duration>,
    state: watch::Sender<CaptureState>,
    stats: CaptureStats,
}

impl<B: StreamBackend> SourceConnector<B> {
    pub fn new(backend: B, uri: impl Into<String>, config: &CaptureConfig) -> Self {
        let (state, _) = watch::channel(CaptureState::Disconnected);
        Self {
            backend,
            uri: uri.into(),
            output_size: config.output_size(),
            reconnect_interval: config.reconnect_interval(),
            frame_interval: config.frame_interval(),
            state,
            stats: CaptureStats::default(),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    fn set_state(&self, state: CaptureState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "capture state changed");
        }
    }

    /// Open the stream once.
    pub fn connect(&mut self) -> Result<(), CaptureError> {
        self.set_state(CaptureState::Connecting);
        match self.backend.connect(&self.uri) {
            Ok(()) => {
                info!(uri = %redact(&self.uri), "stream connected");
                self.set_state(CaptureState::Streaming);
                Ok(())
            }
            Err(e) => {
                self.set_state(CaptureState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.state() != CaptureState::Streaming {
            return Err(CaptureError::NotConnected);
        }
        self.backend.read_frame()
    }

    pub fn release(&mut self) {
        self.backend.release();
        self.set_state(CaptureState::Disconnected);
    }

    /// Drop the handle and wait before the next connect attempt.
    fn lose_stream(&mut self, stop: &StopFlag) {
        self.backend.release();
        self.set_state(CaptureState::Reconnecting);
        self.stats.reconnects += 1;
        metrics::counter!("campipe_capture_reconnects_total").increment(1);
        stop.sleep(self.reconnect_interval);
    }

    /// Next usable frame at the output size, or `None` once `stop` is raised.
    ///
    /// Connection failures and lost streams are retried forever at a fixed
    /// interval; empty frames are skipped without reconnecting.
    pub fn next_frame(&mut self, stop: &StopFlag) -> Option<Frame> {
        loop {
            if stop.is_stopped() {
                self.backend.release();
                self.set_state(CaptureState::Stopped);
                return None;
            }

            match self.state() {
                CaptureState::Streaming => {}
                CaptureState::Stopped => return None,
                _ => {
                    if let Err(e) = self.connect() {
                        warn!(error = %e, retry_in = ?self.reconnect_interval, "connect failed");
                        self.lose_stream(stop);
                    }
                    continue;
                }
            }

            match self.backend.read_frame() {
                Ok(Some(frame)) if frame.is_empty() => {
                    self.stats.empty_frames += 1;
                    debug!(sequence = frame.sequence(), "skipping empty frame");
                }
                Ok(Some(frame)) => match frame.resized(self.output_size) {
                    Ok(frame) => {
                        self.stats.frames += 1;
                        return Some(frame);
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable frame"),
                },
                Err(CaptureError::InvalidFrame(reason)) => {
                    self.stats.empty_frames += 1;
                    debug!(%reason, "skipping sample without payload");
                }
                Ok(None) => {
                    warn!("stream ended, reconnecting");
                    self.lose_stream(stop);
                }
                Err(e) => {
                    warn!(error = %e, "stream read failed, reconnecting");
                    self.lose_stream(stop);
                }
            }
        }
    }

    /// Capture loop. Runs until `stop` is raised, then releases the stream.
    #[instrument(skip_all, fields(uri = %redact(&self.uri)))]
    pub fn run(&mut self, stop: &StopFlag, mut on_frame: impl FnMut(Frame)) {
        info!("capture loop started");
        while let Some(frame) = self.next_frame(stop) {
            let started = Instant::now();
            on_frame(frame);

            if let Some(interval) = self.frame_interval {
                let spent = started.elapsed();
                if spent < interval {
                    stop.sleep(interval - spent);
                }
            }
        }
        info!(stats = ?self.stats, "capture loop stopped");
    }
}

/// Hide credentials embedded in a stream URI.
pub fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &uri[..scheme], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}
