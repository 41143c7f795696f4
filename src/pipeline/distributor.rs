//! Fan-out of captured frames to live view, recording and motion detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::prelude::*;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::capture::Frame;
use crate::error::EncodeError;
use crate::events::{Event, EventBus};
use crate::motion::MotionDetector;
use crate::recording::Recorder;
use crate::CaptureConfig;

/// Lossy JPEG of `frame` at `size`, base64 encoded.
pub fn encode_live_frame(frame: &Frame, size: (u32, u32), quality: u8) -> Result<String, EncodeError> {
    let scaled = frame.resized(size)?;
    let (width, height) = scaled.dimensions();

    let mut jpeg = Vec::with_capacity(scaled.data.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode(
        &scaled.data,
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;

    Ok(BASE64_STANDARD.encode(jpeg))
}

/// Clears the in-flight flag when the detection pass ends, even by panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FrameDistributor {
    events: EventBus,
    recorder: Arc<Recorder>,
    detector: Arc<Mutex<MotionDetector>>,
    detecting: Arc<AtomicBool>,
    detection_task: Mutex<Option<JoinHandle<()>>>,
    live_size: (u32, u32),
    jpeg_quality: u8,
    runtime: Handle,
}

impl FrameDistributor {
    /// Must be called inside a Tokio runtime; detection passes run on it.
    pub fn new(
        config: &CaptureConfig,
        events: EventBus,
        recorder: Arc<Recorder>,
        detector: MotionDetector,
    ) -> Self {
        Self {
            events,
            recorder,
            detector: Arc::new(Mutex::new(detector)),
            detecting: Arc::new(AtomicBool::new(false)),
            detection_task: Mutex::new(None),
            live_size: config.live_size(),
            jpeg_quality: config.jpeg_quality,
            runtime: Handle::current(),
        }
    }

    /// Called by the capture loop once per frame, in capture order.
    pub fn on_frame(&self, frame: Frame) {
        metrics::counter!("campipe_frames_captured_total").increment(1);

        match encode_live_frame(&frame, self.live_size, self.jpeg_quality) {
            Ok(payload) => self.events.publish(Event::VideoFrame { frame: payload }),
            Err(e) => {
                warn!(sequence = frame.sequence(), error = %e, "failed to encode live frame");
                metrics::counter!("campipe_live_encode_failures_total").increment(1);
            }
        }

        if self.recorder.is_recording() && !self.recorder.offer(frame.clone()) {
            trace!(sequence = frame.sequence(), "recording queue full, frame dropped");
        }

        self.dispatch_motion(frame);
    }

    /// At most one detection pass in flight; frames arriving meanwhile are not analyzed.
    fn dispatch_motion(&self, frame: Frame) {
        if self
            .detecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::counter!("campipe_motion_frames_skipped_total").increment(1);
            return;
        }

        let guard = InFlight(self.detecting.clone());
        let detector = self.detector.clone();
        let task = self.runtime.spawn_blocking(move || {
            let _guard = guard;
            let mut detector = detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            detector.detect(&frame);
        });

        // The previous pass has already finished, so its handle can be replaced
        *self.lock_task() = Some(task);
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.detection_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting.load(Ordering::Acquire)
    }

    /// Wait for the in-flight detection pass, if any.
    pub async fn join_detection(&self) {
        let task = self.lock_task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "motion detection task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::motion::MotionParams;
    use crate::recording::GifSequenceEncoder;
    use crate::RecordingConfig;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![(seq % 255) as u8; 64 * 48 * 3], 64, 48, PixelFormat::Rgb24, seq)
    }

    fn setup(dir: &std::path::Path) -> (FrameDistributor, Arc<Recorder>, EventBus) {
        let events = EventBus::new(256);
        let recording = RecordingConfig {
            output_dir: dir.to_path_buf(),
            queue_capacity: 2,
            pop_timeout_ms: 10,
            ..RecordingConfig::default()
        };
        let recorder = Arc::new(Recorder::new(
            &recording,
            Arc::new(GifSequenceEncoder::default()),
            events.clone(),
        ));
        let capture = CaptureConfig {
            width: 64,
            height: 48,
            live_width: Some(32),
            live_height: Some(24),
            ..CaptureConfig::default()
        };
        let detector = MotionDetector::new(MotionParams::default(), events.clone());
        let distributor = FrameDistributor::new(&capture, events.clone(), recorder.clone(), detector);
        (distributor, recorder, events)
    }

    #[test]
    fn live_frame_is_base64_jpeg_at_live_size() {
        let payload = encode_live_frame(&frame(1), (32, 24), 80).unwrap();
        let jpeg = BASE64_STANDARD.decode(payload).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[tokio::test]
    async fn frames_reach_live_view_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (distributor, _, events) = setup(dir.path());
        let mut rx = events.subscribe();

        for seq in 1..=3 {
            distributor.on_frame(frame(seq));
            distributor.join_detection().await;
        }

        let mut live = 0;
        while let Ok(event) = rx.try_recv() {
            if let Event::VideoFrame { .. } = event {
                live += 1;
            }
        }
        assert_eq!(live, 3);
    }

    #[tokio::test]
    async fn frames_are_not_queued_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (distributor, recorder, _) = setup(dir.path());

        distributor.on_frame(frame(1));
        distributor.join_detection().await;
        assert!(recorder.queue().is_empty());
        assert_eq!(recorder.queue().stats().written, 0);
    }

    #[tokio::test]
    async fn full_recording_queue_never_blocks_capture() {
        let dir = tempfile::tempdir().unwrap();
        let (distributor, recorder, _) = setup(dir.path());

        recorder.start((64, 48), 15).unwrap();
        let started = std::time::Instant::now();
        for seq in 1..=50 {
            distributor.on_frame(frame(seq));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(recorder.queue().len() <= recorder.queue().capacity());

        distributor.join_detection().await;
        recorder.stop().await;
    }

    #[tokio::test]
    async fn only_one_detection_pass_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (distributor, _, events) = setup(dir.path());
        let mut rx = events.subscribe();

        // Hold the detector so the first pass cannot finish
        let held = distributor.detector.clone();
        let lock = held.lock().unwrap();
        distributor.on_frame(frame(1));
        assert!(distributor.is_detecting());
        distributor.on_frame(frame(2));
        distributor.on_frame(frame(3));
        drop(lock);

        distributor.join_detection().await;
        assert!(!distributor.is_detecting());

        let statuses = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, Event::MotionStatus { .. }))
            .count();
        assert_eq!(statuses, 1);
    }
}
