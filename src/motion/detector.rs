//! Frame-differencing motion detector with a debounce window.
//!
//! Each call blurs the grayscale frame, diffs it against the previous one and
//! looks for a large enough changed region. The reference is replaced on every
//! call. The debounce window only gates the reported value: motion stays
//! reported while the last qualifying detection is at most `debounce` old.

use std::time::{Duration, Instant};

use image::GrayImage;
use tracing::{debug, instrument, warn};

use crate::capture::Frame;
use crate::events::{Event, EventBus};
use crate::motion::mask;
use crate::MotionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionParams {
    pub blur_kernel: u32,
    pub diff_threshold: u8,
    pub min_area: u32,
    pub dilate_iterations: u32,
    pub debounce: Duration,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self::from(&MotionConfig::default())
    }
}

impl From<&MotionConfig> for MotionParams {
    fn from(config: &MotionConfig) -> Self {
        // Gaussian kernels must be odd
        let blur_kernel = if config.blur_kernel % 2 == 0 {
            config.blur_kernel + 1
        } else {
            config.blur_kernel
        };
        Self {
            blur_kernel,
            diff_threshold: config.diff_threshold,
            min_area: config.min_area,
            dilate_iterations: config.dilate_iterations,
            debounce: config.debounce(),
        }
    }
}

pub struct MotionDetector {
    params: MotionParams,
    reference: Option<GrayImage>,
    last_motion: Option<Instant>,
    events: EventBus,
}

impl MotionDetector {
    pub fn new(params: MotionParams, events: EventBus) -> Self {
        Self {
            params,
            reference: None,
            last_motion: None,
            events,
        }
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn last_motion(&self) -> Option<Instant> {
        self.last_motion
    }

    pub fn detect(&mut self, frame: &Frame) -> bool {
        self.detect_at(frame, Instant::now())
    }

    /// Like [`detect`](Self::detect) with an explicit clock.
    #[instrument(level = "trace", skip(self, frame), fields(sequence = frame.sequence()))]
    pub fn detect_at(&mut self, frame: &Frame, now: Instant) -> bool {
        let found = match frame.to_luma() {
            Ok(gray) => {
                let current = mask::blur(&gray, self.params.blur_kernel);
                let found = match &self.reference {
                    Some(reference) if reference.dimensions() == current.dimensions() => {
                        self.changed_region(reference, &current)
                    }
                    Some(_) => {
                        debug!("frame size changed, resetting reference");
                        false
                    }
                    None => false,
                };
                self.reference = Some(current);
                found
            }
            Err(e) => {
                warn!(error = %e, "motion analysis skipped");
                false
            }
        };

        if found {
            self.last_motion = Some(now);
        }

        let motion = self
            .last_motion
            .is_some_and(|at| now.saturating_duration_since(at) <= self.params.debounce);

        self.events.publish(Event::MotionStatus { motion });
        if motion {
            self.events.publish(Event::MotionDetected { motion: true });
        }
        motion
    }

    fn changed_region(&self, reference: &GrayImage, current: &GrayImage) -> bool {
        let diff = mask::diff_mask(reference, current, self.params.diff_threshold);
        let dilated = mask::dilate(&diff, self.params.dilate_iterations);
        mask::has_region_at_least(&dilated, self.params.min_area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use tokio::sync::broadcast::error::TryRecvError;

    const W: u32 = 160;
    const H: u32 = 120;

    fn scene(block: Option<(u32, u32, u32)>, noise_seed: Option<u32>) -> Frame {
        let mut data = Vec::with_capacity((W * H * 3) as usize);
        for y in 0..H {
            for x in 0..W {
                let mut v: i32 = 90;
                if let Some((bx, by, size)) = block {
                    if (bx..bx + size).contains(&x) && (by..by + size).contains(&y) {
                        v = 230;
                    }
                }
                if let Some(seed) = noise_seed {
                    // Deterministic +-4 jitter
                    let h = (x * 7919 + y * 104_729 + seed * 31).wrapping_mul(2_654_435_761);
                    v += (h >> 29) as i32 - 4;
                }
                let v = v.clamp(0, 255) as u8;
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::new(data, W, H, PixelFormat::Bgr24, 0)
    }

    fn detector() -> (MotionDetector, EventBus) {
        let bus = EventBus::new(64);
        (MotionDetector::new(MotionParams::default(), bus.clone()), bus)
    }

    #[test]
    fn cold_start_reports_no_motion_and_sets_reference() {
        let (mut detector, _) = detector();
        assert!(!detector.has_reference());
        assert!(!detector.detect(&scene(Some((10, 10, 60)), None)));
        assert!(detector.has_reference());
    }

    #[test]
    fn identical_frames_report_no_motion() {
        let (mut detector, _) = detector();
        let frame = scene(None, None);
        detector.detect(&frame);
        assert!(!detector.detect(&frame));
        assert!(detector.last_motion().is_none());
    }

    #[test]
    fn large_new_region_is_motion() {
        let (mut detector, _) = detector();
        detector.detect(&scene(None, None));
        assert!(detector.detect(&scene(Some((40, 30, 50)), None)));
    }

    #[test]
    fn small_region_is_ignored() {
        let (mut detector, _) = detector();
        detector.detect(&scene(None, None));
        assert!(!detector.detect(&scene(Some((40, 30, 8)), None)));
    }

    #[test]
    fn sensor_noise_is_not_motion() {
        let (mut detector, _) = detector();
        detector.detect(&scene(None, Some(1)));
        assert!(!detector.detect(&scene(None, Some(2))));
        assert!(!detector.detect(&scene(None, Some(3))));
    }

    #[test]
    fn signal_lapses_exactly_after_debounce_window() {
        let (mut detector, _) = detector();
        let t0 = Instant::now();
        let block = Some((40, 30, 50));

        assert!(!detector.detect_at(&scene(None, None), t0));
        let hit = t0 + Duration::from_millis(100);
        assert!(detector.detect_at(&scene(block, None), hit));

        // Only noise from here on
        assert!(detector.detect_at(&scene(block, Some(1)), hit + Duration::from_secs(2)));
        assert!(detector.detect_at(&scene(block, Some(2)), hit + Duration::from_secs(5)));
        assert!(!detector.detect_at(
            &scene(block, Some(3)),
            hit + Duration::from_secs(5) + Duration::from_millis(1)
        ));
        assert_eq!(detector.last_motion(), Some(hit));
    }

    #[test]
    fn reference_is_replaced_after_a_detection() {
        let (mut detector, _) = detector();
        let t0 = Instant::now();
        let long = Duration::from_secs(60);

        detector.detect_at(&scene(None, None), t0);
        assert!(detector.detect_at(&scene(Some((40, 30, 50)), None), t0));
        // Same scene again, long after the window: nothing new against the updated reference
        assert!(!detector.detect_at(&scene(Some((40, 30, 50)), None), t0 + long));
    }

    #[test]
    fn events_follow_each_call() {
        let (mut detector, bus) = detector();
        let mut rx = bus.subscribe();

        detector.detect(&scene(None, None));
        assert_eq!(rx.try_recv().unwrap(), Event::MotionStatus { motion: false });
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        detector.detect(&scene(Some((40, 30, 50)), None));
        assert_eq!(rx.try_recv().unwrap(), Event::MotionStatus { motion: true });
        assert_eq!(rx.try_recv().unwrap(), Event::MotionDetected { motion: true });
    }

    #[test]
    fn empty_frame_reports_current_state_without_panicking() {
        let (mut detector, _) = detector();
        let empty = Frame::new(Vec::<u8>::new(), 0, 0, PixelFormat::Rgb24, 0);
        assert!(!detector.detect(&empty));
        assert!(!detector.has_reference());
    }
}
