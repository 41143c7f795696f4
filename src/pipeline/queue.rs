//! Bounded frame queue between the distributor and the recording consumer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};

use crate::Frame;

/// Fixed-capacity MPMC queue that drops new frames when full.
///
/// The producer never blocks: recording favors a live capture loop over a
/// complete recording.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,

    /// Statistics
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Producer: enqueue without blocking. Returns false if the frame was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("campipe_recording_frames_dropped_total").increment(1);
                false
            }
        }
    }

    /// Consumer: wait up to `timeout` for the next frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let frame = self.rx.recv_timeout(timeout).ok()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: next frame if one is already queued.
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Discard every queued frame, returning how many were removed.
    pub fn clear(&self) -> usize {
        self.rx.drain().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 3], 1, 1, PixelFormat::Rgb24, seq)
    }

    #[test]
    fn overflow_drops_new_frames_without_blocking() {
        let queue = FrameQueue::new(3);
        let started = Instant::now();
        let accepted: Vec<bool> = (1..=10).map(|i| queue.push(frame(i))).collect();

        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(accepted.iter().filter(|a| **a).count(), 3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.stats().dropped, 7);

        // Oldest frames survive, in order
        let seqs: Vec<u64> = std::iter::from_fn(|| queue.pop_timeout(Duration::ZERO))
            .map(|f| f.sequence())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = FrameQueue::new(2);
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn clear_discards_stale_frames() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(queue.push(frame(3)));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.push(frame(1)));
        assert!(!queue.push(frame(2)));
    }
}
