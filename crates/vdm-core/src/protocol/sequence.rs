//! Thread-safe frame index counter for encoder pipelines.
//!
//! # What is a frame index? (for beginners)
//!
//! Every encoded video frame a host display emits carries a monotonically
//! increasing integer called its *frame index*.  The receiving decoder uses it
//! to notice when the stream it is fed is not the stream the encoder produced:
//!
//! - **Gaps** – receiving frame 4 right after frame 2 means frame 3 went
//!   missing, and the decoder output will be corrupt until the next key frame.
//! - **Restarts** – receiving frame 0 after frame 812 means the host recreated
//!   its encoder (for example after the client resized the display).
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64` internally.  Encoder output callbacks may run
//! on a codec-owned thread while diagnostics read the counter from another, so
//! an atomic keeps both sides consistent without a lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing counter for frame indices.
///
/// Indices start at 0 and increment by 1 with each call to [`next`](Self::next).
/// The counter wraps around at `u64::MAX` back to 0 without panicking.
///
/// # Examples
///
/// ```rust
/// use vdm_core::protocol::FrameCounter;
///
/// let counter = FrameCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.emitted(), 2);
/// ```
#[derive(Debug)]
pub struct FrameCounter {
    inner: AtomicU64,
}

impl FrameCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next frame index and atomically increments the counter.
    ///
    /// `Ordering::Relaxed` is enough: the index only orders frames, it does
    /// not publish any other memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns how many indices have been handed out so far.
    pub fn emitted(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of checking one received frame index against the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameContinuity {
    /// The index is exactly the one expected.
    InOrder,
    /// The encoder restarted at 0.
    Restarted,
    /// The index skipped ahead or went backwards.
    Discontinuity { expected: u64, received: u64 },
}

/// Receiver-side tracker for frame index continuity.
///
/// Diagnostic only.  A gap or a step back never stops decoding: the frame is
/// still applied, and the pipeline logs the outcome and keeps it as its last
/// fault for the owner to inspect.
///
/// Not thread-safe: it belongs to the single decoder worker of a pipeline.
#[derive(Debug, Default)]
pub struct ContinuityTracker {
    expected: Option<u64>,
}

impl ContinuityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `index` as received and classifies it.
    pub fn observe(&mut self, index: u64) -> FrameContinuity {
        let outcome = match self.expected {
            None => FrameContinuity::InOrder,
            Some(expected) if expected == index => FrameContinuity::InOrder,
            Some(_) if index == 0 => FrameContinuity::Restarted,
            Some(expected) => FrameContinuity::Discontinuity {
                expected,
                received: index,
            },
        };
        self.expected = Some(index.wrapping_add(1));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_frame_counter_starts_at_zero() {
        // Arrange
        let counter = FrameCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 0);
    }

    #[test]
    fn test_frame_counter_wraps_at_u64_max() {
        // Arrange – start the counter one step before overflow
        let counter = FrameCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap, u64::MAX);
        assert_eq!(after_wrap, 0, "counter must wrap to 0 after u64::MAX");
    }

    #[test]
    fn test_frame_counter_hands_out_unique_indices_across_threads() {
        // Arrange
        let counter = Arc::new(FrameCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..500).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
        assert_eq!(counter.emitted(), 2000);
    }

    #[test]
    fn test_continuity_tracker_accepts_consecutive_indices() {
        let mut tracker = ContinuityTracker::new();
        for i in 0..5 {
            assert_eq!(tracker.observe(i), FrameContinuity::InOrder);
        }
    }

    #[test]
    fn test_continuity_tracker_reports_gap() {
        // Arrange
        let mut tracker = ContinuityTracker::new();
        tracker.observe(0);
        tracker.observe(1);

        // Act
        let outcome = tracker.observe(3);

        // Assert
        assert_eq!(
            outcome,
            FrameContinuity::Discontinuity {
                expected: 2,
                received: 3
            }
        );
        assert_eq!(tracker.observe(4), FrameContinuity::InOrder);
    }

    #[test]
    fn test_continuity_tracker_treats_zero_as_restart() {
        let mut tracker = ContinuityTracker::new();
        tracker.observe(10);
        assert_eq!(tracker.observe(0), FrameContinuity::Restarted);
        assert_eq!(tracker.observe(1), FrameContinuity::InOrder);
    }
}
