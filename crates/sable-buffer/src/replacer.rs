//! Page replacement policy for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Clock replacement algorithm.
///
/// Uses atomic reference bits for lock-free access recording; only the
/// clock hand is behind a mutex. Whether a frame may actually be evicted
/// (pin count, latch state) is decided by the caller through the victim
/// predicate, so the replacer itself tracks no evictable set.
pub struct ClockReplacer {
    /// Number of frames.
    num_frames: usize,
    /// Reference bits for each frame (atomic for lock-free access).
    reference_bits: Vec<AtomicBool>,
    /// Current clock hand position.
    clock_hand: Mutex<usize>,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        let reference_bits: Vec<AtomicBool> =
            (0..num_frames).map(|_| AtomicBool::new(false)).collect();

        Self {
            num_frames,
            reference_bits,
            clock_hand: Mutex::new(0),
        }
    }

    /// Returns the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    /// Records that the given frame was accessed (sets its reference bit).
    #[inline]
    pub fn record_access(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(true, Ordering::Relaxed);
        }
    }

    /// Selects and claims a victim frame for eviction.
    ///
    /// `try_claim` must atomically take ownership of the frame (pin it)
    /// and return whether it succeeded; it is only invoked on frames that
    /// have spent their second chance, so a true return means the caller
    /// owns exactly the frame handed back. Returns None if nothing could
    /// be claimed within two full rotations of the clock hand.
    pub fn evict<F>(&self, try_claim: F) -> Option<FrameId>
    where
        F: Fn(FrameId) -> bool,
    {
        if self.num_frames == 0 {
            return None;
        }

        let mut hand = self.clock_hand.lock();

        // Make at most 2 full rotations: the first clears reference bits,
        // the second finds a frame whose bit is already clear.
        for _ in 0..(2 * self.num_frames) {
            let idx = *hand;
            let frame_id = FrameId(idx as u32);
            *hand = (idx + 1) % self.num_frames;

            if self.reference_bits[idx].load(Ordering::Relaxed) {
                // Second chance: clear the bit and continue
                self.reference_bits[idx].store(false, Ordering::Relaxed);
                continue;
            }

            if try_claim(frame_id) {
                return Some(frame_id);
            }
        }

        None
    }

    /// Removes a frame from consideration (clears its reference bit).
    pub fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(false, Ordering::Relaxed);
        }
    }
}
