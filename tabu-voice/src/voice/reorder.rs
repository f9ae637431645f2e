//! Reorder buffer for one inbound voice stream
//!
//! Frames are released in sequence order as soon as they are contiguous.
//! A frame that arrives ahead of a gap is held; at most `MAX_HELD_FRAMES`
//! are held, and a held frame is released (skipping the gap) once it has
//! waited `MAX_HOLD_INTERVALS` frame intervals. Late and duplicate frames
//! are dropped.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tabu_common::voice::VOICE_FRAME_DURATION_MS;

// =============================================================================
// Constants
// =============================================================================

/// Maximum frames held while waiting for a missing one
pub const MAX_HELD_FRAMES: usize = 2;

/// Frame intervals a held frame may wait before the gap is skipped
pub const MAX_HOLD_INTERVALS: u32 = 2;

/// Maximum sequence gap before assuming the sender restarted
const MAX_SEQUENCE_GAP: u32 = 100;

/// Longest time a held frame waits
pub fn max_hold() -> Duration {
    Duration::from_millis(u64::from(VOICE_FRAME_DURATION_MS * MAX_HOLD_INTERVALS))
}

// =============================================================================
// Reorder Buffer
// =============================================================================

struct Held<T> {
    item: T,
    since: Instant,
}

/// Reorders one sender's frames by sequence number
pub struct ReorderBuffer<T> {
    /// Frames waiting for a gap to fill, keyed by sequence
    held: BTreeMap<u32, Held<T>>,
    /// Next sequence to release
    next_sequence: Option<u32>,
    /// Frames dropped as late or duplicate
    dropped: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            held: BTreeMap::new(),
            next_sequence: None,
            dropped: 0,
        }
    }

    /// Push a frame
    ///
    /// # Arguments
    /// * `sequence` - Frame sequence number
    /// * `item` - Frame to release in order
    /// * `now` - Arrival time
    ///
    /// # Returns
    /// Frames ready for playback, in sequence order (possibly empty).
    pub fn push(&mut self, sequence: u32, item: T, now: Instant) -> Vec<T> {
        let Some(next) = self.next_sequence else {
            self.next_sequence = Some(sequence.wrapping_add(1));
            return vec![item];
        };

        let ahead = sequence.wrapping_sub(next);
        let behind = next.wrapping_sub(sequence);
        if ahead > MAX_SEQUENCE_GAP && behind > MAX_SEQUENCE_GAP {
            // Sender restarted its counter
            self.reset();
            self.next_sequence = Some(sequence.wrapping_add(1));
            return vec![item];
        }

        if sequence_before(sequence, next) || self.held.contains_key(&sequence) {
            self.dropped += 1;
            return Vec::new();
        }

        if sequence == next {
            self.next_sequence = Some(next.wrapping_add(1));
            let mut ready = vec![item];
            self.drain_contiguous(&mut ready);
            return ready;
        }

        self.held.insert(sequence, Held { item, since: now });

        let mut ready = Vec::new();
        while self.held.len() > MAX_HELD_FRAMES {
            self.skip_gap(&mut ready);
        }
        ready
    }

    /// Release held frames that have waited too long
    pub fn flush_expired(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(sequence) = self.earliest_held() {
            let expired = self
                .held
                .get(&sequence)
                .is_some_and(|h| now.duration_since(h.since) >= max_hold());
            if !expired {
                break;
            }
            self.skip_gap(&mut ready);
        }
        ready
    }

    /// Number of frames currently held
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Frames dropped as late or duplicate
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Clear all held frames and sequence state
    pub fn reset(&mut self) {
        self.held.clear();
        self.next_sequence = None;
    }

    /// Earliest held sequence relative to the next expected one
    fn earliest_held(&self) -> Option<u32> {
        let next = self.next_sequence?;
        self.held
            .keys()
            .copied()
            .min_by_key(|&seq| seq.wrapping_sub(next))
    }

    /// Give up on the missing frame(s) and resume at the earliest held one
    fn skip_gap(&mut self, ready: &mut Vec<T>) {
        let Some(sequence) = self.earliest_held() else {
            return;
        };
        if let Some(held) = self.held.remove(&sequence) {
            ready.push(held.item);
            self.next_sequence = Some(sequence.wrapping_add(1));
            self.drain_contiguous(ready);
        }
    }

    fn drain_contiguous(&mut self, ready: &mut Vec<T>) {
        while let Some(next) = self.next_sequence {
            match self.held.remove(&next) {
                Some(held) => {
                    ready.push(held.item);
                    self.next_sequence = Some(next.wrapping_add(1));
                }
                None => break,
            }
        }
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Check if sequence a comes before sequence b (handling wraparound)
fn sequence_before(a: u32, b: u32) -> bool {
    let diff = b.wrapping_sub(a);
    diff > 0 && diff < (u32::MAX / 2)
}

// =============================================================================
// Tests
// =============================================================================
