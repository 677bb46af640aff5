//! Per-topic reordering of inbound messages.
//!
//! The service assigns every inbound topic an independent 32-bit
//! sequence-number space that wraps to zero. The sequencer accepts
//! messages in arrival order and emits them to the sequenced callback in
//! strictly increasing sequence order, buffering out-of-order arrivals in
//! a bounded slot table. Distances are compared modulo 2^32, never by
//! magnitude, so wraparound is transparent.
//!
//! Calls into a sequencer are serialised by the owner; only the gap
//! timeout runs elsewhere (on the task-pool thread) and must not
//! re-enter the sequencer synchronously.

mod slots;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::tasks::{TaskHandle, TaskPool};

use slots::SlotTable;

/// Sequence numbers at this distance or further ahead of `next_expected`
/// are treated as behind it (already-delivered duplicates).
const HALF_SPACE: u32 = 0x8000_0000;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Sequence number {sequence_number} is beyond the {max_slots}-slot window from {next_expected}")]
    BeyondWindow {
        sequence_number: u32,
        next_expected: u32,
        max_slots: usize,
    },
    #[error("maxSlots may not be zero")]
    ZeroSlots,
}

pub type Result<T> = std::result::Result<T, SequencerError>;

pub struct Sequencer {
    next_expected: u32,
    slots: SlotTable,
    sequence_timeout: Duration,
    pool: TaskPool,
    timer: Option<TaskHandle>,
    /// Bumped whenever the armed timer becomes stale; the timer job only
    /// fires the callback when its captured generation is still current.
    timer_generation: Arc<AtomicU64>,
    on_sequenced: Box<dyn FnMut(u32, Vec<u8>) + Send>,
    on_timeout: Arc<dyn Fn() + Send + Sync>,
}

impl Sequencer {
    /// Creates a sequencer expecting `starting_sequence_number` first.
    /// A zero `sequence_timeout` disables the gap timer.
    pub fn new(
        starting_sequence_number: u32,
        max_slots: usize,
        sequence_timeout: Duration,
        pool: TaskPool,
        on_sequenced: impl FnMut(u32, Vec<u8>) + Send + 'static,
        on_timeout: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self> {
        if max_slots == 0 {
            return Err(SequencerError::ZeroSlots);
        }
        Ok(Sequencer {
            next_expected: starting_sequence_number,
            slots: SlotTable::new(max_slots),
            sequence_timeout,
            pool,
            timer: None,
            timer_generation: Arc::new(AtomicU64::new(0)),
            on_sequenced: Box::new(on_sequenced),
            on_timeout: Arc::new(on_timeout),
        })
    }

    pub fn next_expected_sequence_number(&self) -> u32 {
        self.next_expected
    }

    /// Accepts a message with the given sequence number.
    ///
    /// In-order messages (and any buffered successors they unblock) are
    /// emitted synchronously before this returns. Out-of-order messages
    /// within the slot window are buffered; duplicates are dropped
    /// silently. Messages beyond the window fail without side effects.
    pub fn write(&mut self, sequence_number: u32, data: Vec<u8>) -> Result<()> {
        let distance = sequence_number.wrapping_sub(self.next_expected);
        if distance == 0 {
            self.advance_and_drain(data);
        } else if distance < HALF_SPACE {
            if distance as usize >= self.slots.capacity() {
                return Err(SequencerError::BeyondWindow {
                    sequence_number,
                    next_expected: self.next_expected,
                    max_slots: self.slots.capacity(),
                });
            }
            if self.slots.add(distance as usize, data) {
                log::warn!(
                    "Duplicate buffered message overwritten, sequenceNumber={sequence_number}"
                );
            }
        } else {
            // Behind the window: a duplicate of a message already
            // delivered and drained past. Dropped, never re-delivered.
            log::debug!(
                "Stale duplicate dropped, sequenceNumber={sequence_number}, nextExpected={}",
                self.next_expected
            );
        }
        self.update_gap_timer();
        Ok(())
    }

    /// Resets the next expected sequence number, discarding anything
    /// buffered and cancelling a pending gap timeout.
    pub fn reset_sequence_number(&mut self, next_expected: u32) {
        log::info!(
            "Sequencer reset, nextExpected={next_expected} (was {})",
            self.next_expected
        );
        self.next_expected = next_expected;
        self.slots.clear();
        self.cancel_gap_timer();
    }

    fn advance_and_drain(&mut self, data: Vec<u8>) {
        (self.on_sequenced)(self.next_expected, data);
        self.next_expected = self.next_expected.wrapping_add(1);
        self.slots.shift();
        while self.slots.front_occupied() {
            if let Some(buffered) = self.slots.take_front() {
                (self.on_sequenced)(self.next_expected, buffered);
            }
            self.next_expected = self.next_expected.wrapping_add(1);
            self.slots.shift();
        }
    }

    /// A gap exists whenever messages sit buffered ahead of a missing
    /// head. The timer is one-shot: armed when a gap appears, cancelled
    /// when it closes, replaced by the next gap.
    fn update_gap_timer(&mut self) {
        if self.slots.occupied() > 0 {
            if self.timer.is_none() && !self.sequence_timeout.is_zero() {
                let generation = self.timer_generation.load(Ordering::SeqCst);
                let generation_ref = self.timer_generation.clone();
                let on_timeout = self.on_timeout.clone();
                self.timer = Some(self.pool.schedule_once(self.sequence_timeout, move || {
                    if generation_ref.load(Ordering::SeqCst) == generation {
                        on_timeout();
                    }
                }));
            }
        } else {
            self.cancel_gap_timer();
        }
    }

    fn cancel_gap_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.timer_generation.fetch_add(1, Ordering::SeqCst);
            self.pool.cancel(timer);
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.cancel_gap_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(u32, Vec<u8>) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |seq, _data| sink.lock().unwrap().push(seq))
    }

    fn sequencer(
        start: u32,
        max_slots: usize,
        timeout: Duration,
        timeouts: Arc<AtomicUsize>,
    ) -> (Sequencer, Arc<Mutex<Vec<u32>>>) {
        let (seen, sink) = collector();
        let seq = Sequencer::new(start, max_slots, timeout, TaskPool::new(), sink, move || {
            timeouts.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (seq, seen)
    }

    #[test]
    fn test_in_order_emission() {
        let (mut seq, seen) = sequencer(1, 8, Duration::ZERO, Arc::new(AtomicUsize::new(0)));
        for n in 1..=5 {
            seq.write(n, vec![n as u8]).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_permutations_emit_in_order() {
        for perm in [
            vec![10, 12, 11, 13],
            vec![13, 12, 11, 10],
            vec![11, 13, 10, 12],
            vec![12, 10, 13, 11],
        ] {
            let (mut seq, seen) = sequencer(10, 8, Duration::ZERO, Arc::new(AtomicUsize::new(0)));
            for n in perm {
                seq.write(n, vec![]).unwrap();
            }
            assert_eq!(*seen.lock().unwrap(), vec![10, 11, 12, 13]);
        }
    }

    #[test]
    fn test_duplicates_emit_once() {
        let (mut seq, seen) = sequencer(0, 8, Duration::ZERO, Arc::new(AtomicUsize::new(0)));
        seq.write(1, vec![]).unwrap();
        seq.write(1, vec![]).unwrap();
        seq.write(0, vec![]).unwrap();
        seq.write(0, vec![]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_beyond_window_fails_without_side_effects() {
        let (mut seq, seen) = sequencer(0, 8, Duration::ZERO, Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            seq.write(8, vec![]),
            Err(SequencerError::BeyondWindow { .. })
        ));
        seq.write(0, vec![]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(seq.next_expected_sequence_number(), 1);
    }

    #[test]
    fn test_wraparound() {
        let (mut seq, seen) = sequencer(
            0xFFFF_FFFE,
            8,
            Duration::ZERO,
            Arc::new(AtomicUsize::new(0)),
        );
        seq.write(0xFFFF_FFFE, vec![]).unwrap();
        seq.write(0xFFFF_FFFF, vec![]).unwrap();
        seq.write(0x0000_0000, vec![]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0xFFFF_FFFE, 0xFFFF_FFFF, 0]);
    }

    #[test]
    fn test_out_of_order_wraparound() {
        let (mut seq, seen) = sequencer(
            0xFFFF_FFFE,
            8,
            Duration::ZERO,
            Arc::new(AtomicUsize::new(0)),
        );
        seq.write(0x0000_0000, vec![]).unwrap();
        seq.write(0xFFFF_FFFF, vec![]).unwrap();
        seq.write(0xFFFF_FFFE, vec![]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0xFFFF_FFFE, 0xFFFF_FFFF, 0]);
    }

    #[test]
    fn test_gap_timeout_fires() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (mut seq, _seen) = sequencer(0, 8, Duration::from_millis(30), timeouts.clone());
        seq.write(2, vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gap_timeout_cancelled_when_gap_closes() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (mut seq, seen) = sequencer(0, 8, Duration::from_millis(60), timeouts.clone());
        seq.write(1, vec![]).unwrap();
        seq.write(0, vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_zero_timeout_disables_timer() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (mut seq, _seen) = sequencer(0, 8, Duration::ZERO, timeouts.clone());
        seq.write(3, vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_discards_buffered() {
        let (mut seq, seen) = sequencer(0, 8, Duration::ZERO, Arc::new(AtomicUsize::new(0)));
        seq.write(2, vec![]).unwrap();
        seq.reset_sequence_number(10);
        seq.write(10, vec![]).unwrap();
        // The buffered message for 2 must not re-appear.
        assert_eq!(*seen.lock().unwrap(), vec![10]);
    }
}
