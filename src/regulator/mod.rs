//! Outbound rate regulation and batching.
//!
//! One regulator fronts each outbound topic. It buffers message chunks
//! and emits them in FIFO order, grouped so that no emitted series
//! exceeds `max_message_size`, with the emit cadence bounded by
//! `min_wait_time`. The emit callback runs with the regulator's lock
//! held: downstream code must not call back into the same regulator.

mod buffer;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::message::Message;
use crate::tasks::{TaskHandle, TaskPool};

use buffer::RegulatorBuffer;

#[derive(Error, Debug)]
pub enum RegulatorError {
    #[error("Chunk of {size} bytes exceeds the maximum message size of {max}")]
    ChunkTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, RegulatorError>;

/// Controls the latency/size tradeoff for emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// Emit whatever is buffered as early as possible.
    Trickle,
    /// Accumulate until a full message is possible (or the wait elapses).
    Burst,
}

/// Emit callback: `(chunk, remaining_bytes, remaining_chunks)`. The
/// final call in a series carries zero remainders, which is how the
/// downstream assembler knows to publish.
pub type EmitChunkFn = dyn FnMut(&Message, usize, usize) -> bool + Send;

struct Inner {
    buffer: RegulatorBuffer,
    mode: EmitMode,
    emit_chunk: Box<EmitChunkFn>,
    last_emit: Option<Instant>,
    timer: Option<TaskHandle>,
}

pub struct Regulator {
    inner: Arc<Mutex<Inner>>,
    pool: TaskPool,
    min_wait: Duration,
}

impl Regulator {
    /// Creates a regulator emitting at most `max_message_size` bytes per
    /// series, no more often than every `min_wait`. The default emit
    /// mode is [`EmitMode::Trickle`].
    pub fn new(
        max_message_size: usize,
        min_wait: Duration,
        pool: TaskPool,
        emit_chunk: impl FnMut(&Message, usize, usize) -> bool + Send + 'static,
    ) -> Self {
        Regulator {
            inner: Arc::new(Mutex::new(Inner {
                buffer: RegulatorBuffer::new(max_message_size),
                mode: EmitMode::Trickle,
                emit_chunk: Box::new(emit_chunk),
                last_emit: None,
                timer: None,
            })),
            pool,
            min_wait,
        }
    }

    /// Buffers a chunk, taking ownership. Fails only when the chunk by
    /// itself exceeds the maximum message size.
    pub fn write(&self, chunk: Message) -> Result<()> {
        let mut inner = lock_recovering(&self.inner);
        inner.buffer.push_back(chunk)?;

        let due = match inner.mode {
            EmitMode::Trickle => inner
                .last_emit
                .map_or(true, |at| at.elapsed() >= self.min_wait),
            EmitMode::Burst => inner.buffer.can_fill_message(),
        };
        if due || self.min_wait.is_zero() {
            emit_locked(&mut inner);
        }
        if !inner.buffer.is_empty() {
            self.arm_timer(&mut inner);
        }
        Ok(())
    }

    pub fn set_emit_mode(&self, mode: EmitMode) {
        let mut inner = lock_recovering(&self.inner);
        inner.mode = mode;
    }

    /// Drains any queued chunks through `destroy_chunk` and disarms the
    /// emit timer. Each queued chunk is handed over exactly once.
    pub fn destroy(&self, mut destroy_chunk: impl FnMut(Message)) {
        let mut inner = lock_recovering(&self.inner);
        if let Some(timer) = inner.timer.take() {
            self.pool.cancel(timer);
        }
        inner.buffer.clear(&mut destroy_chunk);
    }

    /// Arms the periodic emit timer; it disarms itself once the buffer
    /// drains empty.
    fn arm_timer(&self, inner: &mut Inner) {
        if inner.timer.is_some() || self.min_wait.is_zero() {
            return;
        }
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let pool = self.pool.clone();
        inner.timer = Some(self.pool.schedule_periodic(self.min_wait, move || {
            let Some(inner) = weak.upgrade() else { return };
            let mut inner = lock_recovering(&inner);
            if inner.buffer.is_empty() {
                if let Some(timer) = inner.timer.take() {
                    pool.cancel(timer);
                }
            } else {
                emit_locked(&mut inner);
            }
        }));
    }
}

fn emit_locked(inner: &mut Inner) {
    let Inner {
        buffer,
        emit_chunk,
        last_emit,
        ..
    } = inner;
    if !buffer.is_empty() && buffer.remove_front(emit_chunk) {
        *last_emit = Some(Instant::now());
    }
}

fn lock_recovering(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BinaryMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk(len: usize) -> Message {
        BinaryMessage::new(0, 1, vec![0u8; len]).unwrap().into()
    }

    /// Records (size, remaining_bytes, remaining_chunks) per emit call.
    fn recording_regulator(
        max: usize,
        min_wait: Duration,
    ) -> (Regulator, Arc<Mutex<Vec<(usize, usize, usize)>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let regulator = Regulator::new(max, min_wait, TaskPool::new(), move |c, bytes, chunks| {
            sink.lock().unwrap().push((c.size(), bytes, chunks));
            true
        });
        (regulator, emitted)
    }

    #[test]
    fn test_byte_conservation() {
        let (regulator, emitted) = recording_regulator(64, Duration::ZERO);
        let data_lens = [1usize, 5, 20, 3, 48, 2];
        for len in data_lens {
            regulator.write(chunk(len)).unwrap();
        }
        // Serialised chunk size is data plus the 8-byte stream header.
        let total_in: usize = data_lens.iter().map(|len| len + 8).sum();
        let total_out: usize = emitted.lock().unwrap().iter().map(|(s, _, _)| s).sum();
        assert_eq!(total_in, total_out);
    }

    #[test]
    fn test_no_batch_exceeds_max() {
        let (regulator, emitted) = recording_regulator(40, Duration::ZERO);
        for len in [8usize, 8, 8, 24, 2, 30] {
            regulator.write(chunk(len)).unwrap();
        }
        let mut batch = 0usize;
        for (size, _, chunks) in emitted.lock().unwrap().iter() {
            batch += size;
            assert!(batch <= 40, "batch grew to {batch}");
            if *chunks == 0 {
                batch = 0;
            }
        }
    }

    #[test]
    fn test_oversized_write_fails() {
        let (regulator, emitted) = recording_regulator(16, Duration::ZERO);
        assert!(matches!(
            regulator.write(chunk(16)),
            Err(RegulatorError::ChunkTooLarge { .. })
        ));
        assert!(emitted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_burst_defers_until_full() {
        let (regulator, emitted) = recording_regulator(40, Duration::from_secs(60));
        regulator.set_emit_mode(EmitMode::Burst);
        regulator.write(chunk(4)).unwrap();
        regulator.write(chunk(4)).unwrap();
        assert!(emitted.lock().unwrap().is_empty(), "burst emitted early");
        // Third chunk brings the buffered total to 24 + 16 = 40, enough
        // to fill a message.
        regulator.write(chunk(8)).unwrap();
        let calls = emitted.lock().unwrap().clone();
        assert!(!calls.is_empty(), "burst did not emit when full");
        assert_eq!(calls.last().unwrap().2, 0);
    }

    #[test]
    fn test_trickle_waits_for_min_wait() {
        let (regulator, emitted) = recording_regulator(64, Duration::from_millis(40));
        regulator.write(chunk(1)).unwrap();
        regulator.write(chunk(2)).unwrap();
        // The first write emits immediately; the second must wait for the
        // timer.
        assert_eq!(emitted.lock().unwrap().len(), 1);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(emitted.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_destroy_hands_over_every_chunk() {
        let regulator = Regulator::new(64, Duration::from_secs(60), TaskPool::new(), |_, _, _| {
            panic!("nothing should emit in burst mode")
        });
        regulator.set_emit_mode(EmitMode::Burst);
        regulator.write(chunk(1)).unwrap();
        regulator.write(chunk(2)).unwrap();
        regulator.write(chunk(3)).unwrap();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        regulator.destroy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }
}
