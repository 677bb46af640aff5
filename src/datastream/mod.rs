//! Multi-reader, single-writer circular word buffer.
//!
//! The stream backs microphone capture and compressed speaker playback.
//! Cursors are absolute word indices held in 64-bit atomics that never
//! wrap in practice; only the derived modulo into the ring does. The
//! writer publishes `write_end` before copying and `write_start` after,
//! so readers never consume the in-flight region; readers re-validate
//! their cursor against `write_end` after copying and report an overrun
//! instead of returning clobbered data.
//!
//! `oldest_unconsumed` is the barrier non-overwriting writer policies
//! honour. It is recomputed whenever a reader moves, under
//! `backward_seek_mutex` so that a backwards-seeking reader and the
//! recomputation cannot race.

mod reader;
mod writer;

pub use reader::{DataStreamReader, ReadWaitHandle, ReaderError, ReaderPolicy, SeekReference};
pub use writer::{DataStreamWriter, WriterError, WriterPolicy};

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

/// Close index value meaning "no close scheduled".
const NO_CLOSE_INDEX: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum DataStreamError {
    #[error("Word size must be 1, 2 or 4, got {0}")]
    InvalidWordSize(usize),
    #[error("Buffer must hold at least one word")]
    ZeroCapacity,
    #[error("maxReaders must be at least one")]
    ZeroReaders,
    #[error("A writer is already attached")]
    WriterExists,
    #[error("All {0} reader slots are in use")]
    ReadersExhausted(usize),
}

pub struct DataStream {
    data: Box<[UnsafeCell<u8>]>,
    word_size: usize,
    /// Capacity in words.
    words: u64,
    reader_enabled: Vec<AtomicBool>,
    reader_cursor: Vec<AtomicU64>,
    reader_close_index: Vec<AtomicU64>,
    writer_enabled: AtomicBool,
    write_start: AtomicU64,
    write_end: AtomicU64,
    oldest_unconsumed: AtomicU64,
    backward_seek_mutex: Mutex<()>,
    writer_enable_mutex: Mutex<()>,
    reader_enable_mutex: Mutex<()>,
    /// Blocking readers park here; the writer notifies after publishing.
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

// The raw cells are shared between the writer and readers. All cursor
// coordination is atomic; the cells themselves carry no synchronisation,
// and readers detect (rather than prevent) writer overruns.
unsafe impl Send for DataStream {}
unsafe impl Sync for DataStream {}

impl DataStream {
    /// Creates a stream holding `words` words of `word_size` bytes, with
    /// room for up to `max_readers` simultaneous readers.
    pub fn create(
        words: usize,
        word_size: usize,
        max_readers: usize,
    ) -> Result<Arc<DataStream>, DataStreamError> {
        if !matches!(word_size, 1 | 2 | 4) {
            return Err(DataStreamError::InvalidWordSize(word_size));
        }
        if words == 0 {
            return Err(DataStreamError::ZeroCapacity);
        }
        if max_readers == 0 {
            return Err(DataStreamError::ZeroReaders);
        }
        let mut data = Vec::with_capacity(words * word_size);
        data.resize_with(words * word_size, || UnsafeCell::new(0));
        Ok(Arc::new(DataStream {
            data: data.into_boxed_slice(),
            word_size,
            words: words as u64,
            reader_enabled: (0..max_readers).map(|_| AtomicBool::new(false)).collect(),
            reader_cursor: (0..max_readers).map(|_| AtomicU64::new(0)).collect(),
            reader_close_index: (0..max_readers)
                .map(|_| AtomicU64::new(NO_CLOSE_INDEX))
                .collect(),
            writer_enabled: AtomicBool::new(false),
            write_start: AtomicU64::new(0),
            write_end: AtomicU64::new(0),
            oldest_unconsumed: AtomicU64::new(0),
            backward_seek_mutex: Mutex::new(()),
            writer_enable_mutex: Mutex::new(()),
            reader_enable_mutex: Mutex::new(()),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }))
    }

    /// Capacity in words.
    pub fn data_size(&self) -> u64 {
        self.words
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    pub fn max_readers(&self) -> usize {
        self.reader_enabled.len()
    }

    /// Attaches the single writer. Fails while another writer exists.
    pub fn create_writer(
        self: &Arc<Self>,
        policy: WriterPolicy,
    ) -> Result<DataStreamWriter, DataStreamError> {
        let _guard = lock(&self.writer_enable_mutex);
        if self.writer_enabled.load(Ordering::SeqCst) {
            return Err(DataStreamError::WriterExists);
        }
        self.writer_enabled.store(true, Ordering::SeqCst);
        self.write_end
            .store(self.write_start.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(DataStreamWriter::new(self.clone(), policy))
    }

    /// Attaches a reader at the current write position.
    pub fn create_reader(
        self: &Arc<Self>,
        policy: ReaderPolicy,
    ) -> Result<DataStreamReader, DataStreamError> {
        let _guard = lock(&self.reader_enable_mutex);
        let id = self
            .reader_enabled
            .iter()
            .position(|enabled| !enabled.load(Ordering::SeqCst))
            .ok_or(DataStreamError::ReadersExhausted(self.max_readers()))?;
        self.reader_cursor[id].store(self.write_start.load(Ordering::SeqCst), Ordering::SeqCst);
        self.reader_close_index[id].store(NO_CLOSE_INDEX, Ordering::SeqCst);
        self.reader_enabled[id].store(true, Ordering::SeqCst);
        self.update_oldest_unconsumed();
        Ok(DataStreamReader::new(self.clone(), id, policy))
    }

    /// Count of words after `after` before the ring wraps.
    pub(crate) fn words_until_wrap(&self, after: u64) -> u64 {
        self.words - (after % self.words)
    }

    /// Copies `src` (a whole number of words) into the ring at `index`,
    /// splitting across the wrap when needed.
    pub(crate) fn copy_in(&self, index: u64, src: &[u8]) {
        debug_assert_eq!(src.len() % self.word_size, 0);
        let words = (src.len() / self.word_size) as u64;
        let before_wrap = self.words_until_wrap(index).min(words);
        let split = (before_wrap as usize) * self.word_size;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.cell_ptr(index), split);
            if split < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(split),
                    self.cell_ptr(index + before_wrap),
                    src.len() - split,
                );
            }
        }
    }

    /// Copies words out of the ring at `index` into `dst`.
    pub(crate) fn copy_out(&self, index: u64, dst: &mut [u8]) {
        debug_assert_eq!(dst.len() % self.word_size, 0);
        let words = (dst.len() / self.word_size) as u64;
        let before_wrap = self.words_until_wrap(index).min(words);
        let split = (before_wrap as usize) * self.word_size;
        unsafe {
            std::ptr::copy_nonoverlapping(self.cell_ptr(index), dst.as_mut_ptr(), split);
            if split < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.cell_ptr(index + before_wrap),
                    dst.as_mut_ptr().add(split),
                    dst.len() - split,
                );
            }
        }
    }

    fn cell_ptr(&self, word_index: u64) -> *mut u8 {
        let byte = ((word_index % self.words) as usize) * self.word_size;
        self.data[byte].get()
    }

    /// Recomputes the writer barrier from all enabled reader cursors.
    pub(crate) fn update_oldest_unconsumed(&self) {
        let _guard = lock(&self.backward_seek_mutex);
        self.update_oldest_unconsumed_locked();
    }

    /// Caller must hold `backward_seek_mutex`.
    pub(crate) fn update_oldest_unconsumed_locked(&self) {
        let mut oldest = None;
        for (enabled, cursor) in self.reader_enabled.iter().zip(&self.reader_cursor) {
            if enabled.load(Ordering::SeqCst) {
                let at = cursor.load(Ordering::SeqCst);
                oldest = Some(oldest.map_or(at, |o: u64| o.min(at)));
            }
        }
        let oldest = oldest.unwrap_or_else(|| self.write_start.load(Ordering::SeqCst));
        self.oldest_unconsumed.store(oldest, Ordering::SeqCst);
    }

    pub(crate) fn notify_data_available(&self) {
        let _guard = lock(&self.wait_lock);
        self.wait_cv.notify_all();
    }

    pub(crate) fn disable_reader(&self, id: usize) {
        let _guard = lock(&self.reader_enable_mutex);
        self.reader_enabled[id].store(false, Ordering::SeqCst);
        self.update_oldest_unconsumed();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configurations() {
        assert!(matches!(
            DataStream::create(16, 3, 1),
            Err(DataStreamError::InvalidWordSize(3))
        ));
        assert!(matches!(
            DataStream::create(0, 2, 1),
            Err(DataStreamError::ZeroCapacity)
        ));
        assert!(matches!(
            DataStream::create(16, 2, 0),
            Err(DataStreamError::ZeroReaders)
        ));
    }

    #[test]
    fn test_single_writer_enforced() {
        let stream = DataStream::create(16, 1, 2).unwrap();
        let writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        assert!(matches!(
            stream.create_writer(WriterPolicy::Nonblocking),
            Err(DataStreamError::WriterExists)
        ));
        drop(writer);
        // Closing the writer frees the slot.
        assert!(stream.create_writer(WriterPolicy::Nonblocking).is_ok());
    }

    #[test]
    fn test_reader_slots_exhaust() {
        let stream = DataStream::create(16, 1, 2).unwrap();
        let _a = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();
        let _b = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();
        assert!(matches!(
            stream.create_reader(ReaderPolicy::Nonblocking),
            Err(DataStreamError::ReadersExhausted(2))
        ));
        drop(_a);
        assert!(stream.create_reader(ReaderPolicy::Nonblocking).is_ok());
    }

    #[test]
    fn test_words_until_wrap() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        assert_eq!(stream.words_until_wrap(0), 8);
        assert_eq!(stream.words_until_wrap(5), 3);
        assert_eq!(stream.words_until_wrap(8), 8);
        assert_eq!(stream.words_until_wrap(13), 3);
    }
}
