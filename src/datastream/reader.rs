use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::{lock, DataStream, NO_CLOSE_INDEX};

/// Governs what a reader does when no data is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderPolicy {
    /// Wait until data arrives (or an explicit timeout elapses).
    Blocking,
    /// Return immediately with whatever is there.
    Nonblocking,
    /// Like `Nonblocking`, but exposes a wait handle to poll on.
    NonblockingPollable,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Reader is closed")]
    Closed,
    #[error("Writer overran this reader")]
    Overrun,
    #[error("No data available")]
    WouldBlock,
    #[error("Timed out waiting for data")]
    Timeout,
    #[error("Invalid read request")]
    InvalidArg,
}

/// Where a seek offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekReference {
    /// An absolute word index.
    Absolute,
    /// Signed displacement from the reader's current position.
    Relative,
    /// Backwards from the writer's current position.
    BeforeWriter,
    /// Forwards from the reader's current position.
    AfterReader,
}

pub struct DataStreamReader {
    stream: Arc<DataStream>,
    id: usize,
    policy: ReaderPolicy,
}

impl DataStreamReader {
    pub(crate) fn new(stream: Arc<DataStream>, id: usize, policy: ReaderPolicy) -> Self {
        DataStreamReader { stream, id, policy }
    }

    pub fn policy(&self) -> ReaderPolicy {
        self.policy
    }

    pub fn word_size(&self) -> usize {
        self.stream.word_size()
    }

    /// Absolute index of the next word to read.
    pub fn tell(&self) -> u64 {
        self.stream.reader_cursor[self.id].load(Ordering::SeqCst)
    }

    /// Reads up to `buf` worth of words. Blocking readers wait for data
    /// indefinitely; see [`read_timeout`](Self::read_timeout) for a bounded
    /// wait. Returns the words read, or `Ok(0)` once a scheduled close
    /// index is reached.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReaderError> {
        self.read_inner(buf, None)
    }

    /// Like [`read`](Self::read), but a blocking reader gives up with
    /// [`ReaderError::Timeout`] after `timeout`.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ReaderError> {
        self.read_inner(buf, Some(timeout))
    }

    fn read_inner(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, ReaderError> {
        let stream = self.stream.clone();
        let word_size = stream.word_size();
        if buf.is_empty() || buf.len() % word_size != 0 {
            return Err(ReaderError::InvalidArg);
        }
        if !stream.reader_enabled[self.id].load(Ordering::SeqCst) {
            return Err(ReaderError::Closed);
        }
        let wanted = (buf.len() / word_size) as u64;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let cursor = self.tell();
            let close_index = stream.reader_close_index[self.id].load(Ordering::SeqCst);
            if cursor >= close_index {
                return Ok(0);
            }
            let write_start = stream.write_start.load(Ordering::SeqCst);
            let available = write_start.saturating_sub(cursor);
            if available == 0 {
                match self.policy {
                    ReaderPolicy::Blocking => {
                        if !self.wait_for_data(cursor, deadline) {
                            return Err(ReaderError::Timeout);
                        }
                        continue;
                    }
                    _ => return Err(ReaderError::WouldBlock),
                }
            }

            // The writer may already have lapped us.
            if stream.write_end.load(Ordering::SeqCst).saturating_sub(cursor) > stream.data_size() {
                return Err(ReaderError::Overrun);
            }

            let to_read = wanted.min(available).min(close_index - cursor);
            stream.copy_out(cursor, &mut buf[..(to_read as usize) * word_size]);

            // Re-validate: if the writer overwrote the copied region
            // mid-copy the data is torn and must not be surfaced.
            if stream.write_end.load(Ordering::SeqCst).saturating_sub(cursor) > stream.data_size() {
                return Err(ReaderError::Overrun);
            }

            stream.reader_cursor[self.id].store(cursor + to_read, Ordering::SeqCst);
            stream.update_oldest_unconsumed();
            return Ok(to_read as usize);
        }
    }

    /// Moves the read cursor. Backward seeks are validated against the
    /// writer so the reader cannot land on already-overwritten words,
    /// and are serialised with the barrier recomputation.
    pub fn seek(&mut self, offset: i64, reference: SeekReference) -> Result<(), ReaderError> {
        let stream = self.stream.clone();
        if !stream.reader_enabled[self.id].load(Ordering::SeqCst) {
            return Err(ReaderError::Closed);
        }
        let cursor = self.tell();
        let write_start = stream.write_start.load(Ordering::SeqCst);
        let target = match reference {
            SeekReference::Absolute => u64::try_from(offset).map_err(|_| ReaderError::InvalidArg)?,
            SeekReference::Relative => cursor
                .checked_add_signed(offset)
                .ok_or(ReaderError::InvalidArg)?,
            SeekReference::AfterReader => {
                let offset = u64::try_from(offset).map_err(|_| ReaderError::InvalidArg)?;
                cursor.checked_add(offset).ok_or(ReaderError::InvalidArg)?
            }
            SeekReference::BeforeWriter => {
                let offset = u64::try_from(offset).map_err(|_| ReaderError::InvalidArg)?;
                write_start.checked_sub(offset).ok_or(ReaderError::InvalidArg)?
            }
        };

        if target >= cursor {
            // Forward (or no-op) seeks cannot race the barrier.
            stream.reader_cursor[self.id].store(target, Ordering::SeqCst);
            stream.update_oldest_unconsumed();
        } else {
            let _guard = lock(&stream.backward_seek_mutex);
            let write_end = stream.write_end.load(Ordering::SeqCst);
            if write_end.saturating_sub(target) > stream.data_size() {
                // The sought-to words are no longer in the buffer.
                return Err(ReaderError::Overrun);
            }
            stream.reader_cursor[self.id].store(target, Ordering::SeqCst);
            stream.update_oldest_unconsumed_locked();
        }
        Ok(())
    }

    /// Schedules this reader to reach end-of-stream once its cursor
    /// arrives at `index`; reads then return `Ok(0)`.
    pub fn close_at(&mut self, index: u64) {
        self.stream.reader_close_index[self.id].store(index, Ordering::SeqCst);
    }

    /// Clears a previously scheduled close.
    pub fn reopen(&mut self) {
        self.stream.reader_close_index[self.id].store(NO_CLOSE_INDEX, Ordering::SeqCst);
    }

    /// Wait handle for `NonblockingPollable` readers; `None` otherwise.
    pub fn wait_handle(&self) -> Option<ReadWaitHandle> {
        match self.policy {
            ReaderPolicy::NonblockingPollable => Some(ReadWaitHandle {
                stream: self.stream.clone(),
                id: self.id,
            }),
            _ => None,
        }
    }

    /// Waits on the stream's condvar until new data is published past
    /// `cursor`. Returns `false` on deadline expiry.
    fn wait_for_data(&self, cursor: u64, deadline: Option<Instant>) -> bool {
        let stream = &self.stream;
        let mut guard = lock(&stream.wait_lock);
        loop {
            if stream.write_start.load(Ordering::SeqCst) > cursor {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (g, result) = stream
                        .wait_cv
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard = g;
                    if result.timed_out()
                        && stream.write_start.load(Ordering::SeqCst) <= cursor
                    {
                        return false;
                    }
                }
                None => {
                    guard = stream
                        .wait_cv
                        .wait(guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }
}

impl Drop for DataStreamReader {
    fn drop(&mut self) {
        self.stream.disable_reader(self.id);
    }
}

/// Lets a `NonblockingPollable` reader's owner wait for data without
/// holding the reader itself.
pub struct ReadWaitHandle {
    stream: Arc<DataStream>,
    id: usize,
}

impl ReadWaitHandle {
    /// Returns `true` once data is available for the reader, `false` on
    /// timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.stream.wait_lock);
        loop {
            let cursor = self.stream.reader_cursor[self.id].load(Ordering::SeqCst);
            if self.stream.write_start.load(Ordering::SeqCst) > cursor {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .stream
                .wait_cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastream::{DataStream, WriterPolicy};

    #[test]
    fn test_round_trip() {
        let stream = DataStream::create(16, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Blocking).unwrap();

        let data: Vec<u8> = (0..10).collect();
        assert_eq!(writer.write(&data).unwrap(), 10);

        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn test_round_trip_across_wrap() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        let mut buf = [0u8; 8];
        // Fill and drain repeatedly so the cursors wrap several times.
        for round in 0u8..5 {
            let data = [round; 6];
            assert_eq!(writer.write(&data).unwrap(), 6);
            assert_eq!(reader.read(&mut buf[..6]).unwrap(), 6);
            assert_eq!(&buf[..6], &data[..]);
        }
    }

    #[test]
    fn test_nonblocking_would_block_when_empty() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let _writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(ReaderError::WouldBlock));
    }

    #[test]
    fn test_blocking_read_times_out() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let _writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Blocking).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            reader.read_timeout(&mut buf, Duration::from_millis(30)),
            Err(ReaderError::Timeout)
        );
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Blocking).unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let n = reader.read_timeout(&mut buf, Duration::from_secs(5)).unwrap();
            buf[..n].to_vec()
        });
        std::thread::sleep(Duration::from_millis(30));
        writer.write(&[7, 8, 9]).unwrap();
        assert_eq!(handle.join().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn test_overrun_detected() {
        let stream = DataStream::create(4, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblockable).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        // Writer laps the reader twice over.
        writer.write(&[1, 2, 3, 4]).unwrap();
        writer.write(&[5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(ReaderError::Overrun));

        // Recover by seeking to the freshest data.
        reader.seek(0, SeekReference::BeforeWriter).unwrap();
        assert_eq!(reader.tell(), 8);
    }

    #[test]
    fn test_close_at_gives_eof() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        writer.write(&[1, 2, 3, 4]).unwrap();
        reader.close_at(2);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_seek_references() {
        let stream = DataStream::create(16, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();
        writer.write(&[0; 10]).unwrap();

        reader.seek(4, SeekReference::Absolute).unwrap();
        assert_eq!(reader.tell(), 4);
        reader.seek(3, SeekReference::AfterReader).unwrap();
        assert_eq!(reader.tell(), 7);
        reader.seek(-5, SeekReference::Relative).unwrap();
        assert_eq!(reader.tell(), 2);
        reader.seek(1, SeekReference::BeforeWriter).unwrap();
        assert_eq!(reader.tell(), 9);
        assert_eq!(
            reader.seek(-10, SeekReference::Relative),
            Err(ReaderError::InvalidArg)
        );
    }

    #[test]
    fn test_backward_seek_respects_overwritten_data() {
        let stream = DataStream::create(4, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblockable).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        writer.write(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        reader.read(&mut buf).unwrap();
        writer.write(&[5, 6]).unwrap();

        // Words 0 and 1 are gone; seeking back to 0 must fail.
        assert_eq!(
            reader.seek(0, SeekReference::Absolute),
            Err(ReaderError::Overrun)
        );
        // Word 2 is still present.
        reader.seek(2, SeekReference::Absolute).unwrap();
        assert_eq!(reader.read(&mut buf[..1]).unwrap(), 1);
        assert_eq!(buf[0], 3);
    }

    #[test]
    fn test_oldest_unconsumed_tracks_slowest_reader() {
        let stream = DataStream::create(8, 1, 2).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let mut fast = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();
        let _slow = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        writer.write(&[0; 8]).unwrap();
        let mut buf = [0u8; 8];
        fast.read(&mut buf).unwrap();

        // The slow reader still pins the buffer: nothing can be written.
        assert_eq!(writer.write(&[1; 4]).unwrap(), 0);
    }

    #[test]
    fn test_pollable_wait_handle() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let reader = stream.create_reader(ReaderPolicy::NonblockingPollable).unwrap();
        let handle = reader.wait_handle().unwrap();

        assert!(!handle.wait(Duration::from_millis(20)));
        writer.write(&[1]).unwrap();
        assert!(handle.wait(Duration::from_millis(200)));
    }
}
