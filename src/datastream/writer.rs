use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use super::{lock, DataStream};

/// Governs what the writer does when readers have not kept up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPolicy {
    /// Write unconditionally, overwriting slow readers. Readers detect
    /// the overrun on their next read.
    Nonblockable,
    /// Truncate the write to the space available without overwriting the
    /// oldest unconsumed word.
    Nonblocking,
    /// Write the full request or nothing. When the request exceeds the
    /// whole buffer but would not overrun any reader, the head of the
    /// request is discarded and only the last `capacity` words land,
    /// since the earlier words could never be read anyway.
    AllOrNothing,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WriterError {
    #[error("Writer is closed")]
    Closed,
    #[error("Write would overwrite unconsumed data")]
    WouldBlock,
    #[error("Invalid write request")]
    InvalidArg,
}

pub struct DataStreamWriter {
    stream: Arc<DataStream>,
    policy: WriterPolicy,
    closed: bool,
}

impl DataStreamWriter {
    pub(crate) fn new(stream: Arc<DataStream>, policy: WriterPolicy) -> Self {
        DataStreamWriter {
            stream,
            policy,
            closed: false,
        }
    }

    pub fn policy(&self) -> WriterPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: WriterPolicy) {
        self.policy = policy;
    }

    pub fn word_size(&self) -> usize {
        self.stream.word_size()
    }

    /// Absolute index of the next word to write.
    pub fn tell(&self) -> u64 {
        self.stream.write_start.load(Ordering::SeqCst)
    }

    /// Writes `buf` (a whole number of words) per the writer policy.
    /// Returns the number of words accepted, which for `Nonblocking` may
    /// be less than requested and for `Nonblockable`/`AllOrNothing` is
    /// the full (possibly capacity-clamped) request.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, WriterError> {
        let stream = &self.stream;
        let word_size = stream.word_size();
        if buf.is_empty() || buf.len() % word_size != 0 {
            return Err(WriterError::InvalidArg);
        }
        if !stream.writer_enabled.load(Ordering::SeqCst) {
            return Err(WriterError::Closed);
        }

        let capacity = stream.data_size();
        let mut n_words = (buf.len() / word_size) as u64;
        let mut src = buf;
        let write_start = stream.write_start.load(Ordering::SeqCst);
        let mut write_end = write_start + n_words;

        let mut seek_guard = None;
        match self.policy {
            WriterPolicy::Nonblockable => {
                if n_words > capacity {
                    // Partial write: only the first `capacity` words land.
                    n_words = capacity;
                    write_end = write_start + n_words;
                    src = &buf[..(n_words as usize) * word_size];
                }
            }
            WriterPolicy::AllOrNothing => {
                seek_guard = Some(lock(&stream.backward_seek_mutex));
                let oldest = stream.oldest_unconsumed.load(Ordering::SeqCst);
                if write_end >= oldest && write_end - oldest > capacity {
                    return Err(WriterError::WouldBlock);
                }
            }
            WriterPolicy::Nonblocking => {
                seek_guard = Some(lock(&stream.backward_seek_mutex));
                let oldest = stream.oldest_unconsumed.load(Ordering::SeqCst);
                let mut space = capacity;
                if write_start >= oldest {
                    let consumed_lag = write_start - oldest;
                    let words_to_overrun = if consumed_lag > capacity {
                        0
                    } else {
                        capacity - consumed_lag
                    };
                    space = space.min(words_to_overrun);
                }
                if space < n_words {
                    n_words = space;
                    write_end = write_start + n_words;
                    src = &buf[..(n_words as usize) * word_size];
                }
            }
        }

        stream.write_end.store(write_end, Ordering::SeqCst);
        drop(seek_guard);

        if n_words == 0 {
            return Ok(0);
        }

        if self.policy == WriterPolicy::AllOrNothing && write_end - write_start > capacity {
            // Head discard: land only the tail of the request, at the
            // logical indices readers will actually ask for.
            let tail_words = capacity as usize;
            src = &buf[buf.len() - tail_words * word_size..];
            stream.copy_in(write_end - capacity, src);
        } else {
            stream.copy_in(write_start, src);
        }

        stream.write_start.store(write_end, Ordering::SeqCst);
        stream.notify_data_available();
        Ok((write_end - write_start) as usize)
    }

    pub fn close(&mut self) {
        let _guard = lock(&self.stream.writer_enable_mutex);
        if self.closed {
            return;
        }
        self.stream.writer_enabled.store(false, Ordering::SeqCst);
        self.closed = true;
        // Wake any parked readers so bounded waits can observe the close.
        self.stream.notify_data_available();
    }
}

impl Drop for DataStreamWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastream::{DataStream, ReaderPolicy};

    #[test]
    fn test_tell_advances() {
        let stream = DataStream::create(8, 2, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblockable).unwrap();
        assert_eq!(writer.tell(), 0);
        assert_eq!(writer.write(&[0u8; 6]).unwrap(), 3);
        assert_eq!(writer.tell(), 3);
    }

    #[test]
    fn test_word_granularity_enforced() {
        let stream = DataStream::create(8, 2, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblockable).unwrap();
        assert_eq!(writer.write(&[0u8; 3]), Err(WriterError::InvalidArg));
        assert_eq!(writer.write(&[]), Err(WriterError::InvalidArg));
    }

    #[test]
    fn test_closed_writer_rejects() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblockable).unwrap();
        writer.close();
        assert_eq!(writer.write(&[0u8; 1]), Err(WriterError::Closed));
    }

    #[test]
    fn test_nonblocking_never_crosses_oldest_unconsumed() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::Nonblocking).unwrap();
        let _reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        // Reader sits at 0, so only 8 words fit; a 12-word write
        // truncates to 8.
        assert_eq!(writer.write(&[1u8; 12]).unwrap(), 8);
        assert_eq!(writer.tell(), 8);
        // No space at all now.
        assert_eq!(writer.write(&[2u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_all_or_nothing_blocks_instead_of_overrunning() {
        let stream = DataStream::create(8, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::AllOrNothing).unwrap();
        let _reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();

        assert_eq!(writer.write(&[1u8; 6]).unwrap(), 6);
        assert_eq!(writer.write(&[2u8; 4]), Err(WriterError::WouldBlock));
        // A fitting write still goes through.
        assert_eq!(writer.write(&[3u8; 2]).unwrap(), 2);
    }

    #[test]
    fn test_all_or_nothing_head_discard() {
        let stream = DataStream::create(4, 1, 1).unwrap();
        let mut writer = stream.create_writer(WriterPolicy::AllOrNothing).unwrap();
        let mut reader = stream.create_reader(ReaderPolicy::Nonblocking).unwrap();
        // Park the reader ahead of the data the head would occupy.
        reader
            .seek(10, crate::datastream::SeekReference::Absolute)
            .unwrap();

        // 10 words into a 4-word ring: heads 0..6 are discarded, tail
        // 6..10 lands.
        assert_eq!(writer.write(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap(), 10);
        assert_eq!(writer.tell(), 10);

        reader
            .seek(6, crate::datastream::SeekReference::Absolute)
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [6, 7, 8, 9]);
    }
}
