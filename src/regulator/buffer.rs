use std::collections::VecDeque;

use crate::message::Message;

use super::{RegulatorError, Result};

/// FIFO of message chunks awaiting emission. Chunks are grouped from the
/// front so that each emitted series stays within `max_message_size`;
/// the granularity of the chunks decides how full a group actually gets.
pub(crate) struct RegulatorBuffer {
    max_message_size: usize,
    chunks: VecDeque<Message>,
    /// Aggregate serialised size of everything queued.
    buffered_bytes: usize,
}

impl RegulatorBuffer {
    pub fn new(max_message_size: usize) -> Self {
        RegulatorBuffer {
            max_message_size,
            chunks: VecDeque::new(),
            buffered_bytes: 0,
        }
    }

    pub fn push_back(&mut self, chunk: Message) -> Result<()> {
        let size = chunk.size();
        if size > self.max_message_size {
            return Err(RegulatorError::ChunkTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        self.buffered_bytes += size;
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Removes chunks from the front, emitting each through
    /// `emit_chunk(chunk, remaining_bytes, remaining_chunks)`. The series
    /// is the longest prefix whose cumulative size fits in
    /// `max_message_size`; the final call carries zero remainders.
    ///
    /// If `emit_chunk` refuses a chunk the chunk stays at the front and
    /// this returns `false`.
    pub fn remove_front(
        &mut self,
        emit_chunk: &mut dyn FnMut(&Message, usize, usize) -> bool,
    ) -> bool {
        if self.chunks.is_empty() {
            // Nothing to emit is not a failure.
            return true;
        }

        let mut cumulative = 0usize;
        let mut num_chunks = 0usize;
        for chunk in &self.chunks {
            let size = chunk.size();
            if cumulative + size > self.max_message_size {
                break;
            }
            cumulative += size;
            num_chunks += 1;
        }

        while cumulative > 0 {
            let chunk = match self.chunks.front() {
                Some(chunk) => chunk,
                None => {
                    log::error!("Regulator buffer inconsistency detected.");
                    return false;
                }
            };
            let size = chunk.size();
            let remaining = cumulative - size;
            num_chunks -= 1;
            if !emit_chunk(chunk, remaining, num_chunks) {
                log::error!(
                    "Failed to emit message chunk, size={size}, remaining={remaining}, chunks={num_chunks}"
                );
                return false;
            }
            self.chunks.pop_front();
            cumulative = remaining;
            self.buffered_bytes -= size;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Aggregate serialised size of the queued chunks.
    pub fn size(&self) -> usize {
        self.buffered_bytes
    }

    /// Whether enough bytes are queued to fill a message. Slightly
    /// pessimistic: chunk granularity may keep the emitted group below
    /// `max_message_size` even when this returns `true`.
    pub fn can_fill_message(&self) -> bool {
        self.buffered_bytes >= self.max_message_size
    }

    /// Drains the buffer through `destroy_chunk` without emitting.
    pub fn clear(&mut self, destroy_chunk: &mut dyn FnMut(Message)) {
        while let Some(chunk) = self.chunks.pop_front() {
            destroy_chunk(chunk);
        }
        self.buffered_bytes = 0;
    }
}
