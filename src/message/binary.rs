use bytes::BufMut;

use super::{MessageError, Result};

/// Size of the fixed header preceding each binary stream message:
/// 4-byte little-endian length, 1-byte type, 1-byte count, 2 reserved
/// bytes that must be zero.
pub const BINARY_STREAM_HEADER_SIZE: usize = 8;

const NUM_RESERVED_BYTES: usize = 2;

/// A binary stream message as carried on the microphone and speaker
/// topics. Several of these may be concatenated in one MQTT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    stream_type: u8,
    count: u8,
    data: Vec<u8>,
}

impl BinaryMessage {
    pub fn new(stream_type: u8, count: u8, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(MessageError::EmptyBinaryMessage);
        }
        Ok(BinaryMessage {
            stream_type,
            count,
            data,
        })
    }

    pub fn stream_type(&self) -> u8 {
        self.stream_type
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serialised size: header plus data.
    pub fn size(&self) -> usize {
        BINARY_STREAM_HEADER_SIZE + self.data.len()
    }

    /// Appends the wire form (header then data) to `out`.
    pub fn build_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.size());
        out.put_u32_le(self.data.len() as u32);
        out.put_u8(self.stream_type);
        out.put_u8(self.count);
        out.put_bytes(0, NUM_RESERVED_BYTES);
        out.extend_from_slice(&self.data);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.build_into(&mut out);
        out
    }

    /// Parses one or more concatenated binary stream messages out of a
    /// decrypted payload. Fails on truncation or non-zero reserved bytes.
    pub fn parse_concatenated(mut payload: &[u8]) -> Result<Vec<BinaryMessage>> {
        let mut messages = Vec::new();
        while !payload.is_empty() {
            if payload.len() < BINARY_STREAM_HEADER_SIZE {
                return Err(MessageError::Truncated {
                    needed: BINARY_STREAM_HEADER_SIZE,
                    available: payload.len(),
                });
            }
            let length = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
                as usize;
            let stream_type = payload[4];
            let count = payload[5];
            if payload[6] != 0 || payload[7] != 0 {
                return Err(MessageError::NonZeroReserved);
            }
            let total = BINARY_STREAM_HEADER_SIZE + length;
            if payload.len() < total {
                return Err(MessageError::Truncated {
                    needed: total,
                    available: payload.len(),
                });
            }
            messages.push(BinaryMessage::new(
                stream_type,
                count,
                payload[BINARY_STREAM_HEADER_SIZE..total].to_vec(),
            )?);
            payload = &payload[total..];
        }
        Ok(messages)
    }
}
