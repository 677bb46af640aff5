//! Message model shared by every topic.
//!
//! Two concrete shapes hang off one abstract type: JSON messages
//! (directive / event / capabilities / connection topics) and binary
//! stream messages (microphone / speaker topics). Every message knows the
//! number of bytes it will occupy on the wire, which is what the
//! regulator packs against.

mod binary;
mod json;

pub use binary::{BinaryMessage, BINARY_STREAM_HEADER_SIZE};
pub use json::JsonMessage;

use rand::Rng;
use thiserror::Error;

/// Number of characters in a generated message id.
pub const MESSAGE_ID_CHARS: usize = 16;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Payload is not valid JSON")]
    InvalidJson,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Binary stream truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Binary stream reserved bytes are not zero")]
    NonZeroReserved,
    #[error("Binary message length may not be zero")]
    EmptyBinaryMessage,
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// A message bound for (or received from) a topic.
#[derive(Debug, Clone)]
pub enum Message {
    Json(JsonMessage),
    Binary(BinaryMessage),
}

impl Message {
    /// Bytes this message occupies once serialised into an MQTT payload.
    pub fn size(&self) -> usize {
        match self {
            Message::Json(m) => m.size(),
            Message::Binary(m) => m.size(),
        }
    }
}

impl From<JsonMessage> for Message {
    fn from(m: JsonMessage) -> Self {
        Message::Json(m)
    }
}

impl From<BinaryMessage> for Message {
    fn from(m: BinaryMessage) -> Self {
        Message::Binary(m)
    }
}

/// Generates a random message id: printable ASCII with `"`, `\` and the
/// space character excluded so the id can be embedded in JSON unescaped.
pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MESSAGE_ID_CHARS)
        .map(|_| loop {
            let c = rng.gen_range(0x21u8..=0x7e) as char;
            if c != '"' && c != '\\' {
                break c;
            }
        })
        .collect()
}
