//! Assembles regulator chunk series into finished MQTT frames.
//!
//! One emitter exists per outbound topic. It accepts the chunk series a
//! regulator emits, and when the series completes (`remaining_chunks ==
//! 0`) it allocates the topic's next sequence number, encrypts the
//! assembled plaintext, prepends the common header and hands the frame
//! to the MQTT publisher. The emitter is the single allocator of
//! outbound sequence numbers for its topic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::message::Message;
use crate::secret::SecretManager;
use crate::topic::{Direction, Topic, TopicKind};
use crate::transport::MqttPublisher;

/// Common header: 4-byte little-endian sequence number and 12-byte iv,
/// with the 16-byte tag trailing the ciphertext.
pub const COMMON_HEADER_SIZE: usize = 4 + crate::crypto::IV_SIZE;

#[derive(Default)]
struct Pending {
    json: Vec<Value>,
    binary: Vec<u8>,
}

pub struct Emitter {
    topic: Topic,
    next_sequence_number: AtomicU32,
    secret_manager: Arc<SecretManager>,
    publisher: Arc<dyn MqttPublisher>,
    pending: Mutex<Pending>,
}

impl Emitter {
    pub fn new(
        topic: Topic,
        secret_manager: Arc<SecretManager>,
        publisher: Arc<dyn MqttPublisher>,
    ) -> Self {
        Emitter {
            topic,
            next_sequence_number: AtomicU32::new(0),
            secret_manager,
            publisher,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// The sequence number the next published frame will carry. Safe to
    /// call from any thread.
    pub fn next_sequence_number(&self) -> u32 {
        self.next_sequence_number.load(Ordering::SeqCst)
    }

    /// Accepts one chunk of a series from the regulator; publishes once
    /// the series completes.
    pub fn emit_chunk(&self, chunk: &Message, _remaining_bytes: usize, remaining_chunks: usize) -> bool {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match chunk {
            Message::Json(json) => pending.json.push(json.to_value()),
            Message::Binary(binary) => binary.build_into(&mut pending.binary),
        }
        if remaining_chunks > 0 {
            return true;
        }

        let plaintext = match self.topic.kind() {
            TopicKind::Json => {
                let mut docs = std::mem::take(&mut pending.json);
                if docs.len() == 1 {
                    docs.remove(0).to_string().into_bytes()
                } else {
                    Value::Array(docs).to_string().into_bytes()
                }
            }
            TopicKind::Binary => std::mem::take(&mut pending.binary),
        };
        drop(pending);

        self.publish(&plaintext)
    }

    fn publish(&self, plaintext: &[u8]) -> bool {
        let sequence_number = self.next_sequence_number.fetch_add(1, Ordering::SeqCst);
        let frame = if self.topic.is_encrypted() {
            let (ciphertext, iv, tag) = match self.secret_manager.encrypt(
                self.topic,
                Direction::DeviceToService,
                sequence_number,
                plaintext,
            ) {
                Ok(parts) => parts,
                Err(e) => {
                    log::error!("Encrypt failed, topic={}, error={e}", self.topic);
                    return false;
                }
            };
            let mut frame =
                Vec::with_capacity(COMMON_HEADER_SIZE + ciphertext.len() + tag.len());
            frame.extend_from_slice(&sequence_number.to_le_bytes());
            frame.extend_from_slice(&iv);
            frame.extend_from_slice(&ciphertext);
            frame.extend_from_slice(&tag);
            frame
        } else {
            plaintext.to_vec()
        };

        match self.publisher.publish(self.topic, &frame) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Publish failed, topic={}, error={e}", self.topic);
                false
            }
        }
    }
}
