//! Parses inbound MQTT payloads and routes them to their handlers.
//!
//! Encrypted topics carry the common header `(sequence_number, iv,
//! ciphertext, tag)`; the dispatcher decrypts, feeds the plaintext
//! through the topic's sequencer, and dispatches the sequenced result:
//! directive documents to the handler table, speaker data to the
//! speaker sink, capability acknowledgements to the capabilities sink.
//! The handler table is immutable once built; no locking guards it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::connection::{ConnectionManager, DisconnectCode};
use crate::crypto::{IV_SIZE, TAG_SIZE};
use crate::emitter::COMMON_HEADER_SIZE;
use crate::exception::ExceptionManager;
use crate::message::JsonMessage;
use crate::secret::{SecretError, SecretManager};
use crate::sequencer::Sequencer;
use crate::tasks::TaskPool;
use crate::topic::{Direction, Topic};

/// Directives the service can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    RotateSecret,
    SetAttentionState,
    Exception,
    OpenSpeaker,
    CloseSpeaker,
    SetVolume,
    OpenMicrophone,
    CloseMicrophone,
    SetAlertVolume,
    SetAlert,
    DeleteAlert,
    SetClock,
}

impl Directive {
    pub fn as_str(self) -> &'static str {
        match self {
            Directive::RotateSecret => "RotateSecret",
            Directive::SetAttentionState => "SetAttentionState",
            Directive::Exception => "Exception",
            Directive::OpenSpeaker => "OpenSpeaker",
            Directive::CloseSpeaker => "CloseSpeaker",
            Directive::SetVolume => "SetVolume",
            Directive::OpenMicrophone => "OpenMicrophone",
            Directive::CloseMicrophone => "CloseMicrophone",
            Directive::SetAlertVolume => "SetAlertVolume",
            Directive::SetAlert => "SetAlert",
            Directive::DeleteAlert => "DeleteAlert",
            Directive::SetClock => "SetClock",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RotateSecret" => Some(Directive::RotateSecret),
            "SetAttentionState" => Some(Directive::SetAttentionState),
            "Exception" => Some(Directive::Exception),
            "OpenSpeaker" => Some(Directive::OpenSpeaker),
            "CloseSpeaker" => Some(Directive::CloseSpeaker),
            "SetVolume" => Some(Directive::SetVolume),
            "OpenMicrophone" => Some(Directive::OpenMicrophone),
            "CloseMicrophone" => Some(Directive::CloseMicrophone),
            "SetAlertVolume" => Some(Directive::SetAlertVolume),
            "SetAlert" => Some(Directive::SetAlert),
            "DeleteAlert" => Some(Directive::DeleteAlert),
            "SetClock" => Some(Directive::SetClock),
            _ => None,
        }
    }
}

/// Handler invoked with `(payload, sequence_number, index_within_batch)`.
pub type DirectiveHandler = Box<dyn Fn(Option<&Value>, u32, usize) + Send + Sync>;

/// Sink for sequenced binary speaker-topic messages.
pub type SpeakerSink = Box<dyn FnMut(u32, Vec<u8>) + Send>;

/// Sink for sequenced capability acknowledgements.
pub type CapabilitiesAckSink = Box<dyn FnMut(Option<&Value>) + Send>;

/// Collects handler registrations; the built table is immutable.
pub struct DispatcherBuilder {
    handlers: HashMap<Directive, DirectiveHandler>,
    speaker_sink: Option<SpeakerSink>,
    capabilities_ack_sink: Option<CapabilitiesAckSink>,
    max_slots: usize,
    sequence_timeout: Duration,
    starting_sequence_number: u32,
}

impl DispatcherBuilder {
    pub fn new(max_slots: usize, sequence_timeout: Duration) -> Self {
        DispatcherBuilder {
            handlers: HashMap::new(),
            speaker_sink: None,
            capabilities_ack_sink: None,
            // A sequencer needs at least the in-order slot.
            max_slots: max_slots.max(1),
            sequence_timeout,
            starting_sequence_number: 0,
        }
    }

    pub fn starting_sequence_number(mut self, n: u32) -> Self {
        self.starting_sequence_number = n;
        self
    }

    /// Registers a handler. Only directives for capabilities the client
    /// actually composed get registrations; the rest stay unroutable.
    pub fn add_handler(
        mut self,
        directive: Directive,
        handler: impl Fn(Option<&Value>, u32, usize) + Send + Sync + 'static,
    ) -> Self {
        if self.handlers.insert(directive, Box::new(handler)).is_some() {
            log::warn!("Handler for {} replaced", directive.as_str());
        }
        self
    }

    pub fn speaker_sink(mut self, sink: impl FnMut(u32, Vec<u8>) + Send + 'static) -> Self {
        self.speaker_sink = Some(Box::new(sink));
        self
    }

    pub fn capabilities_ack_sink(
        mut self,
        sink: impl FnMut(Option<&Value>) + Send + 'static,
    ) -> Self {
        self.capabilities_ack_sink = Some(Box::new(sink));
        self
    }

    pub fn build(
        self,
        pool: TaskPool,
        secret_manager: Arc<SecretManager>,
        exceptions: Arc<ExceptionManager>,
        connection: Arc<ConnectionManager>,
    ) -> Dispatcher {
        let handlers = Arc::new(self.handlers);

        let directive_sequencer = {
            let handlers = handlers.clone();
            let exceptions = exceptions.clone();
            let connection = connection.clone();
            Sequencer::new(
                self.starting_sequence_number,
                self.max_slots,
                self.sequence_timeout,
                pool.clone(),
                move |seq, data| dispatch_directive_document(&handlers, &exceptions, seq, &data),
                move || {
                    connection.disconnect(
                        DisconnectCode::UnexpectedSequenceNumber,
                        "directive sequence gap timed out",
                    );
                },
            )
            .expect("directive sequencer configuration is static")
        };

        let speaker_sequencer = self.speaker_sink.map(|mut sink| {
            let connection = connection.clone();
            Mutex::new(
                Sequencer::new(
                    self.starting_sequence_number,
                    self.max_slots,
                    self.sequence_timeout,
                    pool.clone(),
                    move |seq, data| sink(seq, data),
                    move || {
                        connection.disconnect(
                            DisconnectCode::UnexpectedSequenceNumber,
                            "speaker sequence gap timed out",
                        );
                    },
                )
                .expect("speaker sequencer configuration is static"),
            )
        });

        let capabilities_sequencer = self.capabilities_ack_sink.map(|mut sink| {
            let exceptions = exceptions.clone();
            Mutex::new(
                Sequencer::new(
                    self.starting_sequence_number,
                    self.max_slots,
                    // Capability acknowledgements are single messages; a
                    // gap timeout would never close.
                    Duration::ZERO,
                    pool.clone(),
                    move |seq, data| {
                        match JsonMessage::parse_envelope(&data) {
                            Ok((name, _, payload)) if name == "Acknowledge" => {
                                sink(payload.as_ref())
                            }
                            Ok(_) | Err(_) => {
                                exceptions.emit_malformed_message(Topic::Capabilities, seq, 0)
                            }
                        }
                    },
                    || {},
                )
                .expect("capabilities sequencer configuration is static"),
            )
        });

        Dispatcher {
            handlers,
            secret_manager,
            exceptions,
            connection,
            directive_sequencer: Mutex::new(directive_sequencer),
            speaker_sequencer,
            capabilities_sequencer,
        }
    }
}

pub struct Dispatcher {
    #[allow(dead_code)]
    handlers: Arc<HashMap<Directive, DirectiveHandler>>,
    secret_manager: Arc<SecretManager>,
    exceptions: Arc<ExceptionManager>,
    connection: Arc<ConnectionManager>,
    directive_sequencer: Mutex<Sequencer>,
    speaker_sequencer: Option<Mutex<Sequencer>>,
    capabilities_sequencer: Option<Mutex<Sequencer>>,
}

impl Dispatcher {
    /// Entry point for every raw inbound MQTT payload.
    pub fn on_mqtt_message(&self, topic: Topic, payload: &[u8]) {
        match topic {
            Topic::Connection => self.on_connection_message(payload),
            Topic::Directive | Topic::Speaker | Topic::Capabilities => {
                self.on_encrypted_message(topic, payload)
            }
            Topic::Event | Topic::Microphone => {
                log::warn!("Ignoring inbound message on outbound topic {topic}");
            }
        }
    }

    /// Re-syncs the speaker stream after a buffer reset.
    pub fn reset_speaker_sequencer(&self, next_expected: u32) {
        if let Some(sequencer) = &self.speaker_sequencer {
            sequencer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .reset_sequence_number(next_expected);
        }
    }

    fn on_connection_message(&self, payload: &[u8]) {
        match JsonMessage::parse_envelope(payload) {
            Ok((name, _, body)) => match name.as_str() {
                "Acknowledge" => {
                    if let Some(body) = body {
                        self.connection.on_acknowledge_received(&body);
                    }
                }
                "Disconnect" => {
                    if let Some(body) = body {
                        self.connection.on_disconnect_received(&body);
                    }
                }
                other => {
                    log::error!("Unknown connection message: {other}");
                    self.exceptions.emit_malformed_message(Topic::Connection, 0, 0);
                }
            },
            Err(e) => {
                log::error!("Unparseable connection message: {e}");
                self.exceptions.emit_malformed_message(Topic::Connection, 0, 0);
            }
        }
    }

    fn on_encrypted_message(&self, topic: Topic, payload: &[u8]) {
        if payload.len() < COMMON_HEADER_SIZE + TAG_SIZE {
            log::error!("Truncated frame on {topic}: {} bytes", payload.len());
            self.exceptions.emit_malformed_message(topic, 0, 0);
            return;
        }
        let sequence_number = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&payload[4..COMMON_HEADER_SIZE]);
        let body = &payload[COMMON_HEADER_SIZE..];
        let (ciphertext, tag) = body.split_at(body.len() - TAG_SIZE);
        let tag: &[u8; TAG_SIZE] = tag.try_into().expect("16 bytes");

        let plaintext = match self.secret_manager.decrypt(
            topic,
            Direction::ServiceToDevice,
            sequence_number,
            &iv,
            ciphertext,
            tag,
        ) {
            Ok(plaintext) => plaintext,
            Err(SecretError::Tampered) => {
                self.connection
                    .disconnect(DisconnectCode::MessageTampered, "AEAD verification failed");
                return;
            }
            Err(e) => {
                log::error!("Decrypt failed on {topic}: {e}");
                self.connection
                    .disconnect(DisconnectCode::EncryptionError, "decrypt failure");
                return;
            }
        };

        let sequencer = match topic {
            Topic::Directive => Some(&self.directive_sequencer),
            Topic::Speaker => self.speaker_sequencer.as_ref(),
            Topic::Capabilities => self.capabilities_sequencer.as_ref(),
            _ => None,
        };
        let Some(sequencer) = sequencer else {
            log::warn!("No consumer composed for inbound topic {topic}; dropping");
            return;
        };
        let result = sequencer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .write(sequence_number, plaintext);
        if let Err(e) = result {
            log::error!("Sequencer rejected message on {topic}: {e}");
            self.exceptions
                .emit_malformed_message(topic, sequence_number, 0);
        }
    }
}

/// Dispatches one sequenced directive-topic document. The document is
/// either a single enveloped directive or an array of them; array
/// elements dispatch in order with their index.
fn dispatch_directive_document(
    handlers: &HashMap<Directive, DirectiveHandler>,
    exceptions: &ExceptionManager,
    sequence_number: u32,
    data: &[u8],
) {
    let doc: Value = match serde_json::from_slice(data) {
        Ok(doc) => doc,
        Err(e) => {
            log::error!("Unparseable directive document: {e}");
            exceptions.emit_malformed_message(Topic::Directive, sequence_number, 0);
            return;
        }
    };
    match doc {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                dispatch_one(handlers, exceptions, item, sequence_number, index);
            }
        }
        other => dispatch_one(handlers, exceptions, &other, sequence_number, 0),
    }
}

fn dispatch_one(
    handlers: &HashMap<Directive, DirectiveHandler>,
    exceptions: &ExceptionManager,
    doc: &Value,
    sequence_number: u32,
    index: usize,
) {
    let name = doc
        .get("header")
        .and_then(|h| h.get("name"))
        .and_then(Value::as_str);
    let Some(name) = name else {
        exceptions.emit_malformed_message(Topic::Directive, sequence_number, index);
        return;
    };
    let Some(directive) = Directive::from_name(name) else {
        log::error!("Unknown directive: {name}");
        exceptions.emit_malformed_message(Topic::Directive, sequence_number, index);
        return;
    };
    let Some(handler) = handlers.get(&directive) else {
        log::error!("No handler composed for directive {name}");
        exceptions.emit_malformed_message(Topic::Directive, sequence_number, index);
        return;
    };
    log::debug!("Dispatching {name}, sequenceNumber={sequence_number}, index={index}");
    handler(doc.get("payload"), sequence_number, index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, SecretDerivationAlgorithm};
    use crate::message::Message;
    use crate::secret::SharedSecret;
    use crate::transport::{MqttPublisher, TransportError};
    use serde_json::json;

    struct NullPublisher;
    impl MqttPublisher for NullPublisher {
        fn publish(&self, _topic: Topic, _payload: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    const KEY: [u8; 16] = [0x22; 16];

    struct Fixture {
        dispatcher: Dispatcher,
        exceptions_seen: Arc<Mutex<Vec<Value>>>,
        dispatched: Arc<Mutex<Vec<(String, u32, usize)>>>,
        speaker_data: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
    }

    fn fixture() -> Fixture {
        let pool = TaskPool::new();
        let secret = SharedSecret::new(
            KEY.to_vec(),
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
        )
        .unwrap();
        let secret_manager = Arc::new(SecretManager::new(secret, |_| 0));

        let exceptions_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = exceptions_seen.clone();
        let exceptions = Arc::new(ExceptionManager::new(move |msg| {
            if let Message::Json(json) = msg {
                sink.lock().unwrap().push(json.to_value());
            }
            true
        }));

        let publisher = Arc::new(NullPublisher);
        let connection_emitter = Arc::new(crate::emitter::Emitter::new(
            Topic::Connection,
            secret_manager.clone(),
            publisher,
        ));
        let connection = ConnectionManager::new(
            connection_emitter,
            pool.clone(),
            "a".into(),
            "c".into(),
            Duration::from_millis(10),
            || {},
            |_| {},
            |_| {},
        );

        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let speaker_data = Arc::new(Mutex::new(Vec::new()));

        let d1 = dispatched.clone();
        let d2 = dispatched.clone();
        let s = speaker_data.clone();
        let dispatcher = DispatcherBuilder::new(8, Duration::ZERO)
            .add_handler(Directive::SetVolume, move |payload, seq, index| {
                d1.lock().unwrap().push((
                    format!("SetVolume:{}", payload.unwrap()["volume"]),
                    seq,
                    index,
                ));
            })
            .add_handler(Directive::SetAttentionState, move |_, seq, index| {
                d2.lock()
                    .unwrap()
                    .push(("SetAttentionState".into(), seq, index));
            })
            .speaker_sink(move |seq, data| {
                s.lock().unwrap().push((seq, data));
            })
            .build(pool, secret_manager, exceptions, connection);

        Fixture {
            dispatcher,
            exceptions_seen,
            dispatched,
            speaker_data,
        }
    }

    fn frame(topic: Topic, seq: u32, plaintext: &[u8]) -> Vec<u8> {
        let iv = crypto::build_nonce(topic, Direction::ServiceToDevice, seq);
        let (ciphertext, tag) = crypto::encrypt(&KEY, &iv, plaintext).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&tag);
        frame
    }

    fn directive_doc(name: &str, payload: Value) -> Vec<u8> {
        json!({
            "header": {"name": name, "messageId": "0123456789abcdef"},
            "payload": payload,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_directive_dispatch() {
        let f = fixture();
        let doc = directive_doc("SetVolume", json!({"volume": 30}));
        f.dispatcher
            .on_mqtt_message(Topic::Directive, &frame(Topic::Directive, 0, &doc));
        assert_eq!(
            *f.dispatched.lock().unwrap(),
            vec![("SetVolume:30".to_string(), 0, 0)]
        );
    }

    #[test]
    fn test_out_of_order_directives_resequenced() {
        let f = fixture();
        for seq in [0u32, 2, 1] {
            let doc = directive_doc("SetVolume", json!({"volume": seq}));
            f.dispatcher
                .on_mqtt_message(Topic::Directive, &frame(Topic::Directive, seq, &doc));
        }
        let seen: Vec<u32> = f.dispatched.lock().unwrap().iter().map(|(_, s, _)| *s).collect();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_batched_directives_dispatch_with_index() {
        let f = fixture();
        let batch = json!([
            {"header": {"name": "SetVolume", "messageId": "m1"}, "payload": {"volume": 1}},
            {"header": {"name": "SetAttentionState", "messageId": "m2"}, "payload": {"state": "IDLE"}},
        ])
        .to_string()
        .into_bytes();
        f.dispatcher
            .on_mqtt_message(Topic::Directive, &frame(Topic::Directive, 0, &batch));
        let dispatched = f.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[0].2, 0);
        assert_eq!(dispatched[1].2, 1);
    }

    #[test]
    fn test_unknown_directive_is_malformed() {
        let f = fixture();
        let doc = directive_doc("FlyToTheMoon", json!({}));
        f.dispatcher
            .on_mqtt_message(Topic::Directive, &frame(Topic::Directive, 0, &doc));
        let exceptions = f.exceptions_seen.lock().unwrap();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0]["payload"]["code"], "MALFORMED_MESSAGE");
        assert_eq!(exceptions[0]["payload"]["message"]["topic"], "directive");
    }

    #[test]
    fn test_speaker_messages_flow_to_sink() {
        let f = fixture();
        f.dispatcher
            .on_mqtt_message(Topic::Speaker, &frame(Topic::Speaker, 0, &[1, 2, 3]));
        assert_eq!(*f.speaker_data.lock().unwrap(), vec![(0, vec![1, 2, 3])]);
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let f = fixture();
        f.dispatcher.on_mqtt_message(Topic::Directive, &[0u8; 10]);
        let exceptions = f.exceptions_seen.lock().unwrap();
        assert_eq!(exceptions[0]["payload"]["code"], "MALFORMED_MESSAGE");
    }

    #[test]
    fn test_beyond_window_sequence_is_malformed() {
        let f = fixture();
        let doc = directive_doc("SetVolume", json!({"volume": 1}));
        f.dispatcher
            .on_mqtt_message(Topic::Directive, &frame(Topic::Directive, 100, &doc));
        let exceptions = f.exceptions_seen.lock().unwrap();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0]["payload"]["message"]["sequenceNumber"], 100);
    }
}
