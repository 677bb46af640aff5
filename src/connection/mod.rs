//! Connection lifecycle with the Aia service.
//!
//! The device publishes `Connect` on the connection topic and waits for
//! the service's `Acknowledge`. A rejected or dropped connection
//! reconnects under binary exponential backoff with full jitter, except
//! for `API_VERSION_DEPRECATED`, which is fatal until the device is
//! updated.

mod backoff;

pub use backoff::backoff_with_jitter;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::emitter::Emitter;
use crate::message::JsonMessage;
use crate::tasks::{TaskHandle, TaskPool};

#[derive(Deserialize)]
struct AcknowledgePayload {
    #[serde(rename = "connectMessageId")]
    connect_message_id: Option<String>,
    code: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct DisconnectPayload {
    code: String,
    #[serde(default)]
    description: Option<String>,
}

/// Where the device currently stands with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Codes in the service's `Acknowledge` reply to `Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgeCode {
    ConnectionEstablished,
    InvalidAccountId,
    InvalidClientId,
    ApiVersionDeprecated,
    UnknownFailure,
}

impl AcknowledgeCode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CONNECTION_ESTABLISHED" => Some(Self::ConnectionEstablished),
            "INVALID_ACCOUNT_ID" => Some(Self::InvalidAccountId),
            "INVALID_CLIENT_ID" => Some(Self::InvalidClientId),
            "API_VERSION_DEPRECATED" => Some(Self::ApiVersionDeprecated),
            "UNKNOWN_FAILURE" => Some(Self::UnknownFailure),
            _ => None,
        }
    }
}

/// Codes carried in a `Disconnect` message, either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCode {
    UnexpectedSequenceNumber,
    MessageTampered,
    ApiVersionDeprecated,
    EncryptionError,
    GoingOffline,
}

impl DisconnectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnexpectedSequenceNumber => "UNEXPECTED_SEQUENCE_NUMBER",
            Self::MessageTampered => "MESSAGE_TAMPERED",
            Self::ApiVersionDeprecated => "API_VERSION_DEPRECATED",
            Self::EncryptionError => "ENCRYPTION_ERROR",
            Self::GoingOffline => "GOING_OFFLINE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "UNEXPECTED_SEQUENCE_NUMBER" => Some(Self::UnexpectedSequenceNumber),
            "MESSAGE_TAMPERED" => Some(Self::MessageTampered),
            "API_VERSION_DEPRECATED" => Some(Self::ApiVersionDeprecated),
            "ENCRYPTION_ERROR" => Some(Self::EncryptionError),
            "GOING_OFFLINE" => Some(Self::GoingOffline),
            _ => None,
        }
    }
}

struct Inner {
    state: ConnectionState,
    connect_message_id: Option<String>,
    retry_count: u32,
    fatal: bool,
    retry_timer: Option<TaskHandle>,
}

pub struct ConnectionManager {
    inner: Mutex<Inner>,
    emitter: Arc<Emitter>,
    pool: TaskPool,
    aws_account_id: String,
    client_id: String,
    max_backoff: Duration,
    on_connected: Box<dyn Fn() + Send + Sync>,
    on_rejected: Box<dyn Fn(AcknowledgeCode) + Send + Sync>,
    on_disconnected: Box<dyn Fn(DisconnectCode) + Send + Sync>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        emitter: Arc<Emitter>,
        pool: TaskPool,
        aws_account_id: String,
        client_id: String,
        max_backoff: Duration,
        on_connected: impl Fn() + Send + Sync + 'static,
        on_rejected: impl Fn(AcknowledgeCode) + Send + Sync + 'static,
        on_disconnected: impl Fn(DisconnectCode) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                connect_message_id: None,
                retry_count: 0,
                fatal: false,
                retry_timer: None,
            }),
            emitter,
            pool,
            aws_account_id,
            client_id,
            max_backoff,
            on_connected: Box::new(on_connected),
            on_rejected: Box::new(on_rejected),
            on_disconnected: Box::new(on_disconnected),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Sends `Connect`. Returns `false` when already connecting,
    /// connected, or after a fatal version rejection.
    pub fn connect(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.lock();
            if inner.fatal || inner.state != ConnectionState::Disconnected {
                return false;
            }
            inner.state = ConnectionState::Connecting;
        }
        let message = JsonMessage::new(
            "Connect",
            Some(json!({
                "awsAccountId": self.aws_account_id,
                "clientId": self.client_id,
            })),
        );
        self.lock().connect_message_id = Some(message.message_id().to_string());
        log::info!("Connecting, clientId={}", self.client_id);
        if !self.emitter.emit_chunk(&message.into(), 0, 0) {
            log::error!("Failed to publish Connect message.");
            self.lock().state = ConnectionState::Disconnected;
            self.schedule_reconnect();
            return true;
        }
        true
    }

    /// Publishes `Disconnect{code, description}` and drops the
    /// connection. Reconnects afterwards unless the code is terminal.
    pub fn disconnect(self: &Arc<Self>, code: DisconnectCode, description: &str) -> bool {
        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Disconnected {
                return false;
            }
            inner.state = ConnectionState::Disconnected;
        }
        let mut payload = json!({ "code": code.as_str() });
        if !description.is_empty() {
            payload["description"] = Value::String(description.to_string());
        }
        let message = JsonMessage::new("Disconnect", Some(payload));
        if !self.emitter.emit_chunk(&message.into(), 0, 0) {
            log::error!("Failed to publish Disconnect message.");
        }
        log::info!("Disconnected, code={}", code.as_str());
        (self.on_disconnected)(code);
        match code {
            DisconnectCode::ApiVersionDeprecated => self.lock().fatal = true,
            DisconnectCode::GoingOffline => {}
            _ => self.schedule_reconnect(),
        }
        true
    }

    /// Handles a sequenced `Acknowledge` payload:
    /// `{"connectMessageId": ..., "code": ..., "description"?}`.
    pub fn on_acknowledge_received(self: &Arc<Self>, payload: &Value) {
        let Ok(ack) = serde_json::from_value::<AcknowledgePayload>(payload.clone()) else {
            log::error!("Unparseable Acknowledge payload");
            return;
        };
        let Some(code) = AcknowledgeCode::from_str(&ack.code) else {
            log::error!("Acknowledge with unknown code: {:?}", ack.code);
            return;
        };
        if let Some(expected) = self.lock().connect_message_id.as_deref() {
            let got = ack.connect_message_id.as_deref().unwrap_or("");
            if got != expected {
                log::warn!("Acknowledge for unexpected connectMessageId: {got:?}");
            }
        }
        match code {
            AcknowledgeCode::ConnectionEstablished => {
                let mut inner = self.lock();
                inner.state = ConnectionState::Connected;
                inner.retry_count = 0;
                drop(inner);
                log::info!("Connection established");
                (self.on_connected)();
            }
            AcknowledgeCode::ApiVersionDeprecated => {
                let mut inner = self.lock();
                inner.state = ConnectionState::Disconnected;
                inner.fatal = true;
                drop(inner);
                log::error!("API version deprecated; not reconnecting");
                (self.on_rejected)(code);
            }
            other => {
                self.lock().state = ConnectionState::Disconnected;
                log::error!(
                    "Connection rejected, code={other:?}, description={}",
                    ack.description.as_deref().unwrap_or("")
                );
                (self.on_rejected)(other);
                self.schedule_reconnect();
            }
        }
    }

    /// Handles a service-initiated `Disconnect` payload:
    /// `{"code": ..., "description"?}`.
    pub fn on_disconnect_received(self: &Arc<Self>, payload: &Value) {
        let parsed = serde_json::from_value::<DisconnectPayload>(payload.clone()).ok();
        let code = parsed
            .as_ref()
            .and_then(|p| DisconnectCode::from_str(&p.code))
            .unwrap_or(DisconnectCode::GoingOffline);
        let description = parsed
            .as_ref()
            .and_then(|p| p.description.as_deref())
            .unwrap_or("");
        log::warn!(
            "Service disconnected us, code={}, description={description}",
            code.as_str()
        );
        self.lock().state = ConnectionState::Disconnected;
        (self.on_disconnected)(code);
        if code != DisconnectCode::ApiVersionDeprecated {
            self.schedule_reconnect();
        } else {
            self.lock().fatal = true;
        }
    }

    /// Reports an MQTT-level drop (broker connection lost).
    pub fn on_transport_disconnected(self: &Arc<Self>) {
        let was_connected = {
            let mut inner = self.lock();
            let was = inner.state != ConnectionState::Disconnected;
            inner.state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            (self.on_disconnected)(DisconnectCode::GoingOffline);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.fatal || inner.retry_timer.is_some() {
            return;
        }
        inner.retry_count += 1;
        let delay = backoff_with_jitter(inner.retry_count, self.max_backoff);
        log::info!(
            "Reconnect attempt {} scheduled in {}ms",
            inner.retry_count,
            delay.as_millis()
        );
        let weak: Weak<Self> = Arc::downgrade(self);
        inner.retry_timer = Some(self.pool.schedule_once(delay, move || {
            if let Some(manager) = weak.upgrade() {
                manager.lock().retry_timer = None;
                manager.connect();
            }
        }));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretDerivationAlgorithm;
    use crate::secret::{SecretManager, SharedSecret};
    use crate::topic::Topic;
    use crate::transport::{MqttPublisher, TransportError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CapturingPublisher {
        frames: Mutex<Vec<(Topic, Vec<u8>)>>,
    }

    impl MqttPublisher for CapturingPublisher {
        fn publish(&self, topic: Topic, payload: &[u8]) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push((topic, payload.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<ConnectionManager>,
        publisher: Arc<CapturingPublisher>,
        connected: Arc<AtomicUsize>,
        disconnected: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let publisher = Arc::new(CapturingPublisher {
            frames: Mutex::new(Vec::new()),
        });
        let secret = SharedSecret::new(
            vec![1; 16],
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
        )
        .unwrap();
        let secret_manager = Arc::new(SecretManager::new(secret, |_| 0));
        let emitter = Arc::new(Emitter::new(
            Topic::Connection,
            secret_manager,
            publisher.clone(),
        ));
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        let d = disconnected.clone();
        let manager = ConnectionManager::new(
            emitter,
            TaskPool::new(),
            "account".into(),
            "client".into(),
            Duration::from_millis(50),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
            move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        Fixture {
            manager,
            publisher,
            connected,
            disconnected,
        }
    }

    fn last_message(publisher: &CapturingPublisher) -> Value {
        let frames = publisher.frames.lock().unwrap();
        let (topic, frame) = frames.last().unwrap().clone();
        assert_eq!(topic, Topic::Connection);
        serde_json::from_slice(&frame).unwrap()
    }

    #[test]
    fn test_happy_path_connect() {
        let f = fixture();
        assert!(f.manager.connect());
        assert_eq!(f.manager.state(), ConnectionState::Connecting);

        let connect = last_message(&f.publisher);
        assert_eq!(connect["header"]["name"], "Connect");
        assert_eq!(connect["payload"]["awsAccountId"], "account");
        assert_eq!(connect["payload"]["clientId"], "client");

        let ack = json!({
            "connectMessageId": connect["header"]["messageId"],
            "code": "CONNECTION_ESTABLISHED",
        });
        f.manager.on_acknowledge_received(&ack);
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_twice_refused() {
        let f = fixture();
        assert!(f.manager.connect());
        assert!(!f.manager.connect());
    }

    #[test]
    fn test_version_deprecated_is_fatal() {
        let f = fixture();
        f.manager.connect();
        f.manager
            .on_acknowledge_received(&json!({"code": "API_VERSION_DEPRECATED"}));
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        // No reconnect, ever.
        std::thread::sleep(Duration::from_millis(150));
        assert!(!f.manager.connect());
    }

    #[test]
    fn test_rejection_schedules_reconnect() {
        let f = fixture();
        f.manager.connect();
        f.manager
            .on_acknowledge_received(&json!({"code": "UNKNOWN_FAILURE"}));
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        // Backoff is capped at 50ms; a second Connect should appear.
        std::thread::sleep(Duration::from_millis(200));
        let frames = f.publisher.frames.lock().unwrap();
        let connects = frames
            .iter()
            .filter(|(_, frame)| {
                serde_json::from_slice::<Value>(frame).unwrap()["header"]["name"] == "Connect"
            })
            .count();
        assert!(connects >= 2, "expected a reconnect attempt, saw {connects}");
    }

    #[test]
    fn test_disconnect_publishes_code() {
        let f = fixture();
        f.manager.connect();
        f.manager
            .on_acknowledge_received(&json!({"code": "CONNECTION_ESTABLISHED"}));
        assert!(f
            .manager
            .disconnect(DisconnectCode::UnexpectedSequenceNumber, "gap timeout"));

        let disconnect = last_message(&f.publisher);
        assert_eq!(disconnect["header"]["name"], "Disconnect");
        assert_eq!(disconnect["payload"]["code"], "UNEXPECTED_SEQUENCE_NUMBER");
        assert_eq!(disconnect["payload"]["description"], "gap timeout");
        assert_eq!(f.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_disconnect_received() {
        let f = fixture();
        f.manager.connect();
        f.manager
            .on_acknowledge_received(&json!({"code": "CONNECTION_ESTABLISHED"}));
        f.manager
            .on_disconnect_received(&json!({"code": "MESSAGE_TAMPERED"}));
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert_eq!(f.disconnected.load(Ordering::SeqCst), 1);
    }
}
