//! Shared-secret management and per-topic authenticated encryption.
//!
//! The AEAD key is a versioned shared secret established at registration
//! and rotated mid-session by the `RotateSecret` directive. During a
//! rotation window two secrets are live: the service declares, per
//! topic, the first sequence number encrypted under the new secret, and
//! each message selects its secret by comparing its sequence number
//! against that cutover. Decryption additionally falls back to the other
//! live secret; a message that verifies under neither escalates to a
//! `MESSAGE_TAMPERED` disconnect at the caller.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::{self, CryptoError, SecretDerivationAlgorithm, IV_SIZE, TAG_SIZE};
use crate::message::{JsonMessage, Message};
use crate::topic::{Direction, Topic};

const HALF_SPACE: u32 = 0x8000_0000;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("Malformed RotateSecret payload: {0}")]
    MalformedPayload(&'static str),
    #[error("Message failed verification under every live secret")]
    Tampered,
    #[error("Failed to emit SecretRotated event")]
    EmitFailed,
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// A shared secret plus the algorithm that derived it. The key material
/// is zeroized on drop.
#[derive(Clone)]
pub struct SharedSecret {
    key: Vec<u8>,
    algorithm: SecretDerivationAlgorithm,
}

impl SharedSecret {
    pub fn new(key: Vec<u8>, algorithm: SecretDerivationAlgorithm) -> crypto::Result<Self> {
        if key.len() != algorithm.key_size() {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        Ok(SharedSecret { key, algorithm })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn algorithm(&self) -> SecretDerivationAlgorithm {
        self.algorithm
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "SharedSecret({}, {} bytes)", self.algorithm.as_str(), self.key.len())
    }
}

struct PendingRotation {
    secret: SharedSecret,
    /// First sequence number encrypted under the new secret, per topic.
    cutovers: HashMap<Topic, u32>,
}

struct SecretState {
    active: SharedSecret,
    pending: Option<PendingRotation>,
    /// The `SecretRotated` event has been handed to the event pipeline.
    rotated_event_emitted: bool,
    /// An inbound message has verified under the pending secret.
    service_confirmed: bool,
}

/// Selects, applies and rotates the shared secret. Encrypt/decrypt
/// callers share the state under a read-mostly lock; rotation briefly
/// takes the exclusive lock.
pub struct SecretManager {
    state: RwLock<SecretState>,
    get_next_sequence_number: Box<dyn Fn(Topic) -> u32 + Send + Sync>,
    emit_event: OnceCell<Box<dyn Fn(Message) -> bool + Send + Sync>>,
}

impl SecretManager {
    pub fn new(
        initial_secret: SharedSecret,
        get_next_sequence_number: impl Fn(Topic) -> u32 + Send + Sync + 'static,
    ) -> Self {
        SecretManager {
            state: RwLock::new(SecretState {
                active: initial_secret,
                pending: None,
                rotated_event_emitted: false,
                service_confirmed: false,
            }),
            get_next_sequence_number: Box::new(get_next_sequence_number),
            emit_event: OnceCell::new(),
        }
    }

    /// Wires the event pipeline; called once while the client assembles
    /// its topic plumbing.
    pub fn set_event_emitter(&self, emit: impl Fn(Message) -> bool + Send + Sync + 'static) {
        let _ = self.emit_event.set(Box::new(emit));
    }

    /// Snapshot of the currently active secret, for persistence.
    pub fn active_secret(&self) -> SharedSecret {
        self.state.read().unwrap_or_else(|e| e.into_inner()).active.clone()
    }

    /// The newest secret: the pending one during a rotation window,
    /// the active one otherwise. This is what gets persisted so a
    /// restart mid-rotation comes back up on the service's secret.
    pub fn latest_secret(&self) -> SharedSecret {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .pending
            .as_ref()
            .map(|pending| pending.secret.clone())
            .unwrap_or_else(|| state.active.clone())
    }

    /// Encrypts `plaintext` for `(topic, sequence_number)`, returning
    /// `(ciphertext, iv, tag)`.
    pub fn encrypt(
        &self,
        topic: Topic,
        direction: Direction,
        sequence_number: u32,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; IV_SIZE], [u8; TAG_SIZE])> {
        let iv = crypto::build_nonce(topic, direction, sequence_number);
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let key = select_secret(&state, topic, sequence_number);
        let (ciphertext, tag) = crypto::encrypt(key.key(), &iv, plaintext)?;
        Ok((ciphertext, iv, tag))
    }

    /// Decrypts a message received on `(topic, sequence_number)`. Tries
    /// the secret the cutover selects first, then the other live secret.
    pub fn decrypt(
        &self,
        topic: Topic,
        direction: Direction,
        sequence_number: u32,
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<Vec<u8>> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            let selected = select_secret(&state, topic, sequence_number);
            if let Ok(plaintext) = crypto::decrypt(selected.key(), iv, ciphertext, tag) {
                let selected_is_pending = state
                    .pending
                    .as_ref()
                    .map(|p| std::ptr::eq(&p.secret, selected))
                    .unwrap_or(false);
                drop(state);
                if selected_is_pending {
                    self.note_service_confirmed();
                }
                return Ok(plaintext);
            }
            let other = match &state.pending {
                Some(pending) if std::ptr::eq(select_secret(&state, topic, sequence_number), &state.active) => {
                    Some(&pending.secret)
                }
                Some(_) => Some(&state.active),
                None => None,
            };
            if let Some(other) = other {
                let other_is_pending = !std::ptr::eq(other, &state.active);
                if let Ok(plaintext) = crypto::decrypt(other.key(), iv, ciphertext, tag) {
                    drop(state);
                    if other_is_pending {
                        self.note_service_confirmed();
                    }
                    return Ok(plaintext);
                }
            }
        }
        Err(SecretError::Tampered)
    }

    /// Handles a sequenced `RotateSecret` directive:
    /// `{"newSecret": "<base64>", "sequenceNumbers": {"<topic>": n}}`.
    ///
    /// Installs the new secret as pending with the declared per-topic
    /// cutovers and emits `SecretRotated`. The event-topic cutover is
    /// raised to the event's own sequence number when the declared value
    /// is already in the past, so `SecretRotated` is the first event
    /// encrypted under the new secret.
    pub fn handle_rotate_secret(&self, payload: Option<&Value>) -> Result<()> {
        let payload = payload.ok_or(SecretError::MalformedPayload("missing payload"))?;
        let encoded = payload
            .get("newSecret")
            .and_then(Value::as_str)
            .ok_or(SecretError::MalformedPayload("newSecret"))?;
        let key = BASE64
            .decode(encoded)
            .map_err(|_| SecretError::MalformedPayload("newSecret is not base64"))?;
        let algorithm = match key.len() {
            16 => SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
            32 => SecretDerivationAlgorithm::EcdhCurve25519Raw32,
            _ => return Err(SecretError::MalformedPayload("newSecret length")),
        };
        let declared = payload
            .get("sequenceNumbers")
            .and_then(Value::as_object)
            .ok_or(SecretError::MalformedPayload("sequenceNumbers"))?;

        let mut cutovers = HashMap::new();
        for (name, value) in declared {
            let topic = Topic::ALL
                .iter()
                .copied()
                .find(|t| t.as_str() == name)
                .ok_or(SecretError::MalformedPayload("unknown topic"))?;
            let n = value
                .as_u64()
                .filter(|n| *n <= u32::MAX as u64)
                .ok_or(SecretError::MalformedPayload("sequence number"))?;
            cutovers.insert(topic, n as u32);
        }

        // The SecretRotated event itself must travel under the new
        // secret: never let the event-topic cutover lag the next event
        // sequence number.
        let next_event_seq = (self.get_next_sequence_number)(Topic::Event);
        let event_cutover = cutovers.entry(Topic::Event).or_insert(next_event_seq);
        if next_event_seq.wrapping_sub(*event_cutover) < HALF_SPACE {
            *event_cutover = next_event_seq;
        }

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let secret = SharedSecret::new(key, algorithm)?;
            state.pending = Some(PendingRotation { secret, cutovers });
            state.rotated_event_emitted = false;
            state.service_confirmed = false;
        }
        log::info!("Pending secret installed, algorithm={}", algorithm.as_str());

        let emit = self.emit_event.get().ok_or(SecretError::EmitFailed)?;
        if !emit(JsonMessage::new("SecretRotated", Some(json!({}))).into()) {
            return Err(SecretError::EmitFailed);
        }
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.rotated_event_emitted = true;
        }
        self.maybe_retire_old_secret();
        Ok(())
    }

    fn note_service_confirmed(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.pending.is_none() || state.service_confirmed {
                return;
            }
            state.service_confirmed = true;
        }
        self.maybe_retire_old_secret();
    }

    /// Retires the old secret once the rotation handshake is complete:
    /// `SecretRotated` emitted and the service observed using the new
    /// secret inbound.
    fn maybe_retire_old_secret(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.rotated_event_emitted && state.service_confirmed {
            if let Some(pending) = state.pending.take() {
                state.active = pending.secret;
                state.rotated_event_emitted = false;
                state.service_confirmed = false;
                log::info!("Old shared secret retired");
            }
        }
    }
}

/// Picks the live secret for `(topic, seq)`: the pending secret once the
/// topic's declared cutover is reached, the active secret otherwise.
fn select_secret<'a>(state: &'a SecretState, topic: Topic, sequence_number: u32) -> &'a SharedSecret {
    if let Some(pending) = &state.pending {
        if let Some(cutover) = pending.cutovers.get(&topic) {
            if sequence_number.wrapping_sub(*cutover) < HALF_SPACE {
                return &pending.secret;
            }
        }
    }
    &state.active
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn secret16(fill: u8) -> SharedSecret {
        SharedSecret::new(
            vec![fill; 16],
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
        )
        .unwrap()
    }

    fn manager(initial: SharedSecret) -> SecretManager {
        let m = SecretManager::new(initial, |_| 0);
        m.set_event_emitter(|_| true);
        m
    }

    #[test]
    fn test_round_trip() {
        let m = manager(secret16(1));
        let (ct, iv, tag) = m
            .encrypt(Topic::Event, Direction::DeviceToService, 3, b"payload")
            .unwrap();
        let pt = m
            .decrypt(Topic::Event, Direction::DeviceToService, 3, &iv, &ct, &tag)
            .unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn test_tampered_fails_under_every_secret() {
        let m = manager(secret16(1));
        let (ct, iv, tag) = m
            .encrypt(Topic::Event, Direction::DeviceToService, 3, b"payload")
            .unwrap();
        let mut bad = ct.clone();
        bad[0] ^= 1;
        assert!(matches!(
            m.decrypt(Topic::Event, Direction::DeviceToService, 3, &iv, &bad, &tag),
            Err(SecretError::Tampered)
        ));
    }

    #[test]
    fn test_rotation_cutover_selects_secret() {
        let m = manager(secret16(1));
        let new_key = vec![9u8; 16];
        let payload = json!({
            "newSecret": BASE64.encode(&new_key),
            "sequenceNumbers": {"event": 100, "directive": 50},
        });
        m.handle_rotate_secret(Some(&payload)).unwrap();

        // Below the cutover: old secret.
        let (ct, iv, tag) = m
            .encrypt(Topic::Event, Direction::DeviceToService, 99, b"before")
            .unwrap();
        assert!(crypto::decrypt(&[1u8; 16], &iv, &ct, &tag).is_ok());
        assert!(crypto::decrypt(&new_key, &iv, &ct, &tag).is_err());

        // At the cutover: new secret.
        let (ct, iv, tag) = m
            .encrypt(Topic::Event, Direction::DeviceToService, 100, b"after")
            .unwrap();
        assert!(crypto::decrypt(&new_key, &iv, &ct, &tag).is_ok());
        assert!(crypto::decrypt(&[1u8; 16], &iv, &ct, &tag).is_err());
    }

    #[test]
    fn test_event_cutover_raised_to_next_sequence_number() {
        let next = Arc::new(AtomicU32::new(40));
        let next_ref = next.clone();
        let m = SecretManager::new(secret16(1), move |_| next_ref.load(Ordering::SeqCst));
        m.set_event_emitter(|_| true);

        let new_key = vec![7u8; 16];
        let payload = json!({
            "newSecret": BASE64.encode(&new_key),
            "sequenceNumbers": {"event": 10},
        });
        m.handle_rotate_secret(Some(&payload)).unwrap();

        // Sequence 40 (the next event) must already use the new secret;
        // the declared-but-stale cutover of 10 was raised.
        let (ct, iv, tag) = m
            .encrypt(Topic::Event, Direction::DeviceToService, 40, b"x")
            .unwrap();
        assert!(crypto::decrypt(&new_key, &iv, &ct, &tag).is_ok());
        // Below the raised cutover the old secret still applies.
        let (ct, iv, tag) = m
            .encrypt(Topic::Event, Direction::DeviceToService, 39, b"x")
            .unwrap();
        assert!(crypto::decrypt(&[1u8; 16], &iv, &ct, &tag).is_ok());
    }

    #[test]
    fn test_inbound_confirmation_retires_old_secret() {
        let m = manager(secret16(1));
        let new_key = vec![5u8; 16];
        let payload = json!({
            "newSecret": BASE64.encode(&new_key),
            "sequenceNumbers": {"directive": 20, "event": 0},
        });
        m.handle_rotate_secret(Some(&payload)).unwrap();

        // Service speaks with the new secret on the directive topic.
        let iv = crypto::build_nonce(Topic::Directive, Direction::ServiceToDevice, 20);
        let (ct, tag) = crypto::encrypt(&new_key, &iv, b"directive").unwrap();
        let pt = m
            .decrypt(Topic::Directive, Direction::ServiceToDevice, 20, &iv, &ct, &tag)
            .unwrap();
        assert_eq!(pt, b"directive");

        // Rotation complete: the new secret is now the active one.
        assert_eq!(m.active_secret().key(), new_key.as_slice());
    }

    #[test]
    fn test_malformed_rotate_payload() {
        let m = manager(secret16(1));
        assert!(m.handle_rotate_secret(None).is_err());
        assert!(m
            .handle_rotate_secret(Some(&json!({"sequenceNumbers": {}})))
            .is_err());
        assert!(m
            .handle_rotate_secret(Some(&json!({
                "newSecret": "!!!not-base64!!!",
                "sequenceNumbers": {},
            })))
            .is_err());
    }
}
