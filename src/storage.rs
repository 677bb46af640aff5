//! Persistent state: the application supplies a blob store, the SDK
//! supplies the keys and record formats layered on top of it.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::crypto::SecretDerivationAlgorithm;
use crate::secret::SharedSecret;

/// Key under which the service-assigned topic root is persisted.
pub const TOPIC_ROOT_KEY: &str = "AiaTopicRootKey";
/// Key for the last-known speaker volume (one byte, 0..=100).
pub const SPEAKER_VOLUME_KEY: &str = "AiaSpeakerVolumeKey";
/// Key for the volume used for alert playback (one byte, 0..=100).
pub const ALERT_VOLUME_KEY: &str = "AiaAlertVolumeKey";
/// Key for the persisted alert records.
pub const ALERTS_KEY: &str = "AiaAlertsKey";
/// Key for the active shared secret.
pub const SHARED_SECRET_KEY: &str = "AiaSharedSecretKey";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failure: {0}")]
    Io(String),
    #[error("Stored value for {0} is corrupt")]
    Corrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Application-supplied persistent blob store.
pub trait KeyValueStore: Send + Sync {
    fn store_blob(&self, key: &str, value: &[u8]) -> Result<()>;
    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove_blob(&self, key: &str) -> Result<()>;
}

/// In-memory store for tests and demos.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn store_blob(&self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned())
    }

    fn remove_blob(&self, key: &str) -> Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

pub fn store_topic_root(store: &dyn KeyValueStore, topic_root: &[u8]) -> Result<()> {
    log::debug!("Storing topic root {}", hex::encode(topic_root));
    store.store_blob(TOPIC_ROOT_KEY, topic_root)
}

pub fn load_topic_root(store: &dyn KeyValueStore) -> Result<Option<Vec<u8>>> {
    store.load_blob(TOPIC_ROOT_KEY)
}

/// Persists a volume byte; values above 100 are rejected as corrupt
/// rather than silently clamped.
pub fn store_volume(store: &dyn KeyValueStore, key: &'static str, volume: u8) -> Result<()> {
    if volume > 100 {
        return Err(StorageError::Corrupt(key));
    }
    store.store_blob(key, &[volume])
}

pub fn load_volume(store: &dyn KeyValueStore, key: &'static str) -> Result<Option<u8>> {
    match store.load_blob(key)? {
        None => Ok(None),
        Some(blob) => match blob.as_slice() {
            [volume] if *volume <= 100 => Ok(Some(*volume)),
            _ => Err(StorageError::Corrupt(key)),
        },
    }
}

/// Persists the active shared secret as
/// `algorithm_id || key_bytes`.
pub fn store_shared_secret(store: &dyn KeyValueStore, secret: &SharedSecret) -> Result<()> {
    let mut blob = Vec::with_capacity(1 + secret.key().len());
    blob.push(secret.algorithm().storage_id());
    blob.extend_from_slice(secret.key());
    store.store_blob(SHARED_SECRET_KEY, &blob)
}

pub fn load_shared_secret(store: &dyn KeyValueStore) -> Result<Option<SharedSecret>> {
    let Some(blob) = store.load_blob(SHARED_SECRET_KEY)? else {
        return Ok(None);
    };
    if blob.is_empty() {
        return Err(StorageError::Corrupt(SHARED_SECRET_KEY));
    }
    let algorithm = SecretDerivationAlgorithm::from_storage_id(blob[0])
        .map_err(|_| StorageError::Corrupt(SHARED_SECRET_KEY))?;
    SharedSecret::new(blob[1..].to_vec(), algorithm)
        .map(Some)
        .map_err(|_| StorageError::Corrupt(SHARED_SECRET_KEY))
}
