//! AES-GCM with a detached tag, keyed by the 16- or 32-byte shared
//! secret. The nonce is deterministic: every `(topic, direction,
//! sequence number)` triple maps to a unique 12-byte value, so a secret
//! is never reused with the same nonce as long as sequence numbers
//! allocate monotonically.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce, Tag};

use crate::topic::{Direction, Topic};

use super::{CryptoError, Result};

/// Nonce length on the wire.
pub const IV_SIZE: usize = 12;

/// Authentication tag length on the wire.
pub const TAG_SIZE: usize = 16;

/// Builds the deterministic nonce for a message:
/// `topic_id || direction || sequence_number (LE)`, zero padded.
pub fn build_nonce(topic: Topic, direction: Direction, sequence_number: u32) -> [u8; IV_SIZE] {
    let mut nonce = [0u8; IV_SIZE];
    nonce[0] = topic.id();
    nonce[1] = direction.byte();
    nonce[2..6].copy_from_slice(&sequence_number.to_le_bytes());
    nonce
}

/// Encrypts `plaintext`, returning the ciphertext and detached tag.
pub fn encrypt(key: &[u8], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    let nonce = Nonce::from_slice(iv);
    let mut buffer = plaintext.to_vec();
    let tag = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .encrypt_in_place_detached(nonce, &[], &mut buffer),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .encrypt_in_place_detached(nonce, &[], &mut buffer),
        other => return Err(CryptoError::InvalidKeyLength(other)),
    }
    .map_err(|_| CryptoError::EncryptionFailed)?;
    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    Ok((buffer, tag_bytes))
}

/// Decrypts `ciphertext`, verifying the detached tag.
pub fn decrypt(
    key: &[u8],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>> {
    let nonce = Nonce::from_slice(iv);
    let tag = Tag::from_slice(tag);
    let mut buffer = ciphertext.to_vec();
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .decrypt_in_place_detached(nonce, &[], &mut buffer, tag),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .decrypt_in_place_detached(nonce, &[], &mut buffer, tag),
        other => return Err(CryptoError::InvalidKeyLength(other)),
    }
    .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(buffer)
}
