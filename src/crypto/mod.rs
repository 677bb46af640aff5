//! Cryptographic primitives: AEAD for topic payloads and ECDH for the
//! registration-time shared secret.

mod aead;
mod ecdh;

pub use aead::{build_nonce, decrypt, encrypt, IV_SIZE, TAG_SIZE};
pub use ecdh::{
    derive_shared_secret, generate_keypair, SecretDerivationAlgorithm, ECDH_KEY_SIZE,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Unknown secret derivation algorithm: {0}")]
    UnknownAlgorithm(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
