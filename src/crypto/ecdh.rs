//! ECDH over Curve25519 for registration-time shared secret derivation.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{CryptoError, Result};

/// X25519 public and private keys are both 32 bytes.
pub const ECDH_KEY_SIZE: usize = 32;

/// How the shared secret is derived from the raw ECDH output. The
/// algorithm also fixes the AEAD key size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretDerivationAlgorithm {
    /// HKDF-SHA-256 (no salt, no info) over the 32-byte ECDH output,
    /// truncated to 16 bytes.
    EcdhCurve25519Sha256Truncated16,
    /// The raw 32-byte ECDH output.
    EcdhCurve25519Raw32,
}

impl SecretDerivationAlgorithm {
    /// Resulting shared secret length in bytes.
    pub fn key_size(self) -> usize {
        match self {
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16 => 16,
            SecretDerivationAlgorithm::EcdhCurve25519Raw32 => 32,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16 => {
                "ECDH_CURVE_25519_16_BYTE_SHA256"
            }
            SecretDerivationAlgorithm::EcdhCurve25519Raw32 => "ECDH_CURVE_25519_32_BYTE",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ECDH_CURVE_25519_16_BYTE_SHA256" => {
                Ok(SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16)
            }
            "ECDH_CURVE_25519_32_BYTE" => Ok(SecretDerivationAlgorithm::EcdhCurve25519Raw32),
            other => Err(CryptoError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Single-byte identifier used in persistent storage.
    pub fn storage_id(self) -> u8 {
        match self {
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16 => 0,
            SecretDerivationAlgorithm::EcdhCurve25519Raw32 => 1,
        }
    }

    pub fn from_storage_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16),
            1 => Ok(SecretDerivationAlgorithm::EcdhCurve25519Raw32),
            other => Err(CryptoError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Generates an X25519 keypair for registration.
///
/// Returns `(public_key, private_key)`.
pub fn generate_keypair() -> ([u8; ECDH_KEY_SIZE], [u8; ECDH_KEY_SIZE]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public.to_bytes(), secret.to_bytes())
}

/// Derives the shared secret from our private key and the service's
/// public key, per the negotiated algorithm.
pub fn derive_shared_secret(
    our_private_key: &[u8],
    service_public_key: &[u8],
    algorithm: SecretDerivationAlgorithm,
) -> Result<Vec<u8>> {
    if our_private_key.len() != ECDH_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength(our_private_key.len()));
    }
    if service_public_key.len() != ECDH_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength(service_public_key.len()));
    }

    let mut secret_bytes = [0u8; ECDH_KEY_SIZE];
    secret_bytes.copy_from_slice(our_private_key);
    let secret = StaticSecret::from(secret_bytes);

    let mut public_bytes = [0u8; ECDH_KEY_SIZE];
    public_bytes.copy_from_slice(service_public_key);
    let public = PublicKey::from(public_bytes);

    let raw = Zeroizing::new(secret.diffie_hellman(&public).to_bytes());

    match algorithm {
        SecretDerivationAlgorithm::EcdhCurve25519Raw32 => Ok(raw.to_vec()),
        SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16 => {
            let hkdf = Hkdf::<Sha256>::new(None, raw.as_ref());
            let mut okm = [0u8; 32];
            hkdf.expand(&[], &mut okm)
                .map_err(|_| CryptoError::KeyDerivationFailed)?;
            Ok(okm[..16].to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let (device_public, device_private) = generate_keypair();
        let (service_public, service_private) = generate_keypair();

        for algorithm in [
            SecretDerivationAlgorithm::EcdhCurve25519Raw32,
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
        ] {
            let device_secret =
                derive_shared_secret(&device_private, &service_public, algorithm).unwrap();
            let service_secret =
                derive_shared_secret(&service_private, &device_public, algorithm).unwrap();
            assert_eq!(device_secret, service_secret);
            assert_eq!(device_secret.len(), algorithm.key_size());
        }
    }

    #[test]
    fn test_truncated_secret_differs_from_raw() {
        let (_, private) = generate_keypair();
        let (peer_public, _) = generate_keypair();
        let raw = derive_shared_secret(
            &private,
            &peer_public,
            SecretDerivationAlgorithm::EcdhCurve25519Raw32,
        )
        .unwrap();
        let truncated = derive_shared_secret(
            &private,
            &peer_public,
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
        )
        .unwrap();
        assert_ne!(&raw[..16], truncated.as_slice());
    }

    #[test]
    fn test_algorithm_string_round_trip() {
        for algorithm in [
            SecretDerivationAlgorithm::EcdhCurve25519Raw32,
            SecretDerivationAlgorithm::EcdhCurve25519Sha256Truncated16,
        ] {
            assert_eq!(
                SecretDerivationAlgorithm::from_str(algorithm.as_str()).unwrap(),
                algorithm
            );
            assert_eq!(
                SecretDerivationAlgorithm::from_storage_id(algorithm.storage_id()).unwrap(),
                algorithm
            );
        }
    }
}
