//! Cryptographic primitives shared by the secure element and the verifier.

use crate::types::Hash256;
pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> Hash256 {
    let hash = Sha256::digest(data);
    hash.into()
}

/// Fill an array from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Strictly verify an Ed25519 signature given as raw bytes.
///
/// Malformed signature bytes (wrong length, non-canonical encoding) verify as
/// `false` instead of surfacing an error: to a verifier they are just another
/// signature that does not match.
pub fn verify_signature(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer as _;

    #[test]
    fn test_sha256() {
        let data = b"test data";
        let hash1 = sha256(data);
        let hash2 = sha256(data);
        assert_eq!(hash1, hash2);
        assert_ne!(hash1, sha256(b"test datA"));
    }

    #[test]
    fn test_verify_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let message = b"challenge";
        let signature = key.sign(message).to_bytes();

        assert!(verify_signature(&key.verifying_key(), message, &signature));
        assert!(!verify_signature(&key.verifying_key(), b"other", &signature));
    }

    #[test]
    fn test_malformed_signature_is_invalid() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        assert!(!verify_signature(&key, b"m", &[]));
        assert!(!verify_signature(&key, b"m", &[0u8; 63]));
        assert!(!verify_signature(&key, b"m", &[0xff; 64]));
    }
}
