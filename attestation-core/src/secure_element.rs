//! Emulated secure element.
//!
//! The secure element holds the device's Ed25519 private key and performs all
//! signing. No operation returns key material; only the public identity leaves.

use crate::device::DeviceState;
use crate::serialization::{to_canonical_cbor, SerializationError};
use crate::types::{Hash256, Identity};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecureElementError {
    /// The element was never provisioned with a key. Fatal for a session.
    #[error("Secure element has no key provisioned")]
    KeyNotProvisioned,
}

/// Compute the integrity digest of a device state.
///
/// `SHA-256(firmware_hash || canonical_cbor(flags) || boot_count as u64 BE)`.
/// Checkpoint signatures are made over exactly this digest, so the layout
/// must never change.
pub fn state_hash(state: &DeviceState) -> Result<Hash256, SerializationError> {
    let flags = to_canonical_cbor(&state.flags)?;

    let mut hasher = Sha256::new();
    hasher.update(state.firmware_hash);
    hasher.update(&flags);
    hasher.update(state.boot_count.to_be_bytes());
    Ok(hasher.finalize().into())
}

/// Software stand-in for a hardware secure element.
pub struct SecureElement {
    signing_key: Option<SigningKey>,
}

impl SecureElement {
    /// Create an element holding the given key.
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key: Some(signing_key),
        }
    }

    /// Provision a fresh random key from the OS CSPRNG.
    pub fn generate() -> Self {
        use rand::rngs::OsRng;
        let mut csprng = OsRng;
        Self::new(SigningKey::generate(&mut csprng))
    }

    /// Provision from a 32-byte Ed25519 secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(secret))
    }

    /// An element with no key. Every signing request fails.
    pub fn unprovisioned() -> Self {
        Self { signing_key: None }
    }

    pub fn is_provisioned(&self) -> bool {
        self.signing_key.is_some()
    }

    fn key(&self) -> Result<&SigningKey, SecureElementError> {
        self.signing_key
            .as_ref()
            .ok_or(SecureElementError::KeyNotProvisioned)
    }

    /// Sign a message. Ed25519 is deterministic: same key and message, same signature.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, SecureElementError> {
        use ed25519_dalek::Signer as _;
        Ok(self.key()?.sign(message))
    }

    /// Get the verifying (public) key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, SecureElementError> {
        Ok(self.key()?.verifying_key())
    }

    /// Public identity: verifying key and its hash.
    pub fn identity(&self) -> Result<Identity, SecureElementError> {
        Ok(Identity::from_verifying_key(&self.verifying_key()?))
    }

    /// Digest of `state`, as signed into checkpoints.
    pub fn state_hash(&self, state: &DeviceState) -> Result<Hash256, SerializationError> {
        state_hash(state)
    }
}

impl fmt::Debug for SecureElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let public = self
            .signing_key
            .as_ref()
            .map(|key| hex::encode(key.verifying_key().to_bytes()));
        f.debug_struct("SecureElement")
            .field("public_key", &public)
            .finish_non_exhaustive()
    }
}
