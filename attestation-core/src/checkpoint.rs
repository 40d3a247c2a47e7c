//! Signed state checkpoints and tamper detection.
//!
//! A checkpoint is a signed snapshot of the device state digest at a point in
//! time. Comparing a freshly computed digest against the checkpoint digest is
//! the tamper signal: a mismatch is a successful answer, not an error.

use crate::device::DeviceState;
use crate::secure_element::{state_hash, SecureElement, SecureElementError};
use crate::serialization::{from_canonical_cbor, to_canonical_cbor, SerializationError};
use crate::types::*;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A signed state checkpoint.
///
/// The signature covers the raw 32-byte `state_hash`. Timestamps carry
/// millisecond precision, which is what the wire format can express.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Creation time (milliseconds since the Unix epoch on the wire)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Digest of the device state at creation time
    #[serde(with = "hex_array")]
    pub state_hash: Hash256,

    /// Ed25519 signature over `state_hash`
    pub signature: SignatureBytes,
}

impl Checkpoint {
    /// Verify the signature on this checkpoint.
    pub fn verify_signature(
        &self,
        public_key: &ed25519_dalek::VerifyingKey,
    ) -> Result<(), SignatureError> {
        if crate::crypto::verify_signature(public_key, &self.state_hash, &self.signature.0) {
            Ok(())
        } else {
            Err(SignatureError::InvalidSignature)
        }
    }

    /// Serialize to canonical CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        to_canonical_cbor(self)
    }

    /// Deserialize from canonical CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        from_canonical_cbor(bytes)
    }
}

/// Builder for constructing checkpoints.
#[derive(Debug, Default)]
pub struct CheckpointBuilder {
    timestamp: Option<DateTime<Utc>>,
    state_hash: Option<Hash256>,
}

impl CheckpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn state_hash(mut self, hash: Hash256) -> Self {
        self.state_hash = Some(hash);
        self
    }

    /// Build and sign the checkpoint with the secure element.
    pub fn build_and_sign(self, element: &SecureElement) -> Result<Checkpoint, CheckpointError> {
        let state_hash = self
            .state_hash
            .ok_or(CheckpointError::MissingField("state_hash"))?;
        let timestamp = self.timestamp.unwrap_or_else(Utc::now).trunc_subsecs(3);

        let signature = element.sign(&state_hash)?;

        Ok(Checkpoint {
            timestamp,
            state_hash,
            signature: SignatureBytes::from(signature),
        })
    }
}

/// Result of comparing the current state against the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TamperReport {
    /// True when the digests are byte-identical
    pub verified: bool,
    #[serde(with = "hex_array")]
    pub current_hash: Hash256,
    #[serde(with = "hex_array")]
    pub checkpoint_hash: Hash256,
}

/// Holds the single current checkpoint of a session.
///
/// Taking a new checkpoint replaces the old one; there is no history.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    current: Option<Checkpoint>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    /// Hash `state`, sign the digest and make it the current checkpoint.
    pub fn create_checkpoint(
        &mut self,
        element: &SecureElement,
        state: &DeviceState,
    ) -> Result<&Checkpoint, CheckpointError> {
        let checkpoint = CheckpointBuilder::new()
            .state_hash(state_hash(state)?)
            .build_and_sign(element)?;

        tracing::debug!(
            state_hash = %hex::encode(checkpoint.state_hash),
            "checkpoint created"
        );

        Ok(self.current.insert(checkpoint))
    }

    /// Compare the digest of `state` with the current checkpoint.
    pub fn verify_against_checkpoint(
        &self,
        state: &DeviceState,
    ) -> Result<TamperReport, CheckpointError> {
        let checkpoint = self.current.as_ref().ok_or(CheckpointError::NoCheckpoint)?;
        let current_hash = state_hash(state)?;

        Ok(TamperReport {
            verified: current_hash == checkpoint.state_hash,
            current_hash,
            checkpoint_hash: checkpoint.state_hash,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("No checkpoint")]
    NoCheckpoint,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    SecureElement(#[from] SecureElementError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid signature")]
    InvalidSignature,
}
