//! # Attestation Core
//!
//! Emulated hardware root of trust for a robot: a secure element that proves
//! possession of its key, a measured device state, signed state checkpoints
//! for tamper detection, and a challenge-response verifier.
//!
//! ## Key Features
//! - **Secure element**: Ed25519 signing, key material never leaves
//! - **Deterministic state hash**: fixed byte layout with canonical CBOR flags
//! - **Tamper detection**: one signed checkpoint per session, exact digest comparison
//! - **Replay protection**: single-use nonces with atomic check-and-consume
//! - **Ledger interface**: pluggable collaborator for identity anchoring and audit

pub mod challenge;
pub mod checkpoint;
pub mod crypto;
pub mod device;
pub mod ledger;
pub mod secure_element;
pub mod serialization;
pub mod types;

pub use challenge::{Challenge, ChallengeError, ChallengeVerifier, Verification};
pub use checkpoint::{Checkpoint, CheckpointBuilder, CheckpointError, CheckpointStore, TamperReport};
pub use device::{ChannelObserver, Device, DeviceState, Mutation, SecurityFlags, StateObserver};
pub use ledger::{AuditRef, InMemoryLedger, Ledger, LedgerBridge, LedgerError, LedgerEvent, Settlement};
pub use secure_element::{state_hash, SecureElement, SecureElementError};
pub use types::*;

/// Re-export for convenience
pub use ed25519_dalek::{Signature, VerifyingKey};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.1.0");
    }

    /// Full round: enroll, challenge, sign, verify, replay.
    #[test]
    fn test_end_to_end_challenge() {
        let element = SecureElement::generate();
        let verifier = ChallengeVerifier::new();
        let id = DeviceId::from("ROBOT-001");
        verifier
            .register_identity(id.clone(), &element.identity().unwrap())
            .unwrap();

        let nonce = verifier.generate_challenge(&id).unwrap();
        let z = element.sign(nonce.as_bytes()).unwrap().to_bytes();

        assert!(verifier.verify(&nonce, &z).unwrap().valid);
        assert_eq!(
            verifier.verify(&nonce, &z),
            Err(ChallengeError::ReplayedChallenge(nonce))
        );
    }
}
