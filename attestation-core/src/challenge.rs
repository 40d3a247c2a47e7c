//! Challenge-response verification with replay protection.
//!
//! The verifier issues random single-use nonces for a registered device and
//! checks the device's signature over the raw nonce bytes. A nonce is consumed
//! by its first verification attempt whatever the outcome, and the
//! check-and-consume step is atomic, so one verifier can serve a whole fleet.
//!
//! Outstanding challenges do not expire, and consumed challenges stay in the
//! table as tombstones so a late retry is reported as a replay. The table
//! therefore only grows; `issued_at` is recorded so that an expiry and
//! eviction policy can be layered on later.

use crate::crypto::verify_signature;
use crate::types::{DeviceId, Identity, Nonce};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    #[error("Unknown challenge: {0}")]
    UnknownChallenge(Nonce),

    #[error("Challenge already consumed: {0}")]
    ReplayedChallenge(Nonce),

    #[error("No identity registered for device {0}")]
    UnknownIdentity(DeviceId),

    #[error("Identity for device {0} is not a valid Ed25519 key")]
    InvalidIdentity(DeviceId),
}

/// An issued challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub nonce: Nonce,
    pub device_id: DeviceId,
    pub issued_at: DateTime<Utc>,
    consumed: bool,
}

impl Challenge {
    fn new(nonce: Nonce, device_id: DeviceId) -> Self {
        Self {
            nonce,
            device_id,
            issued_at: Utc::now(),
            consumed: false,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Flip to consumed. Returns false if it already was.
    fn consume(&mut self) -> bool {
        !std::mem::replace(&mut self.consumed, true)
    }
}

/// Outcome of a verification attempt that reached the signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub nonce: Nonce,
    pub device_id: DeviceId,
    /// False for an impostor: the signature does not match the registered key
    pub valid: bool,
}

/// Issues challenges and verifies responses against registered identities.
#[derive(Debug, Default)]
pub struct ChallengeVerifier {
    identities: RwLock<HashMap<DeviceId, VerifyingKey>>,
    challenges: Mutex<HashMap<Nonce, Challenge>>,
}

impl ChallengeVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the public key anchored for a device.
    pub fn register_identity(
        &self,
        device_id: DeviceId,
        identity: &Identity,
    ) -> Result<(), ChallengeError> {
        let key = identity
            .verifying_key()
            .map_err(|_| ChallengeError::InvalidIdentity(device_id.clone()))?;

        tracing::info!(
            device = %device_id,
            key_hash = %hex::encode(identity.key_hash),
            "identity registered"
        );
        self.identities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id, key);
        Ok(())
    }

    /// Issue a fresh nonce for `device_id`.
    pub fn generate_challenge(&self, device_id: &DeviceId) -> Result<Nonce, ChallengeError> {
        if !self
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(device_id)
        {
            return Err(ChallengeError::UnknownIdentity(device_id.clone()));
        }

        let mut challenges = self.challenges.lock().unwrap_or_else(PoisonError::into_inner);
        let nonce = loop {
            let candidate = Nonce::random();
            if !challenges.contains_key(&candidate) {
                break candidate;
            }
        };
        challenges.insert(nonce, Challenge::new(nonce, device_id.clone()));

        tracing::debug!(device = %device_id, %nonce, "challenge issued");
        Ok(nonce)
    }

    /// Verify `signature` over the raw bytes of `nonce`.
    ///
    /// The challenge is consumed before the signature is looked at, so a
    /// second attempt is always [`ChallengeError::ReplayedChallenge`].
    pub fn verify(&self, nonce: &Nonce, signature: &[u8]) -> Result<Verification, ChallengeError> {
        let device_id = {
            let mut challenges = self.challenges.lock().unwrap_or_else(PoisonError::into_inner);
            let challenge = challenges
                .get_mut(nonce)
                .ok_or(ChallengeError::UnknownChallenge(*nonce))?;
            if !challenge.consume() {
                tracing::warn!(%nonce, device = %challenge.device_id, "replayed challenge");
                return Err(ChallengeError::ReplayedChallenge(*nonce));
            }
            challenge.device_id.clone()
        };

        let key = self
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .copied()
            .ok_or_else(|| ChallengeError::UnknownIdentity(device_id.clone()))?;

        let valid = verify_signature(&key, nonce.as_bytes(), signature);
        if valid {
            tracing::info!(device = %device_id, %nonce, "challenge verified");
        } else {
            tracing::warn!(device = %device_id, %nonce, "signature does not match registered key");
        }

        Ok(Verification {
            nonce: *nonce,
            device_id,
            valid,
        })
    }

    /// Take back an issued challenge that was never answered.
    ///
    /// Consumed challenges are left in place so they keep reporting replays.
    pub fn withdraw(&self, nonce: &Nonce) -> Option<Challenge> {
        let mut challenges = self.challenges.lock().unwrap_or_else(PoisonError::into_inner);
        if !challenges.get(nonce).is_some_and(|c| !c.is_consumed()) {
            return None;
        }
        tracing::debug!(%nonce, "challenge withdrawn");
        challenges.remove(nonce)
    }

    /// Look up a challenge by nonce.
    pub fn challenge(&self, nonce: &Nonce) -> Option<Challenge> {
        self.challenges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(nonce)
            .cloned()
    }

    /// Number of issued challenges not yet consumed.
    pub fn outstanding(&self) -> usize {
        self.challenges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| !c.is_consumed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_element::SecureElement;
    use std::sync::Arc;

    fn enrolled(element: &SecureElement, id: &str) -> (ChallengeVerifier, DeviceId) {
        let verifier = ChallengeVerifier::new();
        let device_id = DeviceId::from(id);
        verifier
            .register_identity(device_id.clone(), &element.identity().unwrap())
            .unwrap();
        (verifier, device_id)
    }

    #[test]
    fn test_authentic_signature_is_valid() {
        let robot = SecureElement::generate();
        let (verifier, id) = enrolled(&robot, "R-001");

        let nonce = verifier.generate_challenge(&id).unwrap();
        assert_eq!(verifier.outstanding(), 1);

        let signature = robot.sign(nonce.as_bytes()).unwrap();
        let result = verifier.verify(&nonce, &signature.to_bytes()).unwrap();

        assert!(result.valid);
        assert_eq!(result.device_id, id);
        assert_eq!(verifier.outstanding(), 0);
        assert!(verifier.challenge(&nonce).unwrap().is_consumed());
    }

    #[test]
    fn test_impostor_signature_is_invalid() {
        let robot = SecureElement::generate();
        let impostor = SecureElement::generate();
        let (verifier, id) = enrolled(&robot, "R-001");

        let nonce = verifier.generate_challenge(&id).unwrap();
        let forged = impostor.sign(nonce.as_bytes()).unwrap();

        let result = verifier.verify(&nonce, &forged.to_bytes()).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_hex_encoded_message_does_not_verify() {
        let robot = SecureElement::generate();
        let (verifier, id) = enrolled(&robot, "R-001");

        let nonce = verifier.generate_challenge(&id).unwrap();
        let wrong_encoding = robot.sign(nonce.to_string().as_bytes()).unwrap();

        assert!(!verifier.verify(&nonce, &wrong_encoding.to_bytes()).unwrap().valid);
    }

    #[test]
    fn test_second_attempt_is_replay() {
        let robot = SecureElement::generate();
        let (verifier, id) = enrolled(&robot, "R-001");
        let nonce = verifier.generate_challenge(&id).unwrap();
        let signature = robot.sign(nonce.as_bytes()).unwrap().to_bytes();

        // A failed first attempt still burns the nonce.
        assert!(!verifier.verify(&nonce, &[0u8; 64]).unwrap().valid);
        assert_eq!(
            verifier.verify(&nonce, &signature),
            Err(ChallengeError::ReplayedChallenge(nonce))
        );
    }

    #[test]
    fn test_unknown_nonce_and_identity() {
        let verifier = ChallengeVerifier::new();
        let nonce = Nonce::random();
        assert_eq!(
            verifier.verify(&nonce, &[0u8; 64]),
            Err(ChallengeError::UnknownChallenge(nonce))
        );

        let ghost = DeviceId::from("ghost");
        assert_eq!(
            verifier.generate_challenge(&ghost),
            Err(ChallengeError::UnknownIdentity(ghost))
        );
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let verifier = ChallengeVerifier::new();
        let robot = SecureElement::generate();
        let mut identity = robot.identity().unwrap();

        // Roughly half of all encodings are not curve points.
        identity.public_key = (0u8..=255)
            .map(|b| [b; 32])
            .find(|bytes| VerifyingKey::from_bytes(bytes).is_err())
            .unwrap();

        assert_eq!(
            verifier.register_identity(DeviceId::from("bad"), &identity),
            Err(ChallengeError::InvalidIdentity(DeviceId::from("bad")))
        );
    }

    #[test]
    fn test_withdraw_only_unanswered() {
        let robot = SecureElement::generate();
        let (verifier, id) = enrolled(&robot, "R-001");

        let nonce = verifier.generate_challenge(&id).unwrap();
        assert_eq!(verifier.withdraw(&nonce).map(|c| c.nonce), Some(nonce));
        assert_eq!(verifier.outstanding(), 0);
        assert_eq!(
            verifier.verify(&nonce, &[0u8; 64]),
            Err(ChallengeError::UnknownChallenge(nonce))
        );

        let answered = verifier.generate_challenge(&id).unwrap();
        verifier.verify(&answered, &[0u8; 64]).unwrap();
        assert!(verifier.withdraw(&answered).is_none());
        assert_eq!(
            verifier.verify(&answered, &[0u8; 64]),
            Err(ChallengeError::ReplayedChallenge(answered))
        );
    }

    #[test]
    fn test_concurrent_verify_consumes_once() {
        let robot = SecureElement::generate();
        let (verifier, id) = enrolled(&robot, "R-001");
        let verifier = Arc::new(verifier);

        let nonce = verifier.generate_challenge(&id).unwrap();
        let signature = robot.sign(nonce.as_bytes()).unwrap().to_bytes();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let verifier = Arc::clone(&verifier);
                std::thread::spawn(move || verifier.verify(&nonce, &signature))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let replayed = results
            .iter()
            .filter(|r| matches!(r, Err(ChallengeError::ReplayedChallenge(_))))
            .count();

        assert_eq!(accepted, 1);
        assert_eq!(replayed, 15);
    }
}
