//! Ledger collaborator interface.
//!
//! The ledger anchors device identities and keeps an audit trail of issued
//! challenges and verification outcomes. It lives outside this crate (an
//! on-chain registry in production); the core only calls out to it through
//! the [`Ledger`] trait and assumes nothing about its persistence.

use crate::challenge::{ChallengeError, ChallengeVerifier};
use crate::types::{DeviceId, Identity, Nonce};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Reference to a ledger record (transaction hash, row id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuditRef(pub String);

impl fmt::Display for AuditRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait implemented by ledger backends.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Anchor the public identity of a device.
    async fn anchor_identity(
        &self,
        device_id: &DeviceId,
        identity: &Identity,
    ) -> Result<AuditRef, LedgerError>;

    /// Record that `nonce` was issued to `device_id`.
    async fn record_challenge(
        &self,
        device_id: &DeviceId,
        nonce: &Nonce,
    ) -> Result<AuditRef, LedgerError>;

    /// Record the outcome of verifying the response to `nonce`.
    async fn record_outcome(&self, nonce: &Nonce, valid: bool) -> Result<AuditRef, LedgerError>;
}

/// Errors from the ledger or from the challenge protocol it relays.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger rejected the record: {0}")]
    Rejected(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),
}

/// Events recorded by [`InMemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    IdentityAnchored { device_id: DeviceId, identity: Identity },
    ChallengeIssued { device_id: DeviceId, nonce: Nonce },
    ChallengeVerified { nonce: Nonce, valid: bool },
}

/// Ledger kept in process memory, for the simulator and tests.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    events: Mutex<Vec<(AuditRef, LedgerEvent)>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Look up the event recorded under `audit`.
    pub fn lookup(&self, audit: &AuditRef) -> Option<LedgerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(reference, _)| reference == audit)
            .map(|(_, event)| event.clone())
    }

    fn append(&self, event: LedgerEvent) -> AuditRef {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let audit = AuditRef(format!("audit-{:06}", events.len() + 1));
        events.push((audit.clone(), event));
        audit
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn anchor_identity(
        &self,
        device_id: &DeviceId,
        identity: &Identity,
    ) -> Result<AuditRef, LedgerError> {
        if !identity.is_consistent() {
            return Err(LedgerError::Rejected(format!(
                "key hash does not match public key for {}",
                device_id
            )));
        }
        Ok(self.append(LedgerEvent::IdentityAnchored {
            device_id: device_id.clone(),
            identity: *identity,
        }))
    }

    async fn record_challenge(
        &self,
        device_id: &DeviceId,
        nonce: &Nonce,
    ) -> Result<AuditRef, LedgerError> {
        Ok(self.append(LedgerEvent::ChallengeIssued {
            device_id: device_id.clone(),
            nonce: *nonce,
        }))
    }

    async fn record_outcome(&self, nonce: &Nonce, valid: bool) -> Result<AuditRef, LedgerError> {
        Ok(self.append(LedgerEvent::ChallengeVerified {
            nonce: *nonce,
            valid,
        }))
    }
}

/// Outcome of a settled challenge, with the ledger's audit reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub valid: bool,
    pub audit: AuditRef,
}

/// Runs verification rounds against a verifier and mirrors them to a ledger.
pub struct LedgerBridge<L> {
    verifier: Arc<ChallengeVerifier>,
    ledger: L,
}

impl<L: Ledger> LedgerBridge<L> {
    pub fn new(verifier: Arc<ChallengeVerifier>, ledger: L) -> Self {
        Self { verifier, ledger }
    }

    pub fn verifier(&self) -> &Arc<ChallengeVerifier> {
        &self.verifier
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Anchor the identity on the ledger, then register it with the verifier.
    pub async fn enroll(
        &self,
        device_id: &DeviceId,
        identity: &Identity,
    ) -> Result<AuditRef, LedgerError> {
        let audit = self.ledger.anchor_identity(device_id, identity).await?;
        self.verifier.register_identity(device_id.clone(), identity)?;
        Ok(audit)
    }

    /// Issue a challenge and record it.
    ///
    /// If the ledger refuses the record the challenge is withdrawn, so no
    /// unaudited nonce stays outstanding.
    pub async fn issue(&self, device_id: &DeviceId) -> Result<(Nonce, AuditRef), LedgerError> {
        let nonce = self.verifier.generate_challenge(device_id)?;
        match self.ledger.record_challenge(device_id, &nonce).await {
            Ok(audit) => Ok((nonce, audit)),
            Err(e) => {
                self.verifier.withdraw(&nonce);
                Err(e)
            }
        }
    }

    /// Verify a response and record the outcome.
    ///
    /// Unknown and replayed nonces are returned as errors without a ledger
    /// record; the first attempt already produced one.
    pub async fn settle(&self, nonce: &Nonce, signature: &[u8]) -> Result<Settlement, LedgerError> {
        let verification = self.verifier.verify(nonce, signature)?;
        let audit = self
            .ledger
            .record_outcome(nonce, verification.valid)
            .await?;
        Ok(Settlement {
            valid: verification.valid,
            audit,
        })
    }
}

impl<L> fmt::Debug for LedgerBridge<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerBridge")
            .field("outstanding", &self.verifier.outstanding())
            .finish_non_exhaustive()
    }
}
