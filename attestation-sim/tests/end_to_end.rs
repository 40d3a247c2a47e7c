//! Full host/device flows over TCP.

use attestation_core::{
    ChallengeError, ChallengeVerifier, DeviceId, InMemoryLedger, LedgerBridge, LedgerError,
    LedgerEvent, Mutation,
};
use attestation_sim::{ClientError, DeviceClient, KeyProvisioning, SimConfig, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start(provisioning: KeyProvisioning) -> SocketAddr {
    let config = SimConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        provisioning,
        ..SimConfig::default()
    };
    attestation_sim::spawn(config).await.unwrap()
}

#[tokio::test]
async fn test_enrolled_device_answers_challenge_once() {
    let addr = start(KeyProvisioning::PerSession).await;
    let mut device = DeviceClient::connect(addr).await.unwrap();

    let bridge = LedgerBridge::new(Arc::new(ChallengeVerifier::new()), InMemoryLedger::new());
    let id = DeviceId::from("ROBOT-001");

    let identity = device.identity().await.unwrap();
    assert!(identity.is_consistent());
    bridge.enroll(&id, &identity).await.unwrap();

    let (nonce, _) = bridge.issue(&id).await.unwrap();
    let signature = device.challenge(&nonce).await.unwrap();

    let settlement = bridge.settle(&nonce, &signature).await.unwrap();
    assert!(settlement.valid);
    assert_eq!(
        bridge.ledger().lookup(&settlement.audit),
        Some(LedgerEvent::ChallengeVerified { nonce, valid: true })
    );

    let replay = bridge.settle(&nonce, &signature).await;
    assert!(matches!(
        replay,
        Err(LedgerError::Challenge(ChallengeError::ReplayedChallenge(n))) if n == nonce
    ));
}

#[tokio::test]
async fn test_other_session_key_is_an_impostor() {
    let addr = start(KeyProvisioning::PerSession).await;
    let mut genuine = DeviceClient::connect(addr).await.unwrap();
    let mut impostor = DeviceClient::connect(addr).await.unwrap();

    let verifier = ChallengeVerifier::new();
    let id = DeviceId::from("ROBOT-002");
    verifier
        .register_identity(id.clone(), &genuine.identity().await.unwrap())
        .unwrap();

    let nonce = verifier.generate_challenge(&id).unwrap();
    let forged = impostor.challenge(&nonce).await.unwrap();
    assert!(!verifier.verify(&nonce, &forged).unwrap().valid);

    // The nonce is spent even though the signature failed.
    let signature = genuine.challenge(&nonce).await.unwrap();
    assert_eq!(
        verifier.verify(&nonce, &signature),
        Err(ChallengeError::ReplayedChallenge(nonce))
    );
}

#[tokio::test]
async fn test_fixed_key_is_shared_across_sessions() {
    let addr = start(KeyProvisioning::Fixed([7; 32])).await;
    let mut first = DeviceClient::connect(addr).await.unwrap();
    let mut second = DeviceClient::connect(addr).await.unwrap();
    assert_eq!(
        first.identity().await.unwrap(),
        second.identity().await.unwrap()
    );
}

#[tokio::test]
async fn test_tamper_detection_over_tcp() {
    let addr = start(KeyProvisioning::PerSession).await;
    let mut device = DeviceClient::connect(addr).await.unwrap();

    match device.verify_state().await {
        Err(ClientError::Rejected { status, reason }) => {
            assert_eq!(status, Status::NoCheckpoint);
            assert!(reason.contains("No checkpoint"));
        }
        other => panic!("expected NoCheckpoint, got {:?}", other),
    }

    let identity = device.identity().await.unwrap();
    let checkpoint = device.checkpoint().await.unwrap();
    checkpoint
        .verify_signature(&identity.verifying_key().unwrap())
        .unwrap();

    let report = device.verify_state().await.unwrap();
    assert!(report.verified);

    device.mutate(Mutation::Firmware, None).await.unwrap();
    let report = device.verify_state().await.unwrap();
    assert!(!report.verified);
    assert_eq!(report.checkpoint_hash, checkpoint.state_hash);
    assert_ne!(report.current_hash, checkpoint.state_hash);
}

#[tokio::test]
async fn test_sessions_do_not_share_state() {
    let addr = start(KeyProvisioning::PerSession).await;
    let mut a = DeviceClient::connect(addr).await.unwrap();
    let mut b = DeviceClient::connect(addr).await.unwrap();

    a.checkpoint().await.unwrap();
    assert!(matches!(
        b.verify_state().await,
        Err(ClientError::Rejected {
            status: Status::NoCheckpoint,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unknown_tag_is_rejected_and_session_continues() {
    let addr = start(KeyProvisioning::PerSession).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"Q\nI\n").await.unwrap();

    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], Status::Malformed as u8);
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut reason = vec![0u8; len];
    stream.read_exact(&mut reason).await.unwrap();
    assert!(String::from_utf8(reason).unwrap().contains("unknown command tag"));

    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], Status::Ok as u8);
}

#[tokio::test]
async fn test_unprovisioned_device_fails_and_disconnects() {
    let addr = start(KeyProvisioning::Unprovisioned).await;
    let mut device = DeviceClient::connect(addr).await.unwrap();

    match device.checkpoint().await {
        Err(ClientError::Rejected { status, .. }) => assert_eq!(status, Status::Fatal),
        other => panic!("expected Fatal, got {:?}", other),
    }

    assert!(matches!(
        device.identity().await,
        Err(ClientError::ConnectionClosed) | Err(ClientError::Io(_))
    ));
}
