//! Example: checkpointing a device and catching a firmware swap
//!
//! Run with: cargo run --example tamper_detection

use attestation_core::{
    ChallengeVerifier, CheckpointStore, Device, DeviceId, DeviceState, Mutation, SecureElement,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🤖 Robot Root of Trust - Tamper Detection\n");
    println!("==============================================\n");

    // Step 1: Provision the secure element (in hardware, the key never leaves the chip)
    println!("1️⃣  Provisioning secure element...");
    let element = SecureElement::generate();
    let identity = element.identity()?;
    println!("   ✓ Public key: {}...", &hex::encode(identity.public_key)[..16]);
    println!("   ✓ Key hash:   {}...\n", &hex::encode(identity.key_hash)[..16]);

    // Step 2: Boot the device
    println!("2️⃣  Booting device...");
    let mut device = Device::new();
    device.record_boot();
    device.subscribe(Box::new(|kind: Mutation, _: &DeviceState| {
        println!("   ⚠  Observer: state mutated ({})", kind);
    }));
    println!("   ✓ Boot count: {}\n", device.state().boot_count);

    // Step 3: Enroll and answer a challenge
    println!("3️⃣  Challenge-response with the verifier...");
    let verifier = ChallengeVerifier::new();
    let id = DeviceId::from("ROBOT-001");
    verifier.register_identity(id.clone(), &identity)?;
    let nonce = verifier.generate_challenge(&id)?;
    let signature = element.sign(nonce.as_bytes())?.to_bytes();
    println!("   ✓ Nonce: {}...", &nonce.to_string()[..16]);
    println!("   ✓ Valid: {}", verifier.verify(&nonce, &signature)?.valid);
    match verifier.verify(&nonce, &signature) {
        Ok(_) => println!("   ❌ Replay accepted\n"),
        Err(e) => println!("   ✓ Replay refused: {}\n", e),
    }

    // Step 4: Checkpoint the known-good state
    println!("4️⃣  Taking checkpoint...");
    let mut store = CheckpointStore::new();
    let checkpoint = store.create_checkpoint(&element, device.state())?.clone();
    checkpoint.verify_signature(&identity.verifying_key()?)?;
    println!("   ✓ State hash: {}...", &hex::encode(checkpoint.state_hash)[..16]);
    println!("   ✓ Signed at:  {}\n", checkpoint.timestamp);

    let report = store.verify_against_checkpoint(device.state())?;
    println!("   Verified before tampering: {}\n", report.verified);

    // Step 5: Reflash the firmware behind the checkpoint's back
    println!("5️⃣  Simulating unauthorized reflash...");
    device.apply_mutation(Mutation::Firmware, None);

    let report = store.verify_against_checkpoint(device.state())?;
    println!("   Current hash:    {}...", &hex::encode(report.current_hash)[..16]);
    println!("   Checkpoint hash: {}...", &hex::encode(report.checkpoint_hash)[..16]);
    if report.verified {
        println!("   ❌ Tampering went unnoticed\n");
    } else {
        println!("   ✅ Tampering DETECTED\n");
    }

    println!("==============================================");
    Ok(())
}
