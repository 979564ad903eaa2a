// Signer Tests
// Domain-separated Ed25519 signatures over raw messages and over packets

use blemesh::identity::{Keypair, PeerId, SignContext, Signature, Signer, SIGNATURE_LEN};
use blemesh::wire::{MessageType, Packet};

#[test]
fn test_sign_and_verify() {
    let keypair = Keypair::generate();
    let signature = Signer::sign(&keypair, SignContext::Packet, b"mesh");

    assert_eq!(signature.as_bytes().len(), SIGNATURE_LEN);
    assert!(Signer::verify(&keypair.public_key(), SignContext::Packet, b"mesh", &signature));
    assert!(!Signer::verify(&keypair.public_key(), SignContext::Packet, b"mesH", &signature));
    assert!(!Signer::verify(
        &Keypair::generate().public_key(),
        SignContext::Packet,
        b"mesh",
        &signature
    ));
}

#[test]
fn test_packet_signature_is_not_a_verification_response() {
    let keypair = Keypair::generate();
    let signature = Signer::sign(&keypair, SignContext::Packet, b"nonce");
    assert!(!Signer::verify(&keypair.public_key(), SignContext::Verification, b"nonce", &signature));
}

#[test]
fn test_signature_from_bytes_checks_length() {
    let signature = Signer::sign(&Keypair::generate(), SignContext::Packet, b"x");
    assert_eq!(Signature::from_bytes(signature.as_bytes()).unwrap(), signature);
    assert!(Signature::from_bytes(&[0u8; 10]).is_err());
}

/// Test: relays decrement TTL without breaking the signature
#[test]
fn test_packet_signature_survives_ttl_change() {
    let keypair = Keypair::generate();
    let mut packet = Packet::new(MessageType::Message, PeerId::from_bytes([4; 8]), b"hi".to_vec())
        .with_timestamp(1_000);
    packet.sign(&keypair).unwrap();

    let relayed = packet.relayed().unwrap();
    assert_eq!(relayed.ttl, packet.ttl - 1);
    assert!(relayed.verify(&keypair.public_key()));
}

#[test]
fn test_packet_signature_covers_payload() {
    let keypair = Keypair::generate();
    let mut packet = Packet::new(MessageType::Message, PeerId::from_bytes([4; 8]), b"hi".to_vec())
        .with_timestamp(1_000);
    packet.sign(&keypair).unwrap();
    packet.payload = b"ho".to_vec();

    assert!(!packet.verify(&keypair.public_key()));
}

#[test]
fn test_unsigned_packet_never_verifies() {
    let packet = Packet::new(MessageType::Message, PeerId::from_bytes([4; 8]), Vec::new());
    assert!(!packet.verify(&Keypair::generate().public_key()));
}
