// Keypair Tests
// Signing keys, Noise static keys and the exported identity bundle

use blemesh::identity::{IdentityKeys, Keypair, PublicKey, StaticKeypair};

#[test]
fn test_signing_keypairs_are_unique() {
    let a = Keypair::generate();
    let b = Keypair::generate();
    assert_ne!(a.public_key().as_bytes(), b.public_key().as_bytes());
}

#[test]
fn test_signing_keypair_restores_from_secret() {
    let original = Keypair::generate();
    let restored = Keypair::from_bytes(original.to_bytes().as_slice()).unwrap();
    assert_eq!(original.public_key(), restored.public_key());
}

#[test]
fn test_public_key_rejects_wrong_length() {
    assert!(PublicKey::from_bytes(&[0u8; 31]).is_err());
    assert!(PublicKey::from_bytes(&[0u8; 33]).is_err());
}

#[test]
fn test_static_keypair_restores_same_public() {
    let original = StaticKeypair::generate();
    let restored = StaticKeypair::from_bytes(original.to_bytes().as_slice()).unwrap();
    assert_eq!(original.public_key(), restored.public_key());
}

/// Test: an exported identity keeps its peer id, which is how a restarted
/// node is recognized
#[test]
fn test_identity_bundle_keeps_peer_id() {
    let keys = IdentityKeys::generate();
    let restored = IdentityKeys::from_bytes(keys.to_bytes().as_slice()).unwrap();

    assert_eq!(keys.peer_id(), restored.peer_id());
    assert_eq!(keys.fingerprint(), restored.fingerprint());
    assert_eq!(keys.signing().public_key(), restored.signing().public_key());
}

#[test]
fn test_identity_bundle_rejects_garbage() {
    assert!(IdentityKeys::from_bytes(b"not an identity").is_err());
}
