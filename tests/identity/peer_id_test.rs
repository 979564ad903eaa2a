// Peer Id Tests
// Short ids, fingerprints and the either-form PeerRef

use blemesh::identity::{Fingerprint, IdentityKeys, PeerId, PeerRef};

#[test]
fn test_short_id_is_fingerprint_prefix() {
    let keys = IdentityKeys::generate();
    let fingerprint = keys.fingerprint();
    assert_eq!(keys.peer_id().as_bytes()[..], fingerprint.as_bytes()[..8]);
    assert_eq!(PeerId::from_fingerprint(&fingerprint), fingerprint.short_id());
}

#[test]
fn test_fingerprint_is_hash_of_static_key() {
    let keys = IdentityKeys::generate();
    let fingerprint = Fingerprint::from_static_key(&keys.noise().public_key());
    assert_eq!(fingerprint, keys.fingerprint());
}

#[test]
fn test_peer_id_hex_round_trip() {
    let id = PeerId::from_bytes([0xAB, 1, 2, 3, 4, 5, 6, 7]);
    let text = id.to_string();
    assert_eq!(text.len(), 16);
    assert_eq!(text.parse::<PeerId>().unwrap(), id);
    assert!("xyz".parse::<PeerId>().is_err());
}

#[test]
fn test_broadcast_id() {
    assert!(PeerId::BROADCAST.is_broadcast());
    assert!(!PeerId::from_bytes([1; 8]).is_broadcast());
}

#[test]
fn test_peer_ref_parses_by_length() {
    let keys = IdentityKeys::generate();
    let short: PeerRef = keys.peer_id().to_string().parse().unwrap();
    let stable: PeerRef = keys.fingerprint().to_string().parse().unwrap();

    assert_eq!(short, PeerRef::Short(keys.peer_id()));
    assert_eq!(stable, PeerRef::Stable(keys.fingerprint()));
    assert!("abcd".parse::<PeerRef>().is_err());
}
