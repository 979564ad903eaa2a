// RequestSync Protocol Tests
// Payload encoding, version checks and type selection

use blemesh::sync::{RequestSync, SyncError, SyncKind, SyncTypeFlags, SYNC_PROTOCOL_VERSION};
use blemesh::wire::{MessageType, PacketId};

#[test]
fn test_request_carries_known_prefixes() {
    let ids = [PacketId::from_bytes([1; 16]), PacketId::from_bytes([2; 16])];
    let request = RequestSync::new(42, SyncTypeFlags::all()).with_known(ids);

    let decoded = RequestSync::decode(&request.encode().unwrap()).unwrap();
    assert_eq!(decoded.version, SYNC_PROTOCOL_VERSION);
    assert_eq!(decoded.marker, 42);
    assert_eq!(decoded.known, vec![[1; 8], [2; 8]]);
    assert!(decoded.known_set().contains(&ids[1].prefix()));
}

#[test]
fn test_empty_request_decodes() {
    let request = RequestSync::new(1, SyncTypeFlags::MESSAGES);
    let decoded = RequestSync::decode(&request.encode().unwrap()).unwrap();
    assert!(decoded.known.is_empty());
    assert!(decoded.types.contains(SyncKind::Messages));
    assert!(!decoded.types.contains(SyncKind::Fragments));
}

#[test]
fn test_future_version_rejected() {
    let mut request = RequestSync::new(1, SyncTypeFlags::all());
    request.version = SYNC_PROTOCOL_VERSION + 1;
    let bytes = request.encode().unwrap();
    assert_eq!(
        RequestSync::decode(&bytes),
        Err(SyncError::UnsupportedVersion(SYNC_PROTOCOL_VERSION + 1))
    );
}

#[test]
fn test_truncated_payload_rejected() {
    let bytes = RequestSync::new(7, SyncTypeFlags::all()).encode().unwrap();
    assert!(RequestSync::decode(&bytes[..bytes.len() - 1]).is_err());
    assert!(RequestSync::decode(&[]).is_err());
}

#[test]
fn test_kind_mapping() {
    assert_eq!(SyncKind::for_message_type(MessageType::Message), Some(SyncKind::Messages));
    assert_eq!(SyncKind::for_message_type(MessageType::Fragment), Some(SyncKind::Fragments));
    assert_eq!(
        SyncKind::for_message_type(MessageType::FileTransfer),
        Some(SyncKind::FileTransfers)
    );
    assert_eq!(SyncKind::for_message_type(MessageType::Announce), None);
    assert_eq!(SyncKind::for_message_type(MessageType::NoiseEncrypted), None);

    let kinds: Vec<SyncKind> = SyncTypeFlags::all().kinds().collect();
    assert_eq!(kinds, SyncKind::ALL.to_vec());
}
