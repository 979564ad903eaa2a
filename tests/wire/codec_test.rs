// Codec Tests
// Binary frame layout, flags and rejection of bad frames

use blemesh::identity::{Keypair, PeerId};
use blemesh::wire::{
    MessageType, Packet, PacketCodec, WireError, BASE_HEADER_LEN, FLAG_COMPRESSED,
    FLAG_HAS_RECIPIENT, FLAG_HAS_SIGNATURE, PROTOCOL_VERSION,
};

fn sample(payload: &[u8]) -> Packet {
    Packet::new(MessageType::Message, PeerId::from_bytes([9; 8]), payload.to_vec())
        .with_timestamp(1_700_000_000_123)
}

// ============================================================================
// LAYOUT
// ============================================================================

#[test]
fn test_minimal_frame_layout() {
    let bytes = PacketCodec::new().encode(&sample(b"hi")).unwrap();

    assert_eq!(bytes.len(), BASE_HEADER_LEN + 2);
    assert_eq!(bytes[0], MessageType::Message.as_u8());
    assert_eq!(bytes[1], 0, "no optional sections");
    assert_eq!(&bytes[2..10], &[9; 8]);
    assert_eq!(&bytes[10..18], &1_700_000_000_123u64.to_be_bytes());
    assert_eq!(&bytes[18..20], &2u16.to_be_bytes());
    assert_eq!(bytes[20], PROTOCOL_VERSION);
    assert_eq!(&bytes[22..], b"hi");
}

#[test]
fn test_optional_sections_set_flags() {
    let mut packet = sample(b"hi").with_recipient(PeerId::from_bytes([2; 8]));
    packet.sign(&Keypair::generate()).unwrap();
    let bytes = PacketCodec::new().encode(&packet).unwrap();

    assert_eq!(bytes[1], FLAG_HAS_RECIPIENT | FLAG_HAS_SIGNATURE);
    assert_eq!(PacketCodec::new().decode(&bytes).unwrap(), packet);
}

#[test]
fn test_large_repetitive_payload_is_compressed() {
    let text = "the mesh carries this line again and again. ".repeat(20);
    let packet = sample(text.as_bytes());
    let bytes = PacketCodec::new().encode(&packet).unwrap();

    assert_ne!(bytes[1] & FLAG_COMPRESSED, 0);
    assert!(bytes.len() < text.len());
    assert_eq!(PacketCodec::new().decode(&bytes).unwrap().payload, text.as_bytes());
}

#[test]
fn test_short_payload_left_alone() {
    let bytes = PacketCodec::new().encode(&sample(&[b'a'; 40])).unwrap();
    assert_eq!(bytes[1] & FLAG_COMPRESSED, 0);
}

// ============================================================================
// REJECTION
// ============================================================================

#[test]
fn test_unknown_type_rejected() {
    let mut bytes = PacketCodec::new().encode(&sample(b"x")).unwrap();
    bytes[0] = 0x7E;
    assert!(matches!(PacketCodec::new().decode(&bytes), Err(WireError::UnknownType(0x7E))));
}

#[test]
fn test_reserved_flag_rejected() {
    let mut bytes = PacketCodec::new().encode(&sample(b"x")).unwrap();
    bytes[1] |= 0x80;
    assert!(matches!(PacketCodec::new().decode(&bytes), Err(WireError::ReservedFlags(_))));
}

#[test]
fn test_unsupported_version_rejected() {
    let mut bytes = PacketCodec::new().encode(&sample(b"x")).unwrap();
    bytes[20] = PROTOCOL_VERSION + 1;
    assert!(matches!(PacketCodec::new().decode(&bytes), Err(WireError::UnsupportedVersion(_))));
}

#[test]
fn test_truncated_and_trailing_rejected() {
    let bytes = PacketCodec::new().encode(&sample(b"hello")).unwrap();
    assert!(matches!(
        PacketCodec::new().decode(&bytes[..bytes.len() - 1]),
        Err(WireError::Truncated { .. })
    ));

    let mut longer = bytes.clone();
    longer.push(0);
    assert!(matches!(PacketCodec::new().decode(&longer), Err(WireError::TrailingBytes(1))));
}

#[test]
fn test_oversized_payload_rejected() {
    let packet = sample(&vec![0u8; u16::MAX as usize + 1]);
    assert!(matches!(
        PacketCodec::new().encode(&packet),
        Err(WireError::PayloadTooLarge { .. })
    ));
}

#[test]
fn test_frame_len_needs_header() {
    let bytes = PacketCodec::new().encode(&sample(b"abc")).unwrap();
    assert_eq!(PacketCodec::frame_len(&bytes[..5]).unwrap(), None);
    assert_eq!(PacketCodec::frame_len(&bytes).unwrap(), Some(bytes.len()));
}
