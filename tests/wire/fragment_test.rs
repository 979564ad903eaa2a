// Fragment Tests
// MTU splitting and bounded reassembly

use blemesh::identity::PeerId;
use blemesh::wire::{
    fragment_packet, FragmentReassembler, MessageType, Packet, PacketCodec, MAX_FRAME_LEN,
    MIN_MTU,
};

fn big_packet(len: usize) -> Packet {
    // Incompressible so the frame really is large
    let payload: Vec<u8> = (0..len).map(|i| (i * 7919 % 251) as u8 ^ (i >> 3) as u8).collect();
    Packet::new(MessageType::FileTransfer, PeerId::from_bytes([5; 8]), payload).with_timestamp(77)
}

#[test]
fn test_small_packet_not_fragmented() {
    let packet = big_packet(20);
    let pieces = fragment_packet(&PacketCodec::new(), &packet, 512).unwrap();
    assert_eq!(pieces, vec![packet]);
}

#[test]
fn test_fragments_fit_mtu_and_reassemble_in_any_order() {
    let codec = PacketCodec::new();
    let packet = big_packet(2_000);
    let mut pieces = fragment_packet(&codec, &packet, 128).unwrap();
    assert!(pieces.len() > 1);
    for piece in &pieces {
        assert_eq!(piece.message_type, MessageType::Fragment);
        assert!(codec.encode(piece).unwrap().len() <= 128);
    }

    pieces.reverse();
    let mut reassembler = FragmentReassembler::new(codec, 8, 30_000);
    let mut result = None;
    for piece in &pieces {
        if let Some(done) = reassembler.accept_at(piece, 10).unwrap() {
            result = Some(done);
        }
    }
    assert_eq!(result, Some(packet));
    assert_eq!(reassembler.pending_sets(), 0);
}

#[test]
fn test_duplicate_fragment_ignored() {
    let codec = PacketCodec::new();
    let pieces = fragment_packet(&codec, &big_packet(600), 128).unwrap();
    let mut reassembler = FragmentReassembler::new(codec, 8, 30_000);

    assert!(reassembler.accept_at(&pieces[0], 0).unwrap().is_none());
    assert!(reassembler.accept_at(&pieces[0], 0).unwrap().is_none());
    assert_eq!(reassembler.pending_sets(), 1);
}

#[test]
fn test_incomplete_sets_expire() {
    let codec = PacketCodec::new();
    let pieces = fragment_packet(&codec, &big_packet(600), 128).unwrap();
    let mut reassembler = FragmentReassembler::new(codec, 8, 1_000);

    reassembler.accept_at(&pieces[0], 0).unwrap();
    assert_eq!(reassembler.prune_at(500), 0);
    assert_eq!(reassembler.prune_at(1_001), 1);
    assert_eq!(reassembler.stats().expired, 1);
}

#[test]
fn test_set_count_is_bounded() {
    let codec = PacketCodec::new();
    let mut reassembler = FragmentReassembler::new(codec.clone(), 2, 30_000);
    for now in 0..3 {
        let pieces = fragment_packet(&codec, &big_packet(600), 128).unwrap();
        reassembler.accept_at(&pieces[0], now).unwrap();
    }
    assert_eq!(reassembler.pending_sets(), 2);
    assert_eq!(reassembler.stats().evicted, 1);
}

#[test]
fn test_mtu_below_minimum_rejected() {
    let result = fragment_packet(&PacketCodec::new(), &big_packet(600), MIN_MTU - 1);
    assert!(result.is_err());
}

fn forged_piece(index: u16, total: u16, data_len: usize) -> Packet {
    let mut payload = vec![0xEE; 8];
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&total.to_be_bytes());
    payload.push(MessageType::FileTransfer.as_u8());
    payload.extend(std::iter::repeat(0x11).take(data_len));
    Packet::new(MessageType::Fragment, PeerId::from_bytes([5; 8]), payload)
}

#[test]
fn test_oversized_sets_rejected_without_buffering() {
    let codec = PacketCodec::new();
    let mut reassembler = FragmentReassembler::new(codec.clone(), 8, 30_000);

    // Declares far more than any frame can hold
    assert!(reassembler.accept_at(&forged_piece(0, u16::MAX, 100), 0).is_err());
    assert_eq!(reassembler.pending_sets(), 0);

    // Small declared size, but the pieces add up past the frame limit
    assert!(reassembler.accept_at(&forged_piece(1, 2, MAX_FRAME_LEN), 0).unwrap().is_none());
    assert!(reassembler.accept_at(&forged_piece(0, 2, 64), 0).is_err());
    assert_eq!(reassembler.pending_sets(), 0);
    assert_eq!(reassembler.stats().rejected, 2);

    // Honest traffic from the same sender is unaffected
    let packet = big_packet(2_000);
    let mut result = None;
    for piece in fragment_packet(&codec, &packet, 128).unwrap() {
        if let Some(done) = reassembler.accept_at(&piece, 5).unwrap() {
            result = Some(done);
        }
    }
    assert_eq!(result, Some(packet));
}
