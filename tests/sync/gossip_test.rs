// Gossip Sync Tests
// Two managers reconciling their caches through RequestSync

use blemesh::identity::PeerId;
use blemesh::sync::{GossipAction, GossipConfig, GossipSyncManager, Observation, SyncKind, SyncTypeFlags};
use blemesh::wire::{MessageType, Packet};

fn peer(n: u8) -> PeerId {
    PeerId::from_bytes([n; 8])
}

fn public(sender: u8, text: &str, ts: u64) -> Packet {
    Packet::new(MessageType::Message, peer(sender), text.as_bytes().to_vec()).with_timestamp(ts)
}

fn manager(n: u8) -> GossipSyncManager {
    GossipSyncManager::new(peer(n), GossipConfig::default())
}

/// A manager that has heard announcements from `peers`
fn manager_knowing(n: u8, peers: &[u8], now_ms: u64) -> GossipSyncManager {
    let mut m = manager(n);
    for p in peers {
        m.on_announcement_at(peer(*p), now_ms);
    }
    m
}

#[test]
fn test_request_fills_only_the_gap() {
    let mut alice = manager_knowing(1, &[9], 1_000);
    let mut bob = manager_knowing(2, &[9], 1_000);

    let shared = public(9, "both have this", 1_000);
    let missing = public(9, "only alice has this", 1_001);
    alice.on_packet_at(&shared, 2_000);
    alice.on_packet_at(&missing, 2_000);
    bob.on_packet_at(&shared, 2_000);

    let request = bob.build_request(SyncTypeFlags::all());
    let served = alice.handle_request_sync(&peer(2), &request);
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].id(), missing.id());

    // After ingesting the reply both caches agree
    for packet in &served {
        assert_eq!(bob.on_packet_at(packet, 2_100), Observation::New(SyncKind::Messages));
    }
    let request = bob.build_request(SyncTypeFlags::all());
    assert!(alice.handle_request_sync(&peer(2), &request).is_empty());
}

#[test]
fn test_requester_own_packets_not_echoed() {
    let mut alice = manager_knowing(1, &[2], 1_000);
    alice.on_packet_at(&public(2, "from bob", 1_000), 1_000);
    let request = manager(2).build_request(SyncTypeFlags::all());
    assert!(alice.handle_request_sync(&peer(2), &request).is_empty());
}

#[test]
fn test_only_requested_types_served() {
    let mut alice = manager_knowing(1, &[9], 1_000);
    alice.on_packet_at(&public(9, "msg", 1_000), 1_000);
    let file = Packet::new(MessageType::FileTransfer, peer(9), vec![0xAB; 16]).with_timestamp(1_000);
    alice.on_packet_at(&file, 1_000);

    let request = manager(2).build_request(SyncTypeFlags::FILE_TRANSFERS);
    let served = alice.handle_request_sync(&peer(2), &request);
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].message_type, MessageType::FileTransfer);
}

#[test]
fn test_directed_and_stale_packets_not_cached() {
    let mut alice = manager_knowing(1, &[9], 0);
    let directed = public(9, "private", 1_000).with_recipient(peer(3));
    assert_eq!(alice.on_packet_at(&directed, 1_000), Observation::Ignored);

    let max_age = alice.config().max_message_age_ms;
    let old = public(9, "ancient", 0);
    assert_eq!(alice.on_packet_at(&old, max_age + 1), Observation::TooOld);
    assert_eq!(alice.cached_count(SyncKind::Messages), 0);
}

#[test]
fn test_leave_purges_sender_content() {
    let mut alice = manager(1);
    alice.on_packet_at(&Packet::new(MessageType::Announce, peer(9), vec![]), 1_000);
    alice.on_packet_at(&public(9, "bye soon", 1_000), 1_000);
    assert_eq!(alice.cached_count(SyncKind::Messages), 1);

    alice.on_packet_at(&Packet::new(MessageType::Leave, peer(9), vec![]), 1_100);
    assert_eq!(alice.cached_count(SyncKind::Messages), 0);
    assert_eq!(alice.last_announcement(&peer(9)), None);
}

#[test]
fn test_initial_sync_after_delay() {
    let config = GossipConfig::new().with_initial_sync_delay_ms(500);
    let mut alice = GossipSyncManager::new(peer(1), config);
    alice.schedule_initial_sync_at(peer(2), 0);
    assert_eq!(alice.pending_initial_syncs(), 1);

    let early = alice.maintenance_at(100);
    assert!(!early
        .iter()
        .any(|a| matches!(a, GossipAction::SendRequest { to: Some(_), .. })));

    let due = alice.maintenance_at(600);
    assert!(due.iter().any(|a| matches!(
        a,
        GossipAction::SendRequest { to: Some(p), request } if *p == peer(2) && request.types == SyncTypeFlags::all()
    )));
    assert_eq!(alice.pending_initial_syncs(), 0);
}

#[test]
fn test_new_content_triggers_typed_request() {
    let mut alice = manager_knowing(1, &[9], 0);
    alice.maintenance_at(0);
    alice.on_packet_at(&public(9, "fresh", 1_000), 1_000);

    let interval = alice.config().message_sync_interval_ms;
    let actions = alice.maintenance_at(1_000 + interval);
    assert!(actions.iter().any(|a| matches!(
        a,
        GossipAction::SendRequest { to: None, request } if request.types == SyncTypeFlags::MESSAGES
    )));

    // Nothing new since then
    let again = alice.maintenance_at(1_000 + 3 * interval);
    assert!(!again.iter().any(|a| matches!(a, GossipAction::SendRequest { .. })));
}

#[test]
fn test_silent_peer_expires() {
    let config = GossipConfig::new().with_stale_peer_timeout_ms(1_000);
    let mut alice = GossipSyncManager::new(peer(1), config);
    alice.on_announcement_at(peer(2), 0);
    alice.on_packet_at(&public(2, "hello", 0), 0);

    let actions = alice.maintenance_at(2_000);
    assert!(actions.contains(&GossipAction::PeerExpired(peer(2))));
    assert_eq!(alice.announcement_count(), 0);
    assert_eq!(alice.cached_count(SyncKind::Messages), 0);
}

#[test]
fn test_content_needs_a_live_announcement() {
    let mut alice = manager(1);
    assert_eq!(
        alice.on_packet_at(&public(9, "drive-by", 1_000), 1_000),
        Observation::Unannounced
    );
    assert_eq!(alice.cached_count(SyncKind::Messages), 0);
    assert_eq!(alice.stats().unannounced, 1);

    alice.on_announcement_at(peer(9), 1_000);
    alice.on_packet_at(&public(9, "announced", 1_000), 1_000);
    alice.on_packet_at(&Packet::new(MessageType::Leave, peer(9), vec![]), 1_100);

    // Once gone, the peer's late content is not admitted either
    assert_eq!(
        alice.on_packet_at(&public(9, "after leave", 1_050), 1_200),
        Observation::Unannounced
    );
    assert_eq!(alice.cached_count(SyncKind::Messages), 0);
}
