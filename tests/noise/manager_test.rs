// Session Manager Tests
// Per-peer sessions keyed by real identities, replay protection and recovery

use blemesh::identity::{IdentityKeys, PeerId};
use blemesh::noise::{NoiseError, SessionAction, SessionConfig, SessionManager};

struct Node {
    keys: IdentityKeys,
    sessions: SessionManager,
}

impl Node {
    fn new(config: SessionConfig) -> Self {
        let keys = IdentityKeys::generate();
        let sessions = SessionManager::new(keys.peer_id(), keys.noise().clone(), config);
        Self { keys, sessions }
    }

    fn restart(&self) -> Self {
        let keys = IdentityKeys::from_bytes(&self.keys.to_bytes()).unwrap();
        let sessions = SessionManager::new(keys.peer_id(), keys.noise().clone(), self.sessions.config().clone());
        Self { keys, sessions }
    }

    fn id(&self) -> PeerId {
        self.keys.peer_id()
    }
}

fn handshake_message(actions: &[SessionAction]) -> Vec<u8> {
    actions
        .iter()
        .find_map(|a| match a {
            SessionAction::SendHandshake(m) => Some(m.clone()),
            SessionAction::Established { .. } => None,
        })
        .expect("handshake message")
}

/// Run a full XX exchange and return what each side learned about the other
fn connect(a: &mut Node, b: &mut Node) -> (Vec<SessionAction>, Vec<SessionAction>) {
    let m1 = handshake_message(&a.sessions.initiate_at(b.id(), 0).unwrap());
    let m2 = handshake_message(&b.sessions.handle_handshake_at(a.id(), &m1, 0).unwrap());
    let a_actions = a.sessions.handle_handshake_at(b.id(), &m2, 0).unwrap();
    let m3 = handshake_message(&a_actions);
    let b_actions = b.sessions.handle_handshake_at(a.id(), &m3, 0).unwrap();
    (a_actions, b_actions)
}

#[test]
fn test_established_fingerprint_matches_identity() {
    let mut alice = Node::new(SessionConfig::default());
    let mut bob = Node::new(SessionConfig::default());
    let (a_actions, b_actions) = connect(&mut alice, &mut bob);

    assert!(a_actions.contains(&SessionAction::Established {
        remote_static: bob.keys.noise().public_key(),
        fingerprint: bob.keys.fingerprint(),
    }));
    assert!(b_actions.contains(&SessionAction::Established {
        remote_static: alice.keys.noise().public_key(),
        fingerprint: alice.keys.fingerprint(),
    }));
    assert_eq!(bob.keys.fingerprint().short_id(), bob.id());
    assert_eq!(alice.sessions.established_peers(), vec![bob.id()]);
}

#[test]
fn test_messages_flow_both_ways() {
    let mut alice = Node::new(SessionConfig::default());
    let mut bob = Node::new(SessionConfig::default());
    connect(&mut alice, &mut bob);

    for i in 0..10u8 {
        let ct = alice.sessions.encrypt(&bob.id(), &[i; 20]).unwrap();
        assert_eq!(bob.sessions.decrypt(&alice.id(), &ct).unwrap(), vec![i; 20]);
        let ct = bob.sessions.encrypt(&alice.id(), &[i]).unwrap();
        assert_eq!(alice.sessions.decrypt(&bob.id(), &ct).unwrap(), vec![i]);
    }
}

#[test]
fn test_replayed_ciphertext_rejected() {
    let mut alice = Node::new(SessionConfig::default());
    let mut bob = Node::new(SessionConfig::default());
    connect(&mut alice, &mut bob);

    let ct = alice.sessions.encrypt(&bob.id(), b"once").unwrap();
    assert!(bob.sessions.decrypt(&alice.id(), &ct).is_ok());
    let err = bob.sessions.decrypt(&alice.id(), &ct).unwrap_err();
    assert!(err.is_replay());
    assert_eq!(bob.sessions.stats().replays_rejected, 1);

    // Replays do not count toward invalidation
    assert!(bob.sessions.is_established(&alice.id()));
}

#[test]
fn test_out_of_order_within_window_accepted() {
    let mut alice = Node::new(SessionConfig::default());
    let mut bob = Node::new(SessionConfig::default());
    connect(&mut alice, &mut bob);

    let first = alice.sessions.encrypt(&bob.id(), b"1").unwrap();
    let second = alice.sessions.encrypt(&bob.id(), b"2").unwrap();
    assert_eq!(bob.sessions.decrypt(&alice.id(), &second).unwrap(), b"2");
    assert_eq!(bob.sessions.decrypt(&alice.id(), &first).unwrap(), b"1");
}

#[test]
fn test_failures_force_rehandshake_then_recover() {
    let config = SessionConfig::new().with_max_decrypt_failures(2);
    let mut alice = Node::new(config.clone());
    let mut bob = Node::new(config);
    connect(&mut alice, &mut bob);

    let mut forged = alice.sessions.encrypt(&bob.id(), b"x").unwrap();
    let last = forged.len() - 1;
    forged[last] ^= 0xFF;
    assert!(matches!(
        bob.sessions.decrypt(&alice.id(), &forged),
        Err(NoiseError::Authentication)
    ));
    assert!(matches!(
        bob.sessions.decrypt(&alice.id(), &forged),
        Err(NoiseError::RehandshakeRequired(p)) if p == alice.id()
    ));
    assert!(!bob.sessions.is_established(&alice.id()));

    connect(&mut bob, &mut alice);
    let ct = bob.sessions.encrypt(&alice.id(), b"fresh").unwrap();
    assert_eq!(alice.sessions.decrypt(&bob.id(), &ct).unwrap(), b"fresh");
}

#[test]
fn test_restarted_peer_replaces_session() {
    let mut alice = Node::new(SessionConfig::default());
    let mut bob = Node::new(SessionConfig::default());
    connect(&mut alice, &mut bob);

    let mut alice = alice.restart();
    assert_eq!(alice.sessions.session_count(), 0);
    connect(&mut alice, &mut bob);

    let ct = alice.sessions.encrypt(&bob.id(), b"back").unwrap();
    assert_eq!(bob.sessions.decrypt(&alice.id(), &ct).unwrap(), b"back");
    assert_eq!(bob.sessions.stats().sessions_superseded, 1);
}

#[test]
fn test_no_session_errors() {
    let mut alice = Node::new(SessionConfig::default());
    let stranger = PeerId::from_bytes([7; 8]);
    assert!(matches!(
        alice.sessions.encrypt(&stranger, b"x"),
        Err(NoiseError::NoSession(_))
    ));
    assert!(matches!(
        alice.sessions.decrypt(&stranger, b"x"),
        Err(NoiseError::NoSession(_))
    ));
}

#[test]
fn test_encrypt_before_established_fails() {
    let mut alice = Node::new(SessionConfig::default());
    let bob = Node::new(SessionConfig::default());
    alice.sessions.initiate_at(bob.id(), 0).unwrap();
    assert!(alice.sessions.is_handshaking(&bob.id()));
    assert!(alice.sessions.encrypt(&bob.id(), b"early").is_err());
}

#[test]
fn test_stalled_handshake_pruned() {
    let mut alice = Node::new(SessionConfig::new().with_handshake_timeout_ms(1_000));
    let bob = Node::new(SessionConfig::default());
    alice.sessions.initiate_at(bob.id(), 0).unwrap();
    assert!(alice.sessions.prune_stalled_at(500).is_empty());
    assert_eq!(alice.sessions.prune_stalled_at(1_001), vec![bob.id()]);
    assert!(!alice.sessions.is_handshaking(&bob.id()));
}

#[test]
fn test_any_bit_flip_fails_and_never_yields_plaintext() {
    let config = SessionConfig::new().with_max_decrypt_failures(u32::MAX);
    let mut alice = Node::new(config.clone());
    let mut bob = Node::new(config);
    connect(&mut alice, &mut bob);

    let message = alice.sessions.encrypt(&bob.id(), b"hello").unwrap();
    for byte in 0..message.len() {
        for bit in 0..8 {
            let mut flipped = message.clone();
            flipped[byte] ^= 1 << bit;
            match bob.sessions.decrypt(&alice.id(), &flipped) {
                Err(_) => {}
                Ok(plain) => panic!("flip of byte {byte} bit {bit} decrypted to {plain:?}"),
            }
        }
    }
    assert!(bob.sessions.is_established(&alice.id()));
    assert_eq!(bob.sessions.decrypt(&alice.id(), &message).unwrap(), b"hello");
}

#[test]
fn test_lost_offer_does_not_stall_lower_id() {
    let mut first = Node::new(SessionConfig::default());
    let mut second = Node::new(SessionConfig::default());
    let (low, high) = if first.id() < second.id() {
        (&mut first, &mut second)
    } else {
        (&mut second, &mut first)
    };

    // The lower id's offer is lost in transit
    low.sessions.initiate_at(high.id(), 0).unwrap();
    let offer = handshake_message(&high.sessions.initiate_at(low.id(), 5).unwrap());

    let repeat = handshake_message(&low.sessions.handle_handshake_at(high.id(), &offer, 5).unwrap());
    let m2 = handshake_message(&high.sessions.handle_handshake_at(low.id(), &repeat, 6).unwrap());
    let m3 = handshake_message(&low.sessions.handle_handshake_at(high.id(), &m2, 7).unwrap());
    high.sessions.handle_handshake_at(low.id(), &m3, 8).unwrap();

    assert!(low.sessions.is_established(&high.id()));
    assert!(high.sessions.is_established(&low.id()));
    let ct = low.sessions.encrypt(&high.id(), b"through").unwrap();
    assert_eq!(high.sessions.decrypt(&low.id(), &ct).unwrap(), b"through");
}
