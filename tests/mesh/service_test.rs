// Mesh Service Tests
// Several services on one memory network: relaying, routing, sessions
// and a node coming back with the same identity

use blemesh::identity::{IdentityKeys, PeerId};
use blemesh::mesh::{MeshConfig, MeshEvent, MeshHandle, MeshNode, MeshResult, MeshService, Route};
use blemesh::transport::MemoryNetwork;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

fn start(net: &MemoryNetwork, name: &str, keys: IdentityKeys) -> (MeshHandle, JoinHandle<MeshResult<()>>) {
    let node = MeshNode::new(keys, MeshConfig::new(name)).unwrap();
    MeshService::spawn_with_tick(node, net.endpoint(name).unwrap(), Duration::from_millis(50))
}

async fn wait_for(
    rx: &mut broadcast::Receiver<MeshEvent>,
    pred: impl Fn(&MeshEvent) -> bool,
) -> MeshEvent {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_route(handle: &MeshHandle, to: PeerId, expected: Route) {
    timeout(WAIT, async {
        while handle.route(to).await.unwrap() != expected {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("route never converged");
}

fn announced(peer: PeerId) -> impl Fn(&MeshEvent) -> bool {
    move |e| matches!(e, MeshEvent::PeerAnnounced { peer: p, .. } if *p == peer)
}

/// a - b - c
struct Line {
    net: MemoryNetwork,
    a: MeshHandle,
    b: MeshHandle,
    c: MeshHandle,
    ev_a: broadcast::Receiver<MeshEvent>,
    ev_c: broadcast::Receiver<MeshEvent>,
}

async fn line() -> Line {
    let net = MemoryNetwork::new();
    let (a, _) = start(&net, "a", IdentityKeys::generate());
    let (b, _) = start(&net, "b", IdentityKeys::generate());
    let (c, _) = start(&net, "c", IdentityKeys::generate());
    let mut ev_a = a.subscribe();
    let mut ev_c = c.subscribe();

    net.link("a", "b").unwrap();
    net.link("b", "c").unwrap();
    wait_for(&mut ev_a, announced(c.peer_id())).await;
    wait_for(&mut ev_c, announced(a.peer_id())).await;
    Line { net, a, b, c, ev_a, ev_c }
}

#[tokio::test]
async fn test_public_message_crosses_relay() {
    let mut l = line().await;
    l.a.send_public("hello mesh").await.unwrap();

    let got = wait_for(&mut l.ev_c, |e| matches!(e, MeshEvent::PublicMessage { .. })).await;
    let MeshEvent::PublicMessage { sender, nickname, text, .. } = got else {
        unreachable!();
    };
    assert_eq!(sender, l.a.peer_id());
    assert_eq!(nickname.as_deref(), Some("a"));
    assert_eq!(text, "hello mesh");

    let stats = l.b.stats().await.unwrap();
    assert!(stats.node.relayed >= 1);
}

#[tokio::test]
async fn test_topology_converges_to_relay_route() {
    let l = line().await;
    wait_for_route(&l.a, l.c.peer_id(), Route::Via(vec![l.b.peer_id()])).await;
    wait_for_route(&l.c, l.a.peer_id(), Route::Via(vec![l.b.peer_id()])).await;
    assert_eq!(l.a.route(l.b.peer_id()).await.unwrap(), Route::Direct);
}

#[tokio::test]
async fn test_private_message_over_two_hops() {
    let mut l = line().await;
    let id = l.a.send_private(l.c.fingerprint(), "just for c").await.unwrap();

    let got = wait_for(&mut l.ev_c, |e| matches!(e, MeshEvent::PrivateMessage { .. })).await;
    assert_eq!(
        got,
        MeshEvent::PrivateMessage {
            sender: l.a.peer_id(),
            id,
            text: "just for c".to_string(),
        }
    );
    wait_for(&mut l.ev_a, |e| matches!(e, MeshEvent::DeliveryAck { id: acked, .. } if *acked == id)).await;

    // The relay never saw the plaintext, only forwarded it
    let relay = l.b.stats().await.unwrap();
    assert_eq!(relay.node.delivered, 0);

    l.c.send_read_receipt(l.a.peer_id(), id).await.unwrap();
    wait_for(&mut l.ev_a, |e| matches!(e, MeshEvent::ReadReceipt { id: read, .. } if *read == id)).await;
}

#[tokio::test]
async fn test_verification_round_trip() {
    let mut l = line().await;
    let c_id = l.c.peer_id();
    l.a.verify_peer(c_id).await.unwrap();
    let got = wait_for(&mut l.ev_a, |e| matches!(e, MeshEvent::PeerVerified { .. })).await;
    assert_eq!(got, MeshEvent::PeerVerified { peer: c_id, verified: true });

    let peers = l.a.peers().await.unwrap();
    let c = peers.iter().find(|p| p.peer_id == c_id).unwrap();
    assert!(c.verified);
    assert!(c.session_established);
    assert_eq!(c.fingerprint, l.c.fingerprint());
}

#[tokio::test]
async fn test_severed_link_reported() {
    let mut l = line().await;
    let b_id = l.b.peer_id();
    assert_eq!(l.net.unlink("b", "c"), 1);
    wait_for(&mut l.ev_c, |e| matches!(e, MeshEvent::PeerDisconnected { peer } if *peer == b_id)).await;
    wait_for_route(&l.c, b_id, Route::Unreachable).await;
}

#[tokio::test]
async fn test_restart_with_same_identity_resumes_messaging() {
    let net = MemoryNetwork::new();
    let alice_keys = IdentityKeys::generate();
    let saved = alice_keys.to_bytes();
    let (alice, alice_task) = start(&net, "alice", alice_keys);
    let (bob, _) = start(&net, "bob", IdentityKeys::generate());
    let mut ev_alice = alice.subscribe();
    let mut ev_bob = bob.subscribe();

    net.link("alice", "bob").unwrap();
    wait_for(&mut ev_alice, announced(bob.peer_id())).await;
    let id = alice.send_private(bob.peer_id(), "before").await.unwrap();
    wait_for(&mut ev_alice, |e| matches!(e, MeshEvent::DeliveryAck { id: acked, .. } if *acked == id)).await;

    alice.shutdown().await.unwrap();
    assert!(alice_task.await.unwrap().is_ok());
    let alice_id = alice.peer_id();
    wait_for(&mut ev_bob, |e| matches!(e, MeshEvent::PeerLost { peer } if *peer == alice_id)).await;

    // Same keys, fresh process state
    let (alice, _) = start(&net, "alice", IdentityKeys::from_bytes(&saved).unwrap());
    assert_eq!(alice.peer_id(), alice_id);
    let mut ev_alice = alice.subscribe();
    net.link("alice", "bob").unwrap();
    wait_for(&mut ev_bob, announced(alice_id)).await;
    wait_for(&mut ev_alice, announced(bob.peer_id())).await;

    let id = alice.send_private(bob.peer_id(), "after").await.unwrap();
    let got = wait_for(&mut ev_bob, |e| matches!(e, MeshEvent::PrivateMessage { .. })).await;
    assert_eq!(
        got,
        MeshEvent::PrivateMessage {
            sender: alice_id,
            id,
            text: "after".to_string(),
        }
    );
    wait_for(&mut ev_alice, |e| matches!(e, MeshEvent::DeliveryAck { id: acked, .. } if *acked == id)).await;

    // And the other direction works on the replacement session
    let back = bob.send_private(alice_id, "welcome back").await.unwrap();
    wait_for(&mut ev_alice, |e| matches!(e, MeshEvent::PrivateMessage { id, .. } if *id == back)).await;
}
