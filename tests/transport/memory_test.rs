// Memory Transport Tests
// Named endpoints on a shared in-process network

use blemesh::transport::{MemoryNetwork, PeerAddress, Transport, TransportError, TransportEvent};

#[tokio::test]
async fn test_connect_by_address() {
    let net = MemoryNetwork::new();
    let mut a = net.endpoint("a").unwrap();
    let mut b = net.endpoint("b").unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let link = a.connect(PeerAddress::memory("b")).await.unwrap();
    assert!(matches!(
        a.next_event().await,
        Some(TransportEvent::Connected { link: l, address }) if l == link && address == PeerAddress::memory("b")
    ));
    let Some(TransportEvent::Connected { link: remote, .. }) = b.next_event().await else {
        panic!("b should see the link");
    };

    a.send(&link, b"ping").await.unwrap();
    assert_eq!(
        b.next_event().await,
        Some(TransportEvent::Received { link: remote, data: b"ping".to_vec() })
    );
    assert_eq!(a.links(), vec![link]);
    assert_eq!(a.link_info(&link).map(|i| i.bytes_sent()), Some(4));
}

#[tokio::test]
async fn test_wrong_address_kind_and_unknown_endpoint() {
    let net = MemoryNetwork::new();
    let mut a = net.endpoint("a").unwrap();
    a.start().await.unwrap();
    assert!(matches!(
        a.connect(PeerAddress::tcp("127.0.0.1", 1)).await,
        Err(TransportError::InvalidAddress(_))
    ));
    assert!(matches!(
        a.connect(PeerAddress::memory("nobody")).await,
        Err(TransportError::InvalidAddress(_))
    ));
}

#[tokio::test]
async fn test_duplicate_endpoint_name_rejected_until_stopped() {
    let net = MemoryNetwork::new();
    let mut a = net.endpoint("a").unwrap();
    assert!(net.endpoint("a").is_err());
    a.start().await.unwrap();
    a.stop().await.unwrap();
    assert!(net.endpoint("a").is_ok());
}

#[tokio::test]
async fn test_stop_tells_the_other_side() {
    let net = MemoryNetwork::new();
    let mut a = net.endpoint("a").unwrap();
    let mut b = net.endpoint("b").unwrap();
    a.start().await.unwrap();
    net.link("a", "b").unwrap();
    b.next_event().await;

    a.stop().await.unwrap();
    assert!(matches!(b.next_event().await, Some(TransportEvent::Disconnected { .. })));
    assert!(b.links().is_empty());
    assert_eq!(net.link_count(), 0);
}

#[tokio::test]
async fn test_send_requires_running() {
    let net = MemoryNetwork::new();
    let mut a = net.endpoint("a").unwrap();
    let _b = net.endpoint("b").unwrap();
    let (la, _) = net.link("a", "b").unwrap();
    assert_eq!(a.send(&la, b"x").await, Err(TransportError::NotRunning));
}

#[tokio::test]
async fn test_relink_after_unlink_gets_fresh_ids() {
    let net = MemoryNetwork::new();
    let _a = net.endpoint("a").unwrap();
    let _b = net.endpoint("b").unwrap();
    let (first, _) = net.link("a", "b").unwrap();
    assert_eq!(net.unlink("a", "b"), 1);
    let (second, _) = net.link("a", "b").unwrap();
    assert_ne!(first, second);
}
