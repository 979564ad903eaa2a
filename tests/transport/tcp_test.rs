// TCP Transport Tests
// Loopback links between two transports

use blemesh::transport::{
    LinkId, TcpTransport, TcpTransportConfig, Transport, TransportConfig, TransportError,
    TransportEvent, TransportState, PeerAddress,
};
use std::time::Duration;
use tokio::time::timeout;

fn loopback() -> TcpTransport {
    TcpTransport::new(
        TcpTransportConfig::new()
            .with_bind_address("127.0.0.1")
            .with_bind_port(0),
    )
}

async fn next(transport: &mut TcpTransport) -> TransportEvent {
    timeout(Duration::from_secs(5), transport.next_event())
        .await
        .expect("event in time")
        .expect("transport running")
}

/// Start two transports and link `a` to `b`; returns both ends' link ids
async fn linked() -> (TcpTransport, TcpTransport, LinkId, LinkId) {
    let mut a = loopback();
    let mut b = loopback();
    a.start().await.unwrap();
    b.start().await.unwrap();
    assert!(matches!(next(&mut a).await, TransportEvent::Listening { .. }));
    assert!(matches!(next(&mut b).await, TransportEvent::Listening { .. }));

    let address = b.local_address().unwrap();
    let la = a.connect(address).await.unwrap();
    assert!(matches!(next(&mut a).await, TransportEvent::Connected { link, .. } if link == la));
    let TransportEvent::Connected { link: lb, .. } = next(&mut b).await else {
        panic!("b should accept the link");
    };
    (a, b, la, lb)
}

// ============================================================================
// CONFIG AND LIFECYCLE
// ============================================================================

#[test]
fn test_config_builder() {
    let config = TcpTransportConfig::new()
        .with_bind_address("127.0.0.1")
        .with_bind_port(9000)
        .with_nodelay(false)
        .with_link_config(TransportConfig::new().with_max_links(2));
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.bind_port, 9000);
    assert!(!config.nodelay);
    assert_eq!(config.link.max_links, 2);
}

#[tokio::test]
async fn test_start_and_stop() {
    let mut t = loopback();
    assert_eq!(t.state(), &TransportState::Stopped);
    t.start().await.unwrap();
    assert!(t.state().is_running());
    assert!(matches!(t.local_address(), Some(PeerAddress::Tcp { port, .. }) if port != 0));
    assert_eq!(t.start().await, Err(TransportError::AlreadyRunning));

    t.stop().await.unwrap();
    assert_eq!(t.state(), &TransportState::Stopped);
    assert!(t.local_address().is_none());
    assert!(t.next_event().await.is_none());
}

#[tokio::test]
async fn test_connect_requires_running_and_tcp_address() {
    let mut t = loopback();
    assert_eq!(
        t.connect(PeerAddress::tcp("127.0.0.1", 1)).await,
        Err(TransportError::NotRunning)
    );
    t.start().await.unwrap();
    assert!(matches!(
        t.connect(PeerAddress::memory("x")).await,
        Err(TransportError::InvalidAddress(_))
    ));
}

// ============================================================================
// DATA
// ============================================================================

#[tokio::test]
async fn test_bytes_flow_both_ways() {
    let (mut a, mut b, la, lb) = linked().await;

    a.send(&la, b"hello over tcp").await.unwrap();
    let mut got = Vec::new();
    while got.len() < 14 {
        match next(&mut b).await {
            TransportEvent::Received { link, data } => {
                assert_eq!(link, lb);
                got.extend(data);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(got, b"hello over tcp");

    b.send(&lb, b"ack").await.unwrap();
    let mut back = Vec::new();
    while back.len() < 3 {
        if let TransportEvent::Received { data, .. } = next(&mut a).await {
            back.extend(data);
        }
    }
    assert_eq!(back, b"ack");
    assert_eq!(a.stats().bytes_sent, 14);
    assert_eq!(a.stats().bytes_received, 3);
}

#[tokio::test]
async fn test_disconnect_reaches_remote() {
    let (mut a, mut b, la, lb) = linked().await;

    a.disconnect(&la).await.unwrap();
    assert!(matches!(next(&mut a).await, TransportEvent::Disconnected { link, .. } if link == la));
    assert!(matches!(next(&mut b).await, TransportEvent::Disconnected { link, .. } if link == lb));
    assert!(a.links().is_empty());
    assert!(b.links().is_empty());
    assert_eq!(a.send(&la, b"late").await, Err(TransportError::UnknownLink(la)));
}

#[tokio::test]
async fn test_link_limit_enforced() {
    let mut a = TcpTransport::new(
        TcpTransportConfig::new()
            .with_bind_address("127.0.0.1")
            .with_link_config(TransportConfig::new().with_max_links(1)),
    );
    let mut b = loopback();
    a.start().await.unwrap();
    b.start().await.unwrap();
    let address = b.local_address().unwrap();
    a.connect(address.clone()).await.unwrap();
    assert_eq!(a.connect(address).await, Err(TransportError::LinkLimit(1)));
}
