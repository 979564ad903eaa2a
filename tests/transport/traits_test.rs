// Transport Trait Tests
// Core types shared by every transport, plus the trait's default broadcast

use blemesh::transport::{
    LinkId, LinkInfo, MemoryNetwork, PeerAddress, Transport, TransportConfig, TransportError,
    TransportEvent, TransportState,
};

// ============================================================================
// CONFIG AND ADDRESSES
// ============================================================================

#[test]
fn test_config_builder() {
    let config = TransportConfig::new()
        .with_max_links(4)
        .with_connect_timeout(3)
        .with_read_chunk(512);
    assert_eq!(config.max_links, 4);
    assert_eq!(config.connect_timeout_secs, 3);
    assert_eq!(config.read_chunk, 512);
    assert!(config.validate().is_ok());
    assert!(matches!(
        TransportConfig::new().with_read_chunk(0).validate(),
        Err(TransportError::InvalidConfig(_))
    ));
}

#[test]
fn test_addresses_parse_from_cli_text() {
    assert_eq!(
        "10.0.0.1:7000".parse::<PeerAddress>().unwrap(),
        PeerAddress::tcp("10.0.0.1", 7000)
    );
    assert_eq!(
        "tcp://relay.local:7000".parse::<PeerAddress>().unwrap(),
        PeerAddress::tcp("relay.local", 7000)
    );
    let mem: PeerAddress = "mem://relay".parse().unwrap();
    assert_eq!(mem, PeerAddress::memory("relay"));
    assert_eq!(mem.to_string(), "mem://relay");
    assert!(matches!(
        "relay".parse::<PeerAddress>(),
        Err(TransportError::InvalidAddress(_))
    ));
}

#[test]
fn test_link_ids_are_distinct_and_printable() {
    let a = LinkId::generate();
    let b = LinkId::generate();
    assert_ne!(a, b);
    assert_eq!(LinkId::from_bytes([0xAB; 8]).to_string(), "abababababababab");
}

#[test]
fn test_link_info_counters_saturate() {
    let mut info = LinkInfo::new(LinkId::from_bytes([1; 8]), PeerAddress::memory("x"));
    info.record_sent(usize::MAX);
    info.record_sent(usize::MAX);
    info.record_received(5);
    assert_eq!(info.bytes_sent(), u64::MAX);
    assert_eq!(info.bytes_received(), 5);
}

// ============================================================================
// STATE AND ERRORS
// ============================================================================

#[test]
fn test_state_reports_running() {
    assert_eq!(TransportState::default(), TransportState::Stopped);
    assert!(TransportState::Running.is_running());
    assert!(!TransportState::Stopped.is_running());
    assert!(!TransportState::Failed("bind: in use".into()).is_running());
}

#[test]
fn test_error_messages_and_io_conversion() {
    let link = LinkId::from_bytes([0x0F; 8]);
    assert_eq!(
        TransportError::UnknownLink(link).to_string(),
        "No open link 0f0f0f0f0f0f0f0f"
    );
    assert_eq!(TransportError::LinkLimit(3).to_string(), "Link limit of 3 reached");

    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
    assert!(matches!(TransportError::from(io), TransportError::Io(msg) if msg == "pipe"));
}

// ============================================================================
// DEFAULT BROADCAST
// ============================================================================

async fn drain_connected<T: Transport>(transport: &mut T, n: usize) {
    for _ in 0..n {
        match transport.next_event().await {
            Some(TransportEvent::Connected { .. }) => {}
            other => panic!("expected Connected, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_broadcast_reaches_every_link() {
    let net = MemoryNetwork::new();
    let mut hub = net.endpoint("hub").unwrap();
    let mut left = net.endpoint("left").unwrap();
    let mut right = net.endpoint("right").unwrap();
    hub.start().await.unwrap();
    net.link("hub", "left").unwrap();
    net.link("hub", "right").unwrap();
    drain_connected(&mut hub, 2).await;
    drain_connected(&mut left, 1).await;
    drain_connected(&mut right, 1).await;

    assert_eq!(hub.broadcast(b"to all").await.unwrap(), 2);
    for side in [&mut left, &mut right] {
        match side.next_event().await {
            Some(TransportEvent::Received { data, .. }) => assert_eq!(data, b"to all"),
            other => panic!("expected Received, got {:?}", other),
        }
    }
}
