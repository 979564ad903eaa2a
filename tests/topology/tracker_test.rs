// Topology Tracker Tests
// Confirmed edges, shortest routes and stale record pruning

use blemesh::identity::PeerId;
use blemesh::topology::{TopologyConfig, TopologyTracker};

fn id(n: u8) -> PeerId {
    PeerId::from_bytes([n; 8])
}

/// A - B - C - D, every link announced from both ends
fn line() -> (TopologyTracker, [PeerId; 4]) {
    let [a, b, c, d] = [id(0xA), id(0xB), id(0xC), id(0xD)];
    let mut topo = TopologyTracker::new(TopologyConfig::default());
    topo.update_neighbors_at(a, &[b], 0);
    topo.update_neighbors_at(b, &[a, c], 0);
    topo.update_neighbors_at(c, &[b, d], 0);
    topo.update_neighbors_at(d, &[c], 0);
    (topo, [a, b, c, d])
}

// ============================================================================
// ROUTES
// ============================================================================

#[test]
fn test_route_through_line() {
    let (topo, [a, b, c, d]) = line();
    assert_eq!(topo.compute_route(&a, &d), Some(vec![b, c]));
    assert_eq!(topo.compute_route(&d, &a), Some(vec![c, b]));
    assert_eq!(topo.compute_route(&a, &b), Some(vec![]));
    assert_eq!(topo.compute_route(&a, &a), Some(vec![]));
}

#[test]
fn test_one_sided_claim_is_not_an_edge() {
    let (a, b) = (id(1), id(2));
    let mut topo = TopologyTracker::new(TopologyConfig::default());
    topo.update_neighbors_at(a, &[b], 0);
    topo.update_neighbors_at(b, &[], 0);

    assert!(!topo.has_edge(&a, &b));
    assert_eq!(topo.compute_route(&a, &b), None);
}

#[test]
fn test_removing_middle_peer_breaks_route() {
    let (mut topo, [a, b, _, d]) = line();
    assert!(topo.remove_peer(&b));
    assert_eq!(topo.compute_route(&a, &d), None);
    assert!(topo.confirmed_neighbors(&a).is_empty());
}

#[test]
fn test_withdrawn_neighbor_drops_edge() {
    let (mut topo, [a, b, c, d]) = line();
    assert!(topo.update_neighbors_at(c, &[d], 1));
    assert!(!topo.has_edge(&b, &c));
    assert_eq!(topo.compute_route(&a, &d), None);

    // Re-announcing restores it
    assert!(topo.update_neighbors_at(c, &[b, d], 2));
    assert_eq!(topo.compute_route(&a, &d), Some(vec![b, c]));
}

#[test]
fn test_equal_length_paths_prefer_smaller_hop() {
    // a - x - z and a - y - z with x < y
    let (a, x, y, z) = (id(1), id(2), id(3), id(9));
    let mut topo = TopologyTracker::new(TopologyConfig::default());
    topo.update_neighbors_at(a, &[y, x], 0);
    topo.update_neighbors_at(y, &[a, z], 0);
    topo.update_neighbors_at(x, &[a, z], 0);
    topo.update_neighbors_at(z, &[y, x], 0);

    assert_eq!(topo.compute_route(&a, &z), Some(vec![x]));
}

#[test]
fn test_unknown_endpoints_have_no_route() {
    let (topo, [a, ..]) = line();
    assert_eq!(topo.compute_route(&a, &id(0x55)), None);
    assert_eq!(topo.compute_route(&id(0x55), &a), None);
}

// ============================================================================
// MAINTENANCE
// ============================================================================

#[test]
fn test_stale_records_pruned() {
    let mut topo = TopologyTracker::new(TopologyConfig::new().with_neighbor_ttl_ms(1_000));
    let (a, b) = (id(1), id(2));
    topo.update_neighbors_at(a, &[b], 0);
    topo.update_neighbors_at(b, &[a], 900);

    assert_eq!(topo.prune_stale_at(1_500), vec![a]);
    assert!(!topo.contains(&a));
    assert!(topo.contains(&b));
    assert!(topo.confirmed_neighbors(&b).is_empty());
}

#[test]
fn test_reachable_from() {
    let (topo, [a, b, c, d]) = line();
    assert_eq!(topo.reachable_from(&a), vec![b, c, d]);
}

#[test]
fn test_self_and_broadcast_ignored_in_lists() {
    let a = id(1);
    let mut topo = TopologyTracker::new(TopologyConfig::default());
    topo.update_neighbors_at(a, &[a, PeerId::BROADCAST], 0);
    assert!(topo.announced_neighbors(&a).is_empty());
}
