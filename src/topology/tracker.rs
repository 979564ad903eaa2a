// Topology Tracker - confirmed-edge adjacency and shortest routes
//
// Peer records live in an arena indexed by slot; edges are pairs of slots.
// An edge exists only while both endpoints' latest announcements list each
// other, so a one-sided claim never makes a peer routable.

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Adjacency records not refreshed within this long are dropped
    pub neighbor_ttl_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            neighbor_ttl_ms: 5 * 60 * 1000,
        }
    }
}

impl TopologyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_neighbor_ttl_ms(mut self, ms: u64) -> Self {
        self.neighbor_ttl_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.neighbor_ttl_ms == 0 {
            return Err(TopologyError::InvalidConfig("neighbor_ttl_ms cannot be 0".to_string()));
        }
        Ok(())
    }
}

type Slot = usize;

#[derive(Debug)]
struct PeerRecord {
    id: PeerId,
    announced: BTreeSet<PeerId>,
    confirmed: BTreeSet<Slot>,
    last_updated: u64,
}

/// Adjacency graph built from announced neighbor lists
#[derive(Debug, Default)]
pub struct TopologyTracker {
    config: TopologyConfig,
    records: Vec<Option<PeerRecord>>,
    index: HashMap<PeerId, Slot>,
    free: Vec<Slot>,
}

impl TopologyTracker {
    pub fn new(config: TopologyConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Peers with a live adjacency record
    pub fn peer_count(&self) -> usize {
        self.index.len()
    }

    /// Number of confirmed (undirected) edges
    pub fn edge_count(&self) -> usize {
        self.records
            .iter()
            .flatten()
            .map(|r| r.confirmed.len())
            .sum::<usize>()
            / 2
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.index.contains_key(peer)
    }

    pub fn last_updated(&self, peer: &PeerId) -> Option<u64> {
        self.record(peer).map(|r| r.last_updated)
    }

    /// What `peer` last announced, confirmed or not
    pub fn announced_neighbors(&self, peer: &PeerId) -> Vec<PeerId> {
        self.record(peer)
            .map(|r| r.announced.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Neighbors of `peer` over confirmed edges, sorted
    pub fn confirmed_neighbors(&self, peer: &PeerId) -> Vec<PeerId> {
        let Some(record) = self.record(peer) else {
            return Vec::new();
        };
        let mut out: Vec<PeerId> = record
            .confirmed
            .iter()
            .filter_map(|slot| self.slot(*slot).map(|r| r.id))
            .collect();
        out.sort();
        out
    }

    pub fn has_edge(&self, a: &PeerId, b: &PeerId) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(sa), Some(sb)) => self.slot(*sa).is_some_and(|r| r.confirmed.contains(sb)),
            _ => false,
        }
    }

    // ========================================================================
    // UPDATES
    // ========================================================================

    /// Replace `peer`'s neighbor list and recompute its confirmed edges.
    /// Returns true when the set of confirmed edges changed.
    pub fn update_neighbors_at(&mut self, peer: PeerId, neighbors: &[PeerId], now_ms: u64) -> bool {
        let slot = self.slot_for(peer, now_ms);
        let old_confirmed = self.unlink(slot);

        let announced: BTreeSet<PeerId> = neighbors
            .iter()
            .copied()
            .filter(|n| *n != peer && !n.is_broadcast())
            .collect();

        let mut confirmed = BTreeSet::new();
        for neighbor in &announced {
            let Some(&other) = self.index.get(neighbor) else {
                continue;
            };
            let mutual = self
                .slot(other)
                .is_some_and(|r| r.announced.contains(&peer));
            if mutual {
                confirmed.insert(other);
            }
        }
        for other in &confirmed {
            if let Some(Some(r)) = self.records.get_mut(*other) {
                r.confirmed.insert(slot);
            }
        }

        let changed = old_confirmed != confirmed;
        if let Some(Some(record)) = self.records.get_mut(slot) {
            record.announced = announced;
            record.confirmed = confirmed;
            record.last_updated = now_ms;
        }
        if changed {
            info!(peer = %peer, edges = self.edge_count(), "Topology changed");
        } else {
            debug!(peer = %peer, "Neighbor list refreshed");
        }
        changed
    }

    pub fn update_neighbors(&mut self, peer: PeerId, neighbors: &[PeerId]) -> bool {
        self.update_neighbors_at(peer, neighbors, crate::now_millis())
    }

    /// Delete `peer` and every edge that depended on it
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let Some(slot) = self.index.remove(peer) else {
            return false;
        };
        let dropped = self.unlink(slot);
        if let Some(entry) = self.records.get_mut(slot) {
            *entry = None;
        }
        self.free.push(slot);
        info!(peer = %peer, edges_dropped = dropped.len(), "Peer removed from topology");
        true
    }

    /// Drop records whose last announcement is older than the TTL
    pub fn prune_stale_at(&mut self, now_ms: u64) -> Vec<PeerId> {
        let ttl = self.config.neighbor_ttl_ms;
        let mut stale: Vec<PeerId> = self
            .records
            .iter()
            .flatten()
            .filter(|r| now_ms.saturating_sub(r.last_updated) > ttl)
            .map(|r| r.id)
            .collect();
        stale.sort();
        for peer in &stale {
            self.remove_peer(peer);
        }
        stale
    }

    // ========================================================================
    // ROUTING
    // ========================================================================

    /// Intermediate hops of a shortest confirmed path from `from` to `to`.
    ///
    /// `Some(vec![])` for identical endpoints or a direct edge, `None` when no
    /// confirmed path exists. Among equal-length paths the one whose hops are
    /// lexicographically smallest (by peer id, nearest hop first) wins.
    pub fn compute_route(&self, from: &PeerId, to: &PeerId) -> Option<Vec<PeerId>> {
        if from == to {
            return Some(Vec::new());
        }
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;

        let mut parent: HashMap<Slot, Slot> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        parent.insert(start, start);

        while let Some(current) = queue.pop_front() {
            if current == goal {
                break;
            }
            for next in self.sorted_neighbors(current) {
                if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(next) {
                    e.insert(current);
                    queue.push_back(next);
                }
            }
        }

        if !parent.contains_key(&goal) {
            return None;
        }
        let mut hops = Vec::new();
        let mut cursor = *parent.get(&goal)?;
        while cursor != start {
            hops.push(self.slot(cursor)?.id);
            cursor = *parent.get(&cursor)?;
        }
        hops.reverse();
        Some(hops)
    }

    /// Every peer reachable from `peer` over confirmed edges, excluding itself
    pub fn reachable_from(&self, peer: &PeerId) -> Vec<PeerId> {
        let Some(&start) = self.index.get(peer) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for next in self.sorted_neighbors(current) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut out: Vec<PeerId> = seen
            .into_iter()
            .filter(|s| *s != start)
            .filter_map(|s| self.slot(s).map(|r| r.id))
            .collect();
        out.sort();
        out
    }

    // ========================================================================
    // ARENA
    // ========================================================================

    fn record(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.index.get(peer).and_then(|slot| self.slot(*slot))
    }

    fn slot(&self, slot: Slot) -> Option<&PeerRecord> {
        self.records.get(slot).and_then(Option::as_ref)
    }

    fn slot_for(&mut self, peer: PeerId, now_ms: u64) -> Slot {
        if let Some(slot) = self.index.get(&peer) {
            return *slot;
        }
        let record = PeerRecord {
            id: peer,
            announced: BTreeSet::new(),
            confirmed: BTreeSet::new(),
            last_updated: now_ms,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.records[slot] = Some(record);
                slot
            }
            None => {
                self.records.push(Some(record));
                self.records.len() - 1
            }
        };
        self.index.insert(peer, slot);
        slot
    }

    /// Remove every edge touching `slot`; returns the former neighbors
    fn unlink(&mut self, slot: Slot) -> BTreeSet<Slot> {
        let old = match self.records.get_mut(slot) {
            Some(Some(record)) => std::mem::take(&mut record.confirmed),
            _ => BTreeSet::new(),
        };
        for other in &old {
            if let Some(Some(r)) = self.records.get_mut(*other) {
                r.confirmed.remove(&slot);
            }
        }
        old
    }

    fn sorted_neighbors(&self, slot: Slot) -> Vec<Slot> {
        let Some(record) = self.slot(slot) else {
            return Vec::new();
        };
        let mut next: Vec<(PeerId, Slot)> = record
            .confirmed
            .iter()
            .filter_map(|s| self.slot(*s).map(|r| (r.id, *s)))
            .collect();
        next.sort();
        next.into_iter().map(|(_, s)| s).collect()
    }
}
