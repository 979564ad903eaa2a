// Typed Cache - bounded, age-limited store of one gossip content type
//
// Keyed by packet identity, so a retransmission of the same packet is
// stored once. Oldest insertions are evicted first when full.

use crate::dedup::LruCache;
use crate::identity::PeerId;
use crate::sync::protocol::SyncKind;
use crate::wire::{Packet, PacketId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admit {
    Stored,
    Duplicate,
    TooOld,
}

#[derive(Clone, Debug)]
pub struct CachedPacket {
    pub packet: Packet,
    pub received_at: u64,
}

pub struct TypedCache {
    kind: SyncKind,
    max_age_ms: u64,
    entries: LruCache<PacketId, CachedPacket>,
}

impl TypedCache {
    pub fn new(kind: SyncKind, capacity: usize, max_age_ms: u64) -> Self {
        Self {
            kind,
            max_age_ms,
            entries: LruCache::new(capacity),
        }
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn contains(&self, id: &PacketId) -> bool {
        self.entries.contains(id)
    }

    fn is_expired(&self, timestamp: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(timestamp) > self.max_age_ms
    }

    pub fn insert_at(&mut self, packet: &Packet, now_ms: u64) -> Admit {
        if self.is_expired(packet.timestamp, now_ms) {
            return Admit::TooOld;
        }
        let id = packet.id();
        if self.entries.contains(&id) {
            return Admit::Duplicate;
        }
        self.entries.insert(
            id,
            CachedPacket {
                packet: packet.clone(),
                received_at: now_ms,
            },
        );
        Admit::Stored
    }

    /// Drop everything `sender` originated
    pub fn remove_sender(&mut self, sender: &PeerId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.packet.sender_id != *sender);
        before - self.entries.len()
    }

    pub fn prune_expired_at(&mut self, now_ms: u64) -> usize {
        let max_age = self.max_age_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, cached| now_ms.saturating_sub(cached.packet.timestamp) <= max_age);
        before - self.entries.len()
    }

    /// Live packets, oldest insertion first
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.entries.iter().map(|(_, cached)| &cached.packet)
    }

    pub fn ids(&self) -> impl Iterator<Item = &PacketId> {
        self.entries.keys()
    }

    pub fn evictions(&self) -> u64 {
        self.entries.evictions()
    }
}
