// Gossip Sync Manager - anti-entropy for broadcast content
//
// Records every observed broadcast packet into the cache for its type and
// serves those caches back on RequestSync. Periodic maintenance:
// - purges peers whose last announcement is too old, with all their content
// - emits one RequestSync per content type whose interval has elapsed and
//   which saw new content or new peers since its last round
// - fires delayed initial syncs to newly seen peers

use crate::identity::PeerId;
use crate::sync::cache::{Admit, TypedCache};
use crate::sync::protocol::{RequestSync, SyncError, SyncKind, SyncTypeFlags};
use crate::wire::{MessageType, Packet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

// ============================================================================
// CONFIG
// ============================================================================

/// Configuration for the gossip sync manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipConfig {
    pub message_capacity: usize,
    pub fragment_capacity: usize,
    pub file_transfer_capacity: usize,
    /// Packets older than this are never cached
    pub max_message_age_ms: u64,
    pub maintenance_interval_ms: u64,
    pub message_sync_interval_ms: u64,
    pub fragment_sync_interval_ms: u64,
    pub file_transfer_sync_interval_ms: u64,
    /// Peers silent for longer are purged with their content
    pub stale_peer_timeout_ms: u64,
    pub initial_sync_delay_ms: u64,
    /// Upper bound on id prefixes sent in one RequestSync
    pub max_known_ids: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            message_capacity: 1000,
            fragment_capacity: 600,
            file_transfer_capacity: 200,
            max_message_age_ms: 15 * 60 * 1000,
            maintenance_interval_ms: 30_000,
            message_sync_interval_ms: 15_000,
            fragment_sync_interval_ms: 30_000,
            file_transfer_sync_interval_ms: 60_000,
            stale_peer_timeout_ms: 60_000,
            initial_sync_delay_ms: 5_000,
            max_known_ids: 256,
        }
    }
}

impl GossipConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, kind: SyncKind, capacity: usize) -> Self {
        match kind {
            SyncKind::Messages => self.message_capacity = capacity,
            SyncKind::Fragments => self.fragment_capacity = capacity,
            SyncKind::FileTransfers => self.file_transfer_capacity = capacity,
        }
        self
    }

    pub fn with_sync_interval_ms(mut self, kind: SyncKind, ms: u64) -> Self {
        match kind {
            SyncKind::Messages => self.message_sync_interval_ms = ms,
            SyncKind::Fragments => self.fragment_sync_interval_ms = ms,
            SyncKind::FileTransfers => self.file_transfer_sync_interval_ms = ms,
        }
        self
    }

    pub fn with_max_message_age_ms(mut self, ms: u64) -> Self {
        self.max_message_age_ms = ms;
        self
    }

    pub fn with_maintenance_interval_ms(mut self, ms: u64) -> Self {
        self.maintenance_interval_ms = ms;
        self
    }

    pub fn with_stale_peer_timeout_ms(mut self, ms: u64) -> Self {
        self.stale_peer_timeout_ms = ms;
        self
    }

    pub fn with_initial_sync_delay_ms(mut self, ms: u64) -> Self {
        self.initial_sync_delay_ms = ms;
        self
    }

    pub fn with_max_known_ids(mut self, max: usize) -> Self {
        self.max_known_ids = max;
        self
    }

    pub fn capacity(&self, kind: SyncKind) -> usize {
        match kind {
            SyncKind::Messages => self.message_capacity,
            SyncKind::Fragments => self.fragment_capacity,
            SyncKind::FileTransfers => self.file_transfer_capacity,
        }
    }

    pub fn sync_interval_ms(&self, kind: SyncKind) -> u64 {
        match kind {
            SyncKind::Messages => self.message_sync_interval_ms,
            SyncKind::Fragments => self.fragment_sync_interval_ms,
            SyncKind::FileTransfers => self.file_transfer_sync_interval_ms,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for kind in SyncKind::ALL {
            if self.capacity(kind) == 0 {
                return Err(SyncError::InvalidConfig(format!("{} capacity cannot be 0", kind)));
            }
            if self.sync_interval_ms(kind) == 0 {
                return Err(SyncError::InvalidConfig(format!("{} sync interval cannot be 0", kind)));
            }
        }
        if self.maintenance_interval_ms == 0 {
            return Err(SyncError::InvalidConfig("maintenance_interval_ms cannot be 0".to_string()));
        }
        if self.max_message_age_ms == 0 || self.stale_peer_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("timeouts cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// OUTPUTS
// ============================================================================

/// Outcome of observing one packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// First sighting; stored in the cache for its type
    New(SyncKind),
    /// Already cached
    Duplicate,
    /// Older than the maximum age
    TooOld,
    /// Sender has no live announcement; its content would outlive it
    Unannounced,
    /// Announcement recorded for its sender
    Announcement { first_seen: bool },
    /// Not a gossiped type (directed traffic, sync requests, ...)
    Ignored,
}

/// Work produced by maintenance for the caller to carry out
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipAction {
    /// Send a RequestSync to one peer, or to every neighbor when `to` is None
    SendRequest { to: Option<PeerId>, request: RequestSync },
    /// The peer went stale and was purged with its content
    PeerExpired(PeerId),
}

/// Statistics about the gossip sync manager
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GossipStats {
    pub packets_recorded: u64,
    pub duplicates: u64,
    pub too_old: u64,
    pub unannounced: u64,
    pub requests_sent: u64,
    pub requests_served: u64,
    pub packets_served: u64,
    pub peers_purged: u64,
    pub entries_purged: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct SyncSchedule {
    last_sync_ms: Option<u64>,
    dirty: bool,
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct GossipSyncManager {
    local_peer: PeerId,
    config: GossipConfig,
    caches: [TypedCache; 3],
    announcements: HashMap<PeerId, u64>,
    schedules: [SyncSchedule; 3],
    pending_initial: BTreeMap<PeerId, u64>,
    last_maintenance_ms: Option<u64>,
    next_marker: u64,
    stats: GossipStats,
}

impl GossipSyncManager {
    pub fn new(local_peer: PeerId, config: GossipConfig) -> Self {
        let age = config.max_message_age_ms;
        let caches = SyncKind::ALL.map(|kind| TypedCache::new(kind, config.capacity(kind), age));
        Self {
            local_peer,
            caches,
            config,
            announcements: HashMap::new(),
            schedules: [SyncSchedule::default(); 3],
            pending_initial: BTreeMap::new(),
            last_maintenance_ms: None,
            next_marker: 1,
            stats: GossipStats::default(),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn stats(&self) -> &GossipStats {
        &self.stats
    }

    pub fn cache(&self, kind: SyncKind) -> &TypedCache {
        &self.caches[kind.index()]
    }

    pub fn cached_count(&self, kind: SyncKind) -> usize {
        self.cache(kind).len()
    }

    pub fn announcement_count(&self) -> usize {
        self.announcements.len()
    }

    pub fn last_announcement(&self, peer: &PeerId) -> Option<u64> {
        self.announcements.get(peer).copied()
    }

    pub fn has_packet(&self, packet: &Packet) -> bool {
        let Some(kind) = SyncKind::for_message_type(packet.message_type) else {
            return false;
        };
        self.cache(kind).contains(&packet.id())
    }

    /// Whether `packet` is past the maximum age and would never be cached
    pub fn is_too_old_at(&self, packet: &Packet, now_ms: u64) -> bool {
        now_ms.saturating_sub(packet.timestamp) > self.config.max_message_age_ms
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Record a packet we sent or received. Content from other peers is
    /// cached only while their announcement is live.
    pub fn on_packet_at(&mut self, packet: &Packet, now_ms: u64) -> Observation {
        if packet.message_type == MessageType::Announce {
            return self.on_announcement_at(packet.sender_id, now_ms);
        }
        if packet.message_type == MessageType::Leave {
            self.remove_peer(&packet.sender_id);
            return Observation::Ignored;
        }
        if !packet.is_broadcast() {
            return Observation::Ignored;
        }
        let Some(kind) = SyncKind::for_message_type(packet.message_type) else {
            return Observation::Ignored;
        };
        let own = packet.sender_id == self.local_peer;
        if !own && !self.announcements.contains_key(&packet.sender_id) {
            self.stats.unannounced += 1;
            debug!(kind = %kind, sender = %packet.sender_id, "Not caching content from unannounced sender");
            return Observation::Unannounced;
        }

        match self.caches[kind.index()].insert_at(packet, now_ms) {
            Admit::Stored => {
                self.stats.packets_recorded += 1;
                self.schedules[kind.index()].dirty = true;
                debug!(kind = %kind, sender = %packet.sender_id, id = %packet.id(), "Cached gossip packet");
                Observation::New(kind)
            }
            Admit::Duplicate => {
                self.stats.duplicates += 1;
                Observation::Duplicate
            }
            Admit::TooOld => {
                self.stats.too_old += 1;
                Observation::TooOld
            }
        }
    }

    pub fn on_announcement_at(&mut self, peer: PeerId, now_ms: u64) -> Observation {
        if peer == self.local_peer {
            return Observation::Ignored;
        }
        let first_seen = self.announcements.insert(peer, now_ms).is_none();
        if first_seen {
            // A new peer may be missing anything we hold, and vice versa
            for schedule in &mut self.schedules {
                schedule.dirty = true;
            }
            debug!(peer = %peer, "First announcement from peer");
        }
        Observation::Announcement { first_seen }
    }

    /// Queue a full sync with `peer` after the configured delay
    pub fn schedule_initial_sync_at(&mut self, peer: PeerId, now_ms: u64) {
        let due = now_ms.saturating_add(self.config.initial_sync_delay_ms);
        self.pending_initial.entry(peer).or_insert(due);
    }

    pub fn pending_initial_syncs(&self) -> usize {
        self.pending_initial.len()
    }

    /// Forget a peer and everything it originated
    pub fn remove_peer(&mut self, peer: &PeerId) -> usize {
        self.announcements.remove(peer);
        self.pending_initial.remove(peer);
        let purged: usize = self.caches.iter_mut().map(|c| c.remove_sender(peer)).sum();
        self.stats.entries_purged += purged as u64;
        purged
    }

    // ========================================================================
    // SERVING
    // ========================================================================

    /// Cached packets the requester asked for and does not already hold.
    /// Only the requested types are consulted.
    pub fn handle_request_sync(&mut self, requester: &PeerId, request: &RequestSync) -> Vec<Packet> {
        let known = request.known_set();
        let mut out = Vec::new();
        for kind in request.types.kinds() {
            out.extend(
                self.caches[kind.index()]
                    .packets()
                    .filter(|p| p.sender_id != *requester)
                    .filter(|p| !known.contains(&p.id().prefix()))
                    .cloned(),
            );
        }
        self.stats.requests_served += 1;
        self.stats.packets_served += out.len() as u64;
        debug!(
            requester = %requester,
            types = ?request.types,
            served = out.len(),
            "Served RequestSync"
        );
        out
    }

    /// Build a request for `types`, listing the newest ids we hold of them
    pub fn build_request(&mut self, types: SyncTypeFlags) -> RequestSync {
        let marker = self.next_marker;
        self.next_marker += 1;

        let max = self.config.max_known_ids;
        let mut known = Vec::new();
        for kind in types.kinds() {
            let ids: Vec<_> = self.caches[kind.index()].ids().copied().collect();
            let skip = ids.len().saturating_sub(max.saturating_sub(known.len()));
            known.extend(ids.into_iter().skip(skip));
        }
        RequestSync::new(marker, types).with_known(known)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    pub fn maintenance_due_at(&self, now_ms: u64) -> bool {
        match self.last_maintenance_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.config.maintenance_interval_ms,
        }
    }

    /// Purge stale peers, prune expired content, emit due sync requests
    pub fn maintenance_at(&mut self, now_ms: u64) -> Vec<GossipAction> {
        self.last_maintenance_ms = Some(now_ms);
        let mut actions = Vec::new();

        let timeout = self.config.stale_peer_timeout_ms;
        let mut stale: Vec<PeerId> = self
            .announcements
            .iter()
            .filter(|(_, seen)| now_ms.saturating_sub(**seen) > timeout)
            .map(|(peer, _)| *peer)
            .collect();
        stale.sort();
        for peer in stale {
            let purged = self.remove_peer(&peer);
            self.stats.peers_purged += 1;
            info!(peer = %peer, purged, "Purged stale peer");
            actions.push(GossipAction::PeerExpired(peer));
        }

        let expired: usize = self.caches.iter_mut().map(|c| c.prune_expired_at(now_ms)).sum();
        self.stats.entries_purged += expired as u64;

        let due: Vec<PeerId> = self
            .pending_initial
            .iter()
            .filter(|(_, due)| **due <= now_ms)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in due {
            self.pending_initial.remove(&peer);
            let request = self.build_request(SyncTypeFlags::all());
            self.stats.requests_sent += 1;
            actions.push(GossipAction::SendRequest {
                to: Some(peer),
                request,
            });
        }

        for kind in SyncKind::ALL {
            let schedule = self.schedules[kind.index()];
            let interval_elapsed = match schedule.last_sync_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= self.config.sync_interval_ms(kind),
            };
            if !(schedule.dirty && interval_elapsed) {
                continue;
            }
            let request = self.build_request(kind.flag());
            self.schedules[kind.index()] = SyncSchedule {
                last_sync_ms: Some(now_ms),
                dirty: false,
            };
            self.stats.requests_sent += 1;
            debug!(kind = %kind, known = request.known.len(), "Emitting typed sync request");
            actions.push(GossipAction::SendRequest { to: None, request });
        }

        actions
    }

    pub fn maintenance(&mut self) -> Vec<GossipAction> {
        self.maintenance_at(crate::now_millis())
    }
}
