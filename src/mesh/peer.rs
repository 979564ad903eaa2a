// Peer Registry - who we have heard announce, and how to reach them
//
// Binds each short PeerId to the stable fingerprint and signing key from its
// announcement, and remembers which link (if any) reaches it directly.

use crate::identity::{Fingerprint, PeerId, PeerRef, PublicKey};
use crate::transport::LinkId;
use std::collections::HashMap;
use thiserror::Error;

/// Peer-related errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeerError {
    #[error("Cannot add self as a peer")]
    CannotAddSelf,

    #[error("Peer {0} announced a key that does not match its id")]
    IdentityMismatch(PeerId),

    #[error("Peer {0} changed its signing key")]
    SigningKeyChanged(PeerId),
}

/// How a peer is currently reachable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Heard through relays only
    Announced,
    /// Has a direct link to us
    Connected,
    /// Direct link went down; may still be reachable through relays
    Disconnected,
}

/// Statistics about a peer registry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub announced_peers: usize,
    pub disconnected_peers: usize,
    pub verified_peers: usize,
}

/// Information about a known peer
#[derive(Clone, Debug)]
pub struct PeerInfo {
    peer_id: PeerId,
    nickname: String,
    fingerprint: Fingerprint,
    signing_key: PublicKey,
    link: Option<LinkId>,
    state: PeerState,
    last_seen: u64,
    verified: bool,
}

impl PeerInfo {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn signing_key(&self) -> &PublicKey {
        &self.signing_key
    }

    /// Direct link, when connected
    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// True once the peer answered a verification challenge with its announced key
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_stale(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > timeout_ms
    }
}

/// What an announcement changed in the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Upsert {
    pub first_seen: bool,
    pub nickname_changed: bool,
}

/// Registry of known peers
#[derive(Clone, Debug)]
pub struct PeerRegistry {
    my_peer_id: PeerId,
    peers: HashMap<PeerId, PeerInfo>,
}

impl PeerRegistry {
    pub fn new(my_peer_id: PeerId) -> Self {
        Self {
            my_peer_id,
            peers: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Record an announcement. The fingerprint must hash to the announced id,
    /// and a known peer may not swap its signing key.
    pub fn upsert_announced(
        &mut self,
        peer_id: PeerId,
        nickname: &str,
        fingerprint: Fingerprint,
        signing_key: PublicKey,
        now_ms: u64,
    ) -> Result<Upsert, PeerError> {
        if peer_id == self.my_peer_id {
            return Err(PeerError::CannotAddSelf);
        }
        if fingerprint.short_id() != peer_id {
            return Err(PeerError::IdentityMismatch(peer_id));
        }

        if let Some(existing) = self.peers.get_mut(&peer_id) {
            if existing.signing_key != signing_key {
                return Err(PeerError::SigningKeyChanged(peer_id));
            }
            let nickname_changed = existing.nickname != nickname;
            existing.nickname = nickname.to_string();
            existing.last_seen = now_ms;
            return Ok(Upsert {
                first_seen: false,
                nickname_changed,
            });
        }

        self.peers.insert(
            peer_id,
            PeerInfo {
                peer_id,
                nickname: nickname.to_string(),
                fingerprint,
                signing_key,
                link: None,
                state: PeerState::Announced,
                last_seen: now_ms,
                verified: false,
            },
        );
        Ok(Upsert {
            first_seen: true,
            nickname_changed: false,
        })
    }

    /// Mark `peer_id` as directly reachable over `link`
    pub fn attach_link(&mut self, peer_id: &PeerId, link: LinkId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(info) => {
                info.link = Some(link);
                info.state = PeerState::Connected;
                true
            }
            None => false,
        }
    }

    /// Forget a direct link; returns the peer it reached
    pub fn detach_link(&mut self, link: &LinkId) -> Option<PeerId> {
        let info = self.peers.values_mut().find(|p| p.link.as_ref() == Some(link))?;
        info.link = None;
        info.state = PeerState::Disconnected;
        Some(info.peer_id)
    }

    pub fn mark_verified(&mut self, peer_id: &PeerId) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.verified = true;
        }
    }

    pub fn touch(&mut self, peer_id: &PeerId, now_ms: u64) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.last_seen = now_ms;
        }
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    /// Resolve either identifier form to the short id
    pub fn resolve(&self, peer: &PeerRef) -> Option<PeerId> {
        match peer {
            PeerRef::Short(id) => self.peers.contains_key(id).then_some(*id),
            PeerRef::Stable(fp) => self
                .peers
                .values()
                .find(|p| p.fingerprint == *fp)
                .map(|p| p.peer_id),
        }
    }

    pub fn by_nickname(&self, nickname: &str) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.nickname == nickname)
            .map(|p| p.peer_id)
            .collect();
        ids.sort();
        ids
    }

    /// All peers, ordered by id
    pub fn all_peers(&self) -> Vec<&PeerInfo> {
        let mut peers: Vec<&PeerInfo> = self.peers.values().collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    /// Peers with a direct link, ordered by id
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.peer_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn peers_by_state(&self, state: PeerState) -> Vec<&PeerInfo> {
        self.peers.values().filter(|p| p.state == state).collect()
    }

    /// Drop peers not heard from within the timeout that have no direct link
    pub fn remove_stale_peers_at(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<PeerId> {
        let mut stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.link.is_none() && p.is_stale(now_ms, timeout_ms))
            .map(|p| p.peer_id)
            .collect();
        stale.sort();
        for peer_id in &stale {
            self.peers.remove(peer_id);
        }
        stale
    }

    pub fn stats(&self) -> PeerStats {
        let mut stats = PeerStats {
            total_peers: self.peers.len(),
            ..PeerStats::default()
        };
        for peer in self.peers.values() {
            match peer.state {
                PeerState::Connected => stats.connected_peers += 1,
                PeerState::Announced => stats.announced_peers += 1,
                PeerState::Disconnected => stats.disconnected_peers += 1,
            }
            if peer.verified {
                stats.verified_peers += 1;
            }
        }
        stats
    }
}
