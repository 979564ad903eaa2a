// Mesh Node - synchronous protocol core for one peer
//
// Owns every piece of mutable protocol state: sessions, gossip caches,
// adjacency, flood buckets, fragment sets and per-link assemblers. Each
// entry point takes the current time and returns what to write to which link
// and what to tell the application; nothing here blocks or awaits.

use crate::dedup::{ContentKey, FloodController, LruCache};
use crate::identity::{Fingerprint, IdentityKeys, PeerId, PeerRef, PublicKey};
use crate::mesh::config::MeshConfig;
use crate::mesh::error::{MeshError, MeshResult};
use crate::mesh::payload::{AppPayload, MessageId};
use crate::mesh::peer::{PeerInfo, PeerRegistry};
use crate::noise::{NoiseError, SessionAction, SessionManager};
use crate::sync::{GossipAction, GossipSyncManager, Observation, RequestSync, SyncKind};
use crate::topology::TopologyTracker;
use crate::transport::{LinkId, PeerAddress, TransportEvent};
use crate::wire::{
    fragment_packet, AnnouncementPayload, FragmentReassembler, FrameAssembler, MessageType, Packet,
    PacketCodec, PacketId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

// ============================================================================
// OUTPUTS
// ============================================================================

/// Notifications for the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshEvent {
    /// First announcement from a peer, or a peer bound to a direct link
    PeerAnnounced { peer: PeerId, nickname: String, direct: bool },
    /// A direct link to the peer went down
    PeerDisconnected { peer: PeerId },
    /// The peer left or went silent and was purged
    PeerLost { peer: PeerId },
    SessionEstablished { peer: PeerId, fingerprint: Fingerprint },
    PublicMessage { sender: PeerId, nickname: Option<String>, text: String, timestamp: u64 },
    PrivateMessage { sender: PeerId, id: MessageId, text: String },
    DeliveryAck { peer: PeerId, id: MessageId },
    ReadReceipt { peer: PeerId, id: MessageId },
    PeerVerified { peer: PeerId, verified: bool },
    FileChunk { sender: PeerId, data: Vec<u8> },
}

/// One thing the caller must do after a node call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeOutput {
    Send { link: LinkId, bytes: Vec<u8> },
    Event(MeshEvent),
}

/// How a directed packet would leave this node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Over the peer's own link
    Direct,
    /// Through these intermediate hops, nearest first
    Via(Vec<PeerId>),
    Unreachable,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub packets_received: u64,
    pub frames_sent: u64,
    pub bytes_discarded: u64,
    pub own_echoes: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub invalid_signatures: u64,
    pub rejected_announces: u64,
    pub too_old: u64,
    pub rate_limited: u64,
    pub content_duplicates: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub forwarded: u64,
    pub flooded: u64,
    pub handshake_errors: u64,
    pub decrypt_errors: u64,
    pub rehandshakes: u64,
    pub outbox_dropped: u64,
    pub sync_packets_served: u64,
    pub encode_errors: u64,
}

struct LinkState {
    address: PeerAddress,
    assembler: FrameAssembler,
    peer: Option<PeerId>,
}

// ============================================================================
// NODE
// ============================================================================

pub struct MeshNode {
    identity: IdentityKeys,
    peer_id: PeerId,
    config: MeshConfig,
    codec: PacketCodec,
    sessions: SessionManager,
    gossip: GossipSyncManager,
    flood: FloodController,
    topology: TopologyTracker,
    reassembler: FragmentReassembler,
    peers: PeerRegistry,
    links: HashMap<LinkId, LinkState>,
    seen: LruCache<PacketId, ()>,
    outbox: HashMap<PeerId, VecDeque<AppPayload>>,
    challenges: HashMap<PeerId, [u8; 16]>,
    last_announce_ms: Option<u64>,
    stats: NodeStats,
}

impl MeshNode {
    pub fn new(identity: IdentityKeys, config: MeshConfig) -> MeshResult<Self> {
        config.validate()?;
        let peer_id = identity.peer_id();
        let codec = config.wire.codec();
        Ok(Self {
            sessions: SessionManager::new(peer_id, identity.noise().clone(), config.session.clone()),
            gossip: GossipSyncManager::new(peer_id, config.gossip.clone()),
            flood: FloodController::new(config.flood.clone()),
            topology: TopologyTracker::new(config.topology.clone()),
            reassembler: FragmentReassembler::new(
                codec.clone(),
                config.wire.max_pending_fragment_sets,
                config.wire.fragment_timeout_ms,
            ),
            peers: PeerRegistry::new(peer_id),
            links: HashMap::new(),
            seen: LruCache::new(config.seen_cache_capacity),
            outbox: HashMap::new(),
            challenges: HashMap::new(),
            last_announce_ms: None,
            stats: NodeStats::default(),
            identity,
            peer_id,
            config,
            codec,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn nickname(&self) -> &str {
        &self.config.nickname
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn gossip(&self) -> &GossipSyncManager {
        &self.gossip
    }

    pub fn flood(&self) -> &FloodController {
        &self.flood
    }

    pub fn topology(&self) -> &TopologyTracker {
        &self.topology
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_peer(&self, link: &LinkId) -> Option<PeerId> {
        self.links.get(link).and_then(|l| l.peer)
    }

    pub fn link_address(&self, link: &LinkId) -> Option<&PeerAddress> {
        self.links.get(link).map(|l| &l.address)
    }

    pub fn is_established(&self, peer: &PeerId) -> bool {
        self.sessions.is_established(peer)
    }

    /// Either identifier form to the short id. A fingerprint we have not
    /// heard announced still maps to the id derived from it.
    pub fn resolve_peer(&self, peer: &PeerRef) -> PeerId {
        match peer {
            PeerRef::Short(id) => *id,
            PeerRef::Stable(fp) => self
                .peers
                .resolve(peer)
                .unwrap_or_else(|| fp.short_id()),
        }
    }

    pub fn route_to(&self, peer: &PeerId) -> Route {
        if self.direct_link(peer).is_some() {
            return Route::Direct;
        }
        match self.topology.compute_route(&self.peer_id, peer) {
            Some(hops) if hops.is_empty() => Route::Direct,
            Some(hops) => Route::Via(hops),
            None => Route::Unreachable,
        }
    }

    // ========================================================================
    // TRANSPORT INPUT
    // ========================================================================

    pub fn on_transport_event_at(&mut self, event: TransportEvent, now_ms: u64) -> Vec<NodeOutput> {
        match event {
            TransportEvent::Connected { link, address } => self.on_link_up_at(link, address, now_ms),
            TransportEvent::Disconnected { link, reason } => {
                debug!(link = %link, reason = %reason, "Link down");
                self.on_link_down_at(link, now_ms)
            }
            TransportEvent::Received { link, data } => self.on_bytes_at(link, &data, now_ms),
            TransportEvent::Listening { address } => {
                info!(address = %address, "Transport listening");
                Vec::new()
            }
            TransportEvent::Error { link, error } => {
                warn!(link = ?link, error = %error, "Transport error");
                Vec::new()
            }
        }
    }

    /// A new link: introduce ourselves on it before anything else
    pub fn on_link_up_at(&mut self, link: LinkId, address: PeerAddress, now_ms: u64) -> Vec<NodeOutput> {
        debug!(link = %link, address = %address, "Link up");
        self.links.insert(
            link,
            LinkState {
                address,
                assembler: FrameAssembler::new(self.codec.clone()),
                peer: None,
            },
        );
        let mut out = Vec::new();
        if let Some(announce) = self.announce_packet(now_ms) {
            let frames = self.encode_frames(&announce);
            self.push_frames(link, &frames, &mut out);
        }
        out
    }

    pub fn on_link_down_at(&mut self, link: LinkId, now_ms: u64) -> Vec<NodeOutput> {
        let mut out = Vec::new();
        if self.links.remove(&link).is_none() {
            return out;
        }
        if let Some(peer) = self.peers.detach_link(&link) {
            info!(peer = %peer, link = %link, "Direct peer disconnected");
            self.refresh_own_adjacency(now_ms);
            out.push(NodeOutput::Event(MeshEvent::PeerDisconnected { peer }));
            // Our neighbor list shrank
            out.extend(self.announce_at(now_ms));
        }
        out
    }

    /// Bytes from one link, split or coalesced arbitrarily
    pub fn on_bytes_at(&mut self, link: LinkId, data: &[u8], now_ms: u64) -> Vec<NodeOutput> {
        let mut out = Vec::new();
        let Some(state) = self.links.get_mut(&link) else {
            debug!(link = %link, len = data.len(), "Bytes on unknown link dropped");
            return out;
        };
        let assembled = state.assembler.append(data);
        if assembled.discarded > 0 {
            self.stats.bytes_discarded += assembled.discarded as u64;
            warn!(link = %link, discarded = assembled.discarded, "Discarded unframeable bytes");
        }
        for packet in assembled.packets {
            self.handle_packet_at(link, packet, now_ms, true, &mut out);
        }
        out
    }

    // ========================================================================
    // APPLICATION INPUT
    // ========================================================================

    /// Sign and flood a public chat message
    pub fn send_public_at(&mut self, text: &str, now_ms: u64) -> MeshResult<Vec<NodeOutput>> {
        let mut packet = self.packet(MessageType::Message, text.as_bytes().to_vec(), now_ms);
        packet.sign(self.identity.signing())?;
        self.mark_seen(&packet);
        self.gossip.on_packet_at(&packet, now_ms);
        self.flood.check_duplicate_content_at(ContentKey::from_text(text), now_ms);

        let mut out = Vec::new();
        self.send_to_links_except(&packet, None, &mut out);
        debug!(len = text.len(), links = self.links.len(), "Sent public message");
        Ok(out)
    }

    /// Sign and flood one chunk of a broadcast file transfer
    pub fn send_file_chunk_at(&mut self, data: Vec<u8>, now_ms: u64) -> MeshResult<Vec<NodeOutput>> {
        let mut packet = self.packet(MessageType::FileTransfer, data, now_ms);
        packet.sign(self.identity.signing())?;
        self.mark_seen(&packet);
        self.gossip.on_packet_at(&packet, now_ms);
        let mut out = Vec::new();
        self.send_to_links_except(&packet, None, &mut out);
        Ok(out)
    }

    /// Encrypted chat to one peer; held until a session exists
    pub fn send_private_at(
        &mut self,
        peer: PeerId,
        text: &str,
        now_ms: u64,
    ) -> MeshResult<(MessageId, Vec<NodeOutput>)> {
        let id = MessageId::generate();
        let payload = AppPayload::Chat {
            id,
            text: text.to_string(),
        };
        let mut out = Vec::new();
        self.send_app_at(peer, payload, now_ms, &mut out)?;
        Ok((id, out))
    }

    pub fn send_read_receipt_at(&mut self, peer: PeerId, id: MessageId, now_ms: u64) -> MeshResult<Vec<NodeOutput>> {
        let mut out = Vec::new();
        self.send_app_at(peer, AppPayload::ReadReceipt { id }, now_ms, &mut out)?;
        Ok(out)
    }

    /// Challenge a peer to prove it holds the signing key it announced
    pub fn verify_peer_at(&mut self, peer: PeerId, now_ms: u64) -> MeshResult<Vec<NodeOutput>> {
        if !self.peers.has_peer(&peer) {
            return Err(MeshError::UnknownPeer(peer.to_string()));
        }
        let challenge = AppPayload::challenge();
        if let AppPayload::VerifyChallenge { nonce } = &challenge {
            self.challenges.insert(peer, *nonce);
        }
        let mut out = Vec::new();
        self.send_app_at(peer, challenge, now_ms, &mut out)?;
        Ok(out)
    }

    /// Start a fresh handshake, superseding any session with `peer`
    pub fn initiate_handshake_at(&mut self, peer: PeerId, now_ms: u64) -> MeshResult<Vec<NodeOutput>> {
        if peer == self.peer_id {
            return Err(MeshError::SelfAddressed(peer));
        }
        let actions = self.sessions.initiate_at(peer, now_ms)?;
        let mut out = Vec::new();
        self.apply_session_actions(peer, actions, now_ms, &mut out);
        Ok(out)
    }

    /// Flood our presence and direct-neighbor list
    pub fn announce_at(&mut self, now_ms: u64) -> Vec<NodeOutput> {
        let mut out = Vec::new();
        if let Some(packet) = self.announce_packet(now_ms) {
            self.send_to_links_except(&packet, None, &mut out);
        }
        out
    }

    /// Tell the mesh we are going away
    pub fn leave_at(&mut self, now_ms: u64) -> Vec<NodeOutput> {
        let mut out = Vec::new();
        let mut packet = self.packet(MessageType::Leave, Vec::new(), now_ms);
        if let Err(e) = packet.sign(self.identity.signing()) {
            warn!(error = %e, "Cannot sign leave");
            return out;
        }
        self.mark_seen(&packet);
        self.send_to_links_except(&packet, None, &mut out);
        out
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Timers: gossip sync and purge, stalled handshakes, idle buckets, stale
    /// adjacency, expired fragment sets, periodic announce
    pub fn maintenance_at(&mut self, now_ms: u64) -> Vec<NodeOutput> {
        let mut out = Vec::new();

        if self.gossip.maintenance_due_at(now_ms) {
            for action in self.gossip.maintenance_at(now_ms) {
                match action {
                    GossipAction::SendRequest { to, request } => self.send_request_sync(to, &request, now_ms, &mut out),
                    GossipAction::PeerExpired(peer) => self.forget_peer(peer, &mut out),
                }
            }
        }

        for peer in self.sessions.prune_stalled_at(now_ms) {
            if let Some(dropped) = self.outbox.remove(&peer) {
                self.stats.outbox_dropped += dropped.len() as u64;
                warn!(peer = %peer, dropped = dropped.len(), "Handshake stalled; dropped queued messages");
            }
            self.challenges.remove(&peer);
        }

        self.flood.prune_idle_at(now_ms);
        self.reassembler.prune_at(now_ms);

        let stale = self.peers.remove_stale_peers_at(now_ms, self.config.gossip.stale_peer_timeout_ms);
        for peer in stale {
            self.forget_peer(peer, &mut out);
        }
        for peer in self.topology.prune_stale_at(now_ms) {
            debug!(peer = %peer, "Dropped stale adjacency record");
        }

        let announce_due = self
            .last_announce_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.config.announce_interval_ms);
        if announce_due && !self.links.is_empty() {
            out.extend(self.announce_at(now_ms));
        }
        out
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    fn handle_packet_at(&mut self, link: LinkId, packet: Packet, now_ms: u64, relay: bool, out: &mut Vec<NodeOutput>) {
        self.stats.packets_received += 1;
        if packet.sender_id == self.peer_id {
            self.stats.own_echoes += 1;
            return;
        }
        let id = packet.id();
        let duplicate = self.seen.contains(&id);

        if packet.message_type == MessageType::Announce {
            self.handle_announce(link, &packet, duplicate, now_ms, relay, out);
            return;
        }
        if duplicate {
            self.stats.duplicates += 1;
            return;
        }
        // The id does not cover the signature: a forged copy must not mark
        // the genuine packet as seen
        if !self.signature_acceptable(&packet) {
            self.stats.invalid_signatures += 1;
            warn!(sender = %packet.sender_id, kind = ?packet.message_type, "Dropping packet with bad signature");
            return;
        }
        self.seen.insert(id, ());
        self.peers.touch(&packet.sender_id, now_ms);
        debug!(
            sender = %packet.sender_id,
            kind = ?packet.message_type,
            len = packet.payload.len(),
            ttl = packet.ttl,
            "Packet received"
        );

        match packet.message_type {
            MessageType::Announce => {}
            MessageType::Leave => self.handle_leave(link, &packet, relay, out),
            MessageType::Message => self.handle_public_message(link, &packet, now_ms, relay, out),
            MessageType::FileTransfer => self.handle_file_transfer(link, &packet, now_ms, relay, out),
            MessageType::Fragment => self.handle_fragment(link, &packet, now_ms, relay, out),
            MessageType::RequestSync => self.handle_request_sync(link, &packet, out),
            MessageType::NoiseHandshake | MessageType::NoiseEncrypted => {
                self.handle_directed(link, packet, now_ms, relay, out)
            }
        }
    }

    /// Broadcast packets from a peer whose signing key we know must carry a
    /// valid signature; fragments and directed traffic are unsigned
    fn signature_acceptable(&self, packet: &Packet) -> bool {
        let signed_kind = matches!(
            packet.message_type,
            MessageType::Message | MessageType::Leave | MessageType::FileTransfer
        );
        match (self.peers.get_peer(&packet.sender_id), &packet.signature) {
            (Some(info), Some(_)) => packet.verify(info.signing_key()),
            (Some(_), None) => !signed_kind,
            (None, _) => true,
        }
    }

    fn handle_announce(
        &mut self,
        link: LinkId,
        packet: &Packet,
        duplicate: bool,
        now_ms: u64,
        relay: bool,
        out: &mut Vec<NodeOutput>,
    ) {
        // The first announce on a fresh link names the peer at its other end,
        // even when the same announce already reached us another way
        let binds = self.links.get(&link).is_some_and(|l| l.peer.is_none());
        if duplicate && !binds {
            self.stats.duplicates += 1;
            return;
        }

        let sender = packet.sender_id;
        let announcement = match AnnouncementPayload::decode(&packet.payload) {
            Ok(a) => a,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(sender = %sender, error = %e, "Malformed announcement");
                return;
            }
        };
        let signing_key = match PublicKey::from_bytes(&announcement.signing_public_key) {
            Ok(k) => k,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(sender = %sender, error = %e, "Announcement carries a bad signing key");
                return;
            }
        };
        if !packet.verify(&signing_key) {
            self.stats.invalid_signatures += 1;
            warn!(sender = %sender, "Announcement signature invalid");
            return;
        }
        if !duplicate {
            self.seen.insert(packet.id(), ());
        }
        let fingerprint = Fingerprint::from_static_key(&announcement.noise_public_key);
        let upsert = match self.peers.upsert_announced(sender, &announcement.nickname, fingerprint, signing_key, now_ms) {
            Ok(u) => u,
            Err(e) => {
                self.stats.rejected_announces += 1;
                warn!(sender = %sender, error = %e, "Rejected announcement");
                return;
            }
        };

        if upsert.nickname_changed {
            info!(peer = %sender, nickname = %announcement.nickname, "Peer changed nickname");
        }
        self.topology.update_neighbors_at(sender, &announcement.neighbors, now_ms);
        self.gossip.on_announcement_at(sender, now_ms);

        if binds {
            if let Some(state) = self.links.get_mut(&link) {
                state.peer = Some(sender);
            }
            self.peers.attach_link(&sender, link);
            self.gossip.schedule_initial_sync_at(sender, now_ms);
            self.refresh_own_adjacency(now_ms);
            info!(peer = %sender, nickname = %announcement.nickname, link = %link, "Direct peer bound to link");
            out.push(NodeOutput::Event(MeshEvent::PeerAnnounced {
                peer: sender,
                nickname: announcement.nickname.clone(),
                direct: true,
            }));
            // Our neighbor list grew
            out.extend(self.announce_at(now_ms));
        } else if upsert.first_seen {
            out.push(NodeOutput::Event(MeshEvent::PeerAnnounced {
                peer: sender,
                nickname: announcement.nickname.clone(),
                direct: false,
            }));
        }

        if !duplicate && relay {
            self.relay_broadcast(packet, link, out);
        }
    }

    fn handle_leave(&mut self, link: LinkId, packet: &Packet, relay: bool, out: &mut Vec<NodeOutput>) {
        let sender = packet.sender_id;
        info!(peer = %sender, "Peer left");
        self.sessions.remove_session(&sender);
        self.outbox.remove(&sender);
        self.challenges.remove(&sender);
        self.forget_peer(sender, out);
        if relay {
            self.relay_broadcast(packet, link, out);
        }
    }

    fn handle_public_message(&mut self, link: LinkId, packet: &Packet, now_ms: u64, relay: bool, out: &mut Vec<NodeOutput>) {
        if self.gossip.has_packet(packet) {
            self.stats.duplicates += 1;
            return;
        }
        if self.gossip.is_too_old_at(packet, now_ms) {
            self.stats.too_old += 1;
            return;
        }

        // Only admitted messages reach the cache, and with it sync replies
        let text = String::from_utf8_lossy(&packet.payload).into_owned();
        let content = ContentKey::from_text(&text);
        if !self.flood.admit_at(packet.sender_id, content, now_ms).is_admitted() {
            self.stats.rate_limited += 1;
            return;
        }
        if self.flood.check_duplicate_content_at(content, now_ms) {
            self.stats.content_duplicates += 1;
            debug!(sender = %packet.sender_id, content = %content, "Suppressed near-duplicate message");
            return;
        }
        self.gossip.on_packet_at(packet, now_ms);

        self.stats.delivered += 1;
        out.push(NodeOutput::Event(MeshEvent::PublicMessage {
            sender: packet.sender_id,
            nickname: self.peers.get_peer(&packet.sender_id).map(|p| p.nickname().to_string()),
            text,
            timestamp: packet.timestamp,
        }));
        if relay {
            self.relay_broadcast(packet, link, out);
        }
    }

    fn handle_file_transfer(&mut self, link: LinkId, packet: &Packet, now_ms: u64, relay: bool, out: &mut Vec<NodeOutput>) {
        match self.gossip.on_packet_at(packet, now_ms) {
            Observation::TooOld => self.stats.too_old += 1,
            Observation::Duplicate => self.stats.duplicates += 1,
            _ => {
                self.stats.delivered += 1;
                out.push(NodeOutput::Event(MeshEvent::FileChunk {
                    sender: packet.sender_id,
                    data: packet.payload.clone(),
                }));
                if relay {
                    self.relay_broadcast(packet, link, out);
                }
            }
        }
    }

    fn handle_fragment(&mut self, link: LinkId, packet: &Packet, now_ms: u64, relay: bool, out: &mut Vec<NodeOutput>) {
        let for_us = packet.is_addressed_to(&self.peer_id);
        if !packet.is_broadcast() && !for_us {
            if relay {
                self.forward_directed(link, packet, out);
            }
            return;
        }
        if packet.is_broadcast() {
            self.gossip.on_packet_at(packet, now_ms);
            if relay {
                self.relay_broadcast(packet, link, out);
            }
        }

        match self.reassembler.accept_at(packet, now_ms) {
            Ok(Some(inner)) if inner.message_type == MessageType::Fragment => {
                self.stats.malformed += 1;
                warn!(sender = %packet.sender_id, "Nested fragment dropped");
            }
            // Pieces were relayed already; the whole is not relayed again
            Ok(Some(inner)) => self.handle_packet_at(link, inner, now_ms, false, out),
            Ok(None) => {}
            Err(e) => {
                self.stats.malformed += 1;
                warn!(sender = %packet.sender_id, error = %e, "Bad fragment");
            }
        }
    }

    fn handle_request_sync(&mut self, link: LinkId, packet: &Packet, out: &mut Vec<NodeOutput>) {
        if !packet.is_broadcast() && !packet.is_addressed_to(&self.peer_id) {
            return;
        }
        let request = match RequestSync::decode(&packet.payload) {
            Ok(r) => r,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(sender = %packet.sender_id, error = %e, "Malformed RequestSync");
                return;
            }
        };
        let served = self.gossip.handle_request_sync(&packet.sender_id, &request);
        self.stats.sync_packets_served += served.len() as u64;
        for cached in served {
            // One hop only: the requester must not re-flood what it missed
            let reply = cached.with_ttl(1);
            let frames = self.encode_frames(&reply);
            self.push_frames(link, &frames, out);
        }
    }

    fn handle_directed(&mut self, link: LinkId, packet: Packet, now_ms: u64, relay: bool, out: &mut Vec<NodeOutput>) {
        if packet.is_broadcast() {
            self.stats.malformed += 1;
            warn!(sender = %packet.sender_id, kind = ?packet.message_type, "Directed packet without recipient");
            return;
        }
        if !packet.is_addressed_to(&self.peer_id) {
            if relay {
                self.forward_directed(link, &packet, out);
            }
            return;
        }
        let sender = packet.sender_id;
        match packet.message_type {
            MessageType::NoiseHandshake => match self.sessions.handle_handshake_at(sender, &packet.payload, now_ms) {
                Ok(actions) => self.apply_session_actions(sender, actions, now_ms, out),
                Err(e) => {
                    self.stats.handshake_errors += 1;
                    warn!(peer = %sender, error = %e, "Handshake message rejected");
                }
            },
            MessageType::NoiseEncrypted => self.handle_encrypted(sender, &packet.payload, now_ms, out),
            _ => {}
        }
    }

    fn handle_encrypted(&mut self, peer: PeerId, message: &[u8], now_ms: u64, out: &mut Vec<NodeOutput>) {
        match self.sessions.decrypt(&peer, message) {
            Ok(plaintext) => match AppPayload::decode(&plaintext) {
                Ok(payload) => self.handle_app_payload(peer, payload, now_ms, out),
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(peer = %peer, error = %e, "Undecodable application payload");
                }
            },
            Err(NoiseError::RehandshakeRequired(_)) => {
                self.stats.rehandshakes += 1;
                info!(peer = %peer, "Session invalidated after repeated failures; re-handshaking");
                self.start_handshake(peer, now_ms, out);
            }
            Err(NoiseError::NoSession(_) | NoiseError::NotEstablished(_) | NoiseError::Failed(_)) => {
                self.stats.decrypt_errors += 1;
                // The peer holds a session we lost, most likely across a restart
                if !self.sessions.is_handshaking(&peer) {
                    debug!(peer = %peer, "Encrypted message without a session; initiating handshake");
                    self.start_handshake(peer, now_ms, out);
                }
            }
            Err(e) => {
                self.stats.decrypt_errors += 1;
                warn!(peer = %peer, error = %e, "Decrypt failed");
            }
        }
    }

    fn handle_app_payload(&mut self, peer: PeerId, payload: AppPayload, now_ms: u64, out: &mut Vec<NodeOutput>) {
        self.stats.delivered += 1;
        match payload {
            AppPayload::Chat { id, text } => {
                debug!(peer = %peer, id = %id, len = text.len(), "Private message");
                out.push(NodeOutput::Event(MeshEvent::PrivateMessage { sender: peer, id, text }));
                if let Err(e) = self.send_encrypted(peer, &AppPayload::DeliveryAck { id }, now_ms, out) {
                    warn!(peer = %peer, error = %e, "Cannot acknowledge message");
                }
            }
            AppPayload::DeliveryAck { id } => {
                out.push(NodeOutput::Event(MeshEvent::DeliveryAck { peer, id }));
            }
            AppPayload::ReadReceipt { id } => {
                out.push(NodeOutput::Event(MeshEvent::ReadReceipt { peer, id }));
            }
            AppPayload::VerifyChallenge { nonce } => {
                let response = AppPayload::respond(nonce, self.identity.signing(), &self.identity.fingerprint());
                if let Err(e) = self.send_encrypted(peer, &response, now_ms, out) {
                    warn!(peer = %peer, error = %e, "Cannot answer verification challenge");
                }
            }
            AppPayload::VerifyResponse { nonce, signature } => {
                if self.challenges.get(&peer) != Some(&nonce) {
                    debug!(peer = %peer, "Unsolicited verification response ignored");
                    return;
                }
                self.challenges.remove(&peer);
                let verified = match (self.peers.get_peer(&peer), self.sessions.remote_fingerprint(&peer)) {
                    (Some(info), Some(fp)) => {
                        *info.fingerprint() == fp
                            && AppPayload::verify_response(&nonce, &signature, info.signing_key(), &fp)
                    }
                    _ => false,
                };
                if verified {
                    self.peers.mark_verified(&peer);
                    info!(peer = %peer, "Peer verified");
                } else {
                    warn!(peer = %peer, "Peer failed verification");
                }
                out.push(NodeOutput::Event(MeshEvent::PeerVerified { peer, verified }));
            }
        }
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    fn start_handshake(&mut self, peer: PeerId, now_ms: u64, out: &mut Vec<NodeOutput>) {
        match self.sessions.initiate_at(peer, now_ms) {
            Ok(actions) => self.apply_session_actions(peer, actions, now_ms, out),
            Err(e) => {
                self.stats.handshake_errors += 1;
                warn!(peer = %peer, error = %e, "Cannot start handshake");
            }
        }
    }

    fn apply_session_actions(&mut self, peer: PeerId, actions: Vec<SessionAction>, now_ms: u64, out: &mut Vec<NodeOutput>) {
        for action in actions {
            match action {
                SessionAction::SendHandshake(message) => {
                    let packet = self
                        .packet(MessageType::NoiseHandshake, message, now_ms)
                        .with_recipient(peer);
                    self.mark_seen(&packet);
                    self.route_directed(&packet, None, out);
                }
                SessionAction::Established { fingerprint, .. } => {
                    if fingerprint.short_id() != peer {
                        warn!(peer = %peer, fingerprint = %fingerprint, "Handshake key does not match peer id; dropping session");
                        self.sessions.remove_session(&peer);
                        self.stats.handshake_errors += 1;
                        continue;
                    }
                    out.push(NodeOutput::Event(MeshEvent::SessionEstablished { peer, fingerprint }));
                    self.flush_outbox(peer, now_ms, out);
                }
            }
        }
    }

    fn send_app_at(&mut self, peer: PeerId, payload: AppPayload, now_ms: u64, out: &mut Vec<NodeOutput>) -> MeshResult<()> {
        if peer == self.peer_id {
            return Err(MeshError::SelfAddressed(peer));
        }
        if self.sessions.is_established(&peer) {
            return self.send_encrypted(peer, &payload, now_ms, out);
        }
        let queue = self.outbox.entry(peer).or_default();
        if queue.len() >= self.config.max_outbox_per_peer {
            queue.pop_front();
            self.stats.outbox_dropped += 1;
        }
        queue.push_back(payload);
        if !self.sessions.is_handshaking(&peer) {
            self.start_handshake(peer, now_ms, out);
        }
        Ok(())
    }

    fn flush_outbox(&mut self, peer: PeerId, now_ms: u64, out: &mut Vec<NodeOutput>) {
        let Some(queue) = self.outbox.remove(&peer) else {
            return;
        };
        debug!(peer = %peer, queued = queue.len(), "Flushing queued messages");
        for payload in queue {
            if let Err(e) = self.send_encrypted(peer, &payload, now_ms, out) {
                warn!(peer = %peer, error = %e, "Queued message could not be sent");
            }
        }
    }

    fn send_encrypted(&mut self, peer: PeerId, payload: &AppPayload, now_ms: u64, out: &mut Vec<NodeOutput>) -> MeshResult<()> {
        let ciphertext = self.sessions.encrypt(&peer, &payload.encode())?;
        let packet = self
            .packet(MessageType::NoiseEncrypted, ciphertext, now_ms)
            .with_recipient(peer);
        self.mark_seen(&packet);
        self.route_directed(&packet, None, out);
        Ok(())
    }

    // ========================================================================
    // GOSSIP AND PEERS
    // ========================================================================

    fn send_request_sync(&mut self, to: Option<PeerId>, request: &RequestSync, now_ms: u64, out: &mut Vec<NodeOutput>) {
        let payload = match request.encode() {
            Ok(p) => p,
            Err(e) => {
                self.stats.encode_errors += 1;
                warn!(error = %e, "Cannot encode RequestSync");
                return;
            }
        };
        let packet = self.packet(MessageType::RequestSync, payload, now_ms).with_ttl(1);
        match to {
            Some(peer) => {
                let Some(link) = self.direct_link(&peer) else {
                    debug!(peer = %peer, "Initial sync target no longer linked");
                    return;
                };
                let packet = packet.with_recipient(peer);
                self.mark_seen(&packet);
                let frames = self.encode_frames(&packet);
                self.push_frames(link, &frames, out);
            }
            None => {
                self.mark_seen(&packet);
                self.send_to_links_except(&packet, None, out);
            }
        }
    }

    fn forget_peer(&mut self, peer: PeerId, out: &mut Vec<NodeOutput>) {
        let had_topology = self.topology.remove_peer(&peer);
        self.gossip.remove_peer(&peer);
        let linked = self.peers.get_peer(&peer).and_then(PeerInfo::link).is_some();
        let had_record = !linked && self.peers.remove_peer(&peer).is_some();
        if had_record || had_topology {
            out.push(NodeOutput::Event(MeshEvent::PeerLost { peer }));
        }
    }

    fn refresh_own_adjacency(&mut self, now_ms: u64) {
        let neighbors = self.peers.connected_peers();
        self.topology.update_neighbors_at(self.peer_id, &neighbors, now_ms);
    }

    fn announce_packet(&mut self, now_ms: u64) -> Option<Packet> {
        self.refresh_own_adjacency(now_ms);
        let announcement = AnnouncementPayload {
            nickname: self.config.nickname.clone(),
            noise_public_key: self.identity.noise().public_key(),
            signing_public_key: *self.identity.signing().public_key().as_bytes(),
            neighbors: self.peers.connected_peers(),
        };
        let payload = match announcement.encode() {
            Ok(p) => p,
            Err(e) => {
                self.stats.encode_errors += 1;
                warn!(error = %e, "Cannot encode announcement");
                return None;
            }
        };
        let mut packet = self.packet(MessageType::Announce, payload, now_ms);
        if let Err(e) = packet.sign(self.identity.signing()) {
            self.stats.encode_errors += 1;
            warn!(error = %e, "Cannot sign announcement");
            return None;
        }
        self.mark_seen(&packet);
        self.last_announce_ms = Some(now_ms);
        Some(packet)
    }

    // ========================================================================
    // OUTBOUND PLUMBING
    // ========================================================================

    fn packet(&self, kind: MessageType, payload: Vec<u8>, now_ms: u64) -> Packet {
        Packet::new(kind, self.peer_id, payload)
            .with_timestamp(now_ms)
            .with_ttl(self.config.wire.default_ttl)
    }

    fn mark_seen(&mut self, packet: &Packet) {
        self.seen.insert(packet.id(), ());
    }

    fn direct_link(&self, peer: &PeerId) -> Option<LinkId> {
        self.peers
            .get_peer(peer)
            .and_then(PeerInfo::link)
            .filter(|link| self.links.contains_key(link))
    }

    fn sorted_links(&self) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self.links.keys().copied().collect();
        links.sort();
        links
    }

    /// Encoded frames for `packet`, fragmented to the MTU. Fragment ids are
    /// random, so callers encode once and reuse the frames for every link.
    fn encode_frames(&mut self, packet: &Packet) -> Vec<Vec<u8>> {
        let pieces = match fragment_packet(&self.codec, packet, self.config.wire.mtu) {
            Ok(p) => p,
            Err(e) => {
                self.stats.encode_errors += 1;
                warn!(kind = ?packet.message_type, error = %e, "Cannot frame packet");
                return Vec::new();
            }
        };
        if pieces.len() > 1 {
            debug!(kind = ?packet.message_type, fragments = pieces.len(), "Packet fragmented");
            let gossiped = SyncKind::for_message_type(packet.message_type).is_some();
            for piece in &pieces {
                self.mark_seen(piece);
                if gossiped && packet.is_broadcast() {
                    self.gossip.on_packet_at(piece, packet.timestamp);
                }
            }
        }
        let mut frames = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            match self.codec.encode(piece) {
                Ok(bytes) => frames.push(bytes),
                Err(e) => {
                    self.stats.encode_errors += 1;
                    warn!(error = %e, "Cannot encode frame");
                    return Vec::new();
                }
            }
        }
        frames
    }

    fn push_frames(&mut self, link: LinkId, frames: &[Vec<u8>], out: &mut Vec<NodeOutput>) {
        for bytes in frames {
            self.stats.frames_sent += 1;
            out.push(NodeOutput::Send {
                link,
                bytes: bytes.clone(),
            });
        }
    }

    fn send_to_links_except(&mut self, packet: &Packet, except: Option<LinkId>, out: &mut Vec<NodeOutput>) {
        let frames = self.encode_frames(packet);
        for link in self.sorted_links() {
            if Some(link) != except {
                self.push_frames(link, &frames, out);
            }
        }
    }

    fn relay_broadcast(&mut self, packet: &Packet, from: LinkId, out: &mut Vec<NodeOutput>) {
        if let Some(next) = packet.relayed() {
            self.stats.relayed += 1;
            self.send_to_links_except(&next, Some(from), out);
        }
    }

    fn forward_directed(&mut self, from: LinkId, packet: &Packet, out: &mut Vec<NodeOutput>) {
        if let Some(next) = packet.relayed() {
            self.stats.forwarded += 1;
            self.route_directed(&next, Some(from), out);
        }
    }

    /// Direct link, else first hop of the confirmed route, else flood
    fn route_directed(&mut self, packet: &Packet, from: Option<LinkId>, out: &mut Vec<NodeOutput>) {
        let Some(to) = packet.recipient_id else {
            self.send_to_links_except(packet, from, out);
            return;
        };
        let next_link = match self.route_to(&to) {
            Route::Direct => self.direct_link(&to),
            Route::Via(hops) => hops.first().and_then(|hop| self.direct_link(hop)),
            Route::Unreachable => None,
        };
        match next_link {
            Some(link) if Some(link) != from => {
                let frames = self.encode_frames(packet);
                self.push_frames(link, &frames, out);
            }
            _ => {
                self.stats.flooded += 1;
                debug!(to = %to, kind = ?packet.message_type, "No usable route; flooding");
                self.send_to_links_except(packet, from, out);
            }
        }
    }
}
