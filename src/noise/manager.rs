// Session Manager - one Noise session per peer
//
// An incoming handshake offer is always accepted, even over an established
// session: the peer may have restarted with no memory of it. The only offer
// that is set aside is the losing half of a simultaneous initiation.

use crate::identity::{Fingerprint, PeerId, StaticKeypair};
use crate::noise::handshake::{Role, MSG1_LEN};
use crate::noise::session::{NoiseError, NoiseSession, SessionAction};
use crate::noise::transport::DEFAULT_REPLAY_WINDOW;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Consecutive authentication failures before the session is dropped
    pub max_decrypt_failures: u32,
    /// Number of recent nonces remembered for replay detection
    pub replay_window: usize,
    /// Handshakes that have not completed within this long are abandoned
    pub handshake_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_decrypt_failures: 3,
            replay_window: DEFAULT_REPLAY_WINDOW,
            handshake_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_decrypt_failures(mut self, max: u32) -> Self {
        self.max_decrypt_failures = max;
        self
    }

    pub fn with_replay_window(mut self, window: usize) -> Self {
        self.replay_window = window;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), NoiseError> {
        if self.max_decrypt_failures == 0 {
            return Err(NoiseError::InvalidConfig("max_decrypt_failures cannot be 0".to_string()));
        }
        if self.replay_window == 0 {
            return Err(NoiseError::InvalidConfig("replay_window cannot be 0".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(NoiseError::InvalidConfig("handshake_timeout_ms cannot be 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub handshakes_initiated: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub sessions_superseded: u64,
    /// Colliding offers answered by repeating our own message 1
    pub offers_resent: u64,
    /// Repeats of the message 1 we are already answering
    pub retransmits_ignored: u64,
    pub decrypt_failures: u64,
    pub replays_rejected: u64,
    pub sessions_invalidated: u64,
    pub handshakes_abandoned: u64,
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct SessionManager {
    local_peer: PeerId,
    local_static: StaticKeypair,
    config: SessionConfig,
    sessions: HashMap<PeerId, NoiseSession>,
    failures: HashMap<PeerId, u32>,
    stats: SessionStats,
}

impl SessionManager {
    pub fn new(local_peer: PeerId, local_static: StaticKeypair, config: SessionConfig) -> Self {
        Self {
            local_peer,
            local_static,
            config,
            sessions: HashMap::new(),
            failures: HashMap::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn local_static_public(&self) -> [u8; 32] {
        self.local_static.public_key()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn session(&self, peer: &PeerId) -> Option<&NoiseSession> {
        self.sessions.get(peer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_established(&self, peer: &PeerId) -> bool {
        self.sessions.get(peer).is_some_and(NoiseSession::is_established)
    }

    pub fn is_handshaking(&self, peer: &PeerId) -> bool {
        self.sessions.get(peer).is_some_and(NoiseSession::is_handshaking)
    }

    pub fn remote_fingerprint(&self, peer: &PeerId) -> Option<Fingerprint> {
        self.sessions.get(peer).and_then(NoiseSession::fingerprint)
    }

    pub fn established_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_established())
            .map(NoiseSession::peer)
            .collect();
        peers.sort();
        peers
    }

    // ========================================================================
    // HANDSHAKE
    // ========================================================================

    /// Start a new handshake as initiator, replacing any session with `peer`
    pub fn initiate_at(&mut self, peer: PeerId, now_ms: u64) -> Result<Vec<SessionAction>, NoiseError> {
        let mut session = NoiseSession::new(peer, Role::Initiator, self.config.replay_window, now_ms);
        let actions = session.start(&self.local_static)?;
        if self.sessions.insert(peer, session).is_some() {
            debug!(peer = %peer, "Replacing existing session with new handshake");
        }
        self.failures.remove(&peer);
        self.stats.handshakes_initiated += 1;
        Ok(actions)
    }

    /// Process a handshake message from `peer`
    pub fn handle_handshake_at(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now_ms: u64,
    ) -> Result<Vec<SessionAction>, NoiseError> {
        let fresh_offer = message.len() == MSG1_LEN;
        let existing = self.sessions.get(&peer);

        if fresh_offer {
            match existing {
                // Both sides initiated, or our message 1 never arrived. The
                // lower id keeps the initiator role and repeats its offer; the
                // other side yields to it on arrival.
                Some(s) if s.awaiting_response() && self.local_peer < peer => {
                    self.stats.offers_resent += 1;
                    debug!(peer = %peer, "Colliding handshake offer; repeating ours");
                    return Ok(s
                        .offer()
                        .map(|m1| vec![SessionAction::SendHandshake(m1.to_vec())])
                        .unwrap_or_default());
                }
                Some(s) if s.role() == Role::Responder && s.offer() == Some(message) => {
                    self.stats.retransmits_ignored += 1;
                    debug!(peer = %peer, "Repeated handshake offer already being answered");
                    return Ok(Vec::new());
                }
                _ => {}
            }
        }
        let continue_existing = existing.is_some_and(|s| s.is_handshaking() && !fresh_offer);

        if !continue_existing && !fresh_offer {
            self.stats.handshakes_failed += 1;
            return Err(NoiseError::InvalidMessage(format!(
                "unexpected {}-byte handshake message with no handshake in progress",
                message.len()
            )));
        }

        if !continue_existing {
            let replaced = self.sessions.insert(
                peer,
                NoiseSession::new(peer, Role::Responder, self.config.replay_window, now_ms),
            );
            if let Some(old) = replaced {
                if old.is_established() {
                    info!(peer = %peer, "Peer re-handshaking; superseding established session");
                }
                self.stats.sessions_superseded += 1;
            }
            self.failures.remove(&peer);
        }

        let Some(session) = self.sessions.get_mut(&peer) else {
            return Err(NoiseError::NoSession(peer));
        };
        match session.on_handshake_message(&self.local_static, message) {
            Ok(actions) => {
                for action in &actions {
                    if let SessionAction::Established { fingerprint, .. } = action {
                        self.stats.handshakes_completed += 1;
                        info!(peer = %peer, fingerprint = %fingerprint, "Session established");
                    }
                }
                Ok(actions)
            }
            Err(e) => {
                self.stats.handshakes_failed += 1;
                Err(e)
            }
        }
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    pub fn encrypt(&mut self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.sessions
            .get_mut(peer)
            .ok_or(NoiseError::NoSession(*peer))?
            .encrypt(plaintext)
    }

    /// Decrypt from `peer`. Repeated authentication failures drop the session
    /// and return [`NoiseError::RehandshakeRequired`].
    pub fn decrypt(&mut self, peer: &PeerId, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or(NoiseError::NoSession(*peer))?;

        match session.decrypt(message) {
            Ok(plaintext) => {
                self.failures.remove(peer);
                Ok(plaintext)
            }
            Err(e) if e.is_replay() => {
                warn!(peer = %peer, error = %e, "Rejected replayed message");
                self.stats.replays_rejected += 1;
                Err(e)
            }
            Err(e) if e.is_authentication_failure() => {
                self.stats.decrypt_failures += 1;
                let count = self.failures.entry(*peer).or_insert(0);
                *count += 1;
                warn!(peer = %peer, failures = *count, "Decrypt authentication failure");
                if *count >= self.config.max_decrypt_failures {
                    self.failures.remove(peer);
                    self.sessions.remove(peer);
                    self.stats.sessions_invalidated += 1;
                    return Err(NoiseError::RehandshakeRequired(*peer));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove_session(&mut self, peer: &PeerId) -> bool {
        self.failures.remove(peer);
        self.sessions.remove(peer).is_some()
    }

    /// Drop handshakes that stalled or failed more than the timeout ago
    pub fn prune_stalled_at(&mut self, now_ms: u64) -> Vec<PeerId> {
        let timeout = self.config.handshake_timeout_ms;
        let mut stalled: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| !s.is_established())
            .filter(|s| now_ms.saturating_sub(s.created_at()) > timeout)
            .map(NoiseSession::peer)
            .collect();
        stalled.sort();
        for peer in &stalled {
            self.sessions.remove(peer);
            self.failures.remove(peer);
            debug!(peer = %peer, "Abandoned stalled handshake");
        }
        self.stats.handshakes_abandoned += stalled.len() as u64;
        stalled
    }
}
