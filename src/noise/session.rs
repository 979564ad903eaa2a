// Noise Session - per-peer state machine
//
// Uninitialized -> Handshaking -> Established, with Failed as a terminal
// state. Each transition consumes the old state and returns the new one plus
// the actions the caller must carry out.

use crate::identity::{Fingerprint, PeerId, StaticKeypair};
use crate::noise::handshake::{HandshakeState, Role};
use crate::noise::transport::TransportCipher;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from the session engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoiseError {
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Malformed handshake or transport message: {0}")]
    InvalidMessage(String),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Authentication failed")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,

    #[error("Replayed nonce {0}")]
    Replay(u64),

    #[error("Nonce {nonce} is outside the replay window (highest {highest})")]
    NonceTooOld { nonce: u64, highest: u64 },

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("No session for peer {0}")]
    NoSession(PeerId),

    #[error("Session with {0} is not established")]
    NotEstablished(PeerId),

    #[error("Session failed: {0}")]
    Failed(String),

    #[error("Too many decrypt failures from {0}; session dropped")]
    RehandshakeRequired(PeerId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NoiseError {
    /// True for failures that count towards re-handshake
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::Authentication | Self::InvalidMessage(_))
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay(_) | Self::NonceTooOld { .. })
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Keys and counters for an authenticated session
#[derive(Debug)]
pub struct Established {
    pub cipher: TransportCipher,
    pub remote_static: [u8; 32],
    pub fingerprint: Fingerprint,
    pub handshake_hash: [u8; 32],
}

#[derive(Debug)]
pub enum SessionState {
    Uninitialized,
    Handshaking(Box<HandshakeState>),
    Established(Box<Established>),
    Failed(String),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Handshaking(_) => "handshaking",
            Self::Established(_) => "established",
            Self::Failed(_) => "failed",
        }
    }
}

/// What a transition asks the caller to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this handshake message to the peer
    SendHandshake(Vec<u8>),
    /// The session just became established
    Established {
        remote_static: [u8; 32],
        fingerprint: Fingerprint,
    },
}

/// One session with one peer
#[derive(Debug)]
pub struct NoiseSession {
    peer: PeerId,
    role: Role,
    state: SessionState,
    created_at: u64,
    replay_window: usize,
    /// Message 1 of the current handshake, sent or answered
    offer: Option<Vec<u8>>,
}

impl NoiseSession {
    pub fn new(peer: PeerId, role: Role, replay_window: usize, now_ms: u64) -> Self {
        Self {
            peer,
            role,
            state: SessionState::Uninitialized,
            created_at: now_ms,
            replay_window,
            offer: None,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established(_))
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, SessionState::Handshaking(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SessionState::Failed(_))
    }

    /// Initiator in the middle of a handshake, waiting for message 2
    pub fn awaiting_response(&self) -> bool {
        match &self.state {
            SessionState::Handshaking(hs) => hs.role() == Role::Initiator && hs.step() == 1,
            _ => false,
        }
    }

    /// Message 1 of the handshake in progress
    pub fn offer(&self) -> Option<&[u8]> {
        match self.state {
            SessionState::Handshaking(_) => self.offer.as_deref(),
            _ => None,
        }
    }

    pub fn remote_static(&self) -> Option<[u8; 32]> {
        match &self.state {
            SessionState::Established(est) => Some(est.remote_static),
            SessionState::Handshaking(hs) => hs.remote_static(),
            _ => None,
        }
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match &self.state {
            SessionState::Established(est) => Some(est.fingerprint),
            _ => None,
        }
    }

    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        match &self.state {
            SessionState::Established(est) => Some(est.handshake_hash),
            _ => None,
        }
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Initiator: Uninitialized -> Handshaking, emitting message 1
    pub fn start(&mut self, local: &StaticKeypair) -> Result<Vec<SessionAction>, NoiseError> {
        if self.role != Role::Initiator {
            return Err(NoiseError::InvalidState("only an initiator starts a handshake".to_string()));
        }
        let state = std::mem::replace(&mut self.state, SessionState::Uninitialized);
        let result = match state {
            SessionState::Uninitialized => {
                let mut hs = HandshakeState::new(Role::Initiator, local, &[]);
                hs.write_message(&[]).map(|m1| {
                    self.offer = Some(m1.clone());
                    (SessionState::Handshaking(Box::new(hs)), vec![SessionAction::SendHandshake(m1)])
                })
            }
            other => {
                let name = other.name();
                self.state = other;
                return Err(NoiseError::InvalidState(format!("cannot start from {}", name)));
            }
        };
        self.apply(result)
    }

    /// Feed one handshake message from the peer
    pub fn on_handshake_message(
        &mut self,
        local: &StaticKeypair,
        message: &[u8],
    ) -> Result<Vec<SessionAction>, NoiseError> {
        let state = std::mem::replace(&mut self.state, SessionState::Uninitialized);
        let result = match state {
            SessionState::Uninitialized if self.role == Role::Responder => {
                let mut hs = HandshakeState::new(Role::Responder, local, &[]);
                self.offer = Some(message.to_vec());
                hs.read_message(message)
                    .and_then(|_| hs.write_message(&[]))
                    .map(|m2| (SessionState::Handshaking(Box::new(hs)), vec![SessionAction::SendHandshake(m2)]))
            }
            SessionState::Handshaking(mut hs) => {
                let read = hs.read_message(message);
                match read {
                    Err(e) => Err(e),
                    Ok(_) if hs.is_complete() => self.finish(*hs, Vec::new()),
                    Ok(_) => match hs.write_message(&[]) {
                        Err(e) => Err(e),
                        Ok(m3) if hs.is_complete() => {
                            self.finish(*hs, vec![SessionAction::SendHandshake(m3)])
                        }
                        Ok(_) => Err(NoiseError::InvalidState("handshake did not complete".to_string())),
                    },
                }
            }
            other => {
                let name = other.name();
                self.state = other;
                return Err(NoiseError::InvalidState(format!(
                    "{:?} cannot accept a handshake message while {}",
                    self.role, name
                )));
            }
        };
        self.apply(result)
    }

    fn finish(
        &self,
        hs: HandshakeState,
        mut actions: Vec<SessionAction>,
    ) -> Result<(SessionState, Vec<SessionAction>), NoiseError> {
        let handshake_hash = hs.handshake_hash();
        let (cipher, remote_static) = hs.into_transport(self.replay_window)?;
        let fingerprint = Fingerprint::from_static_key(&remote_static);
        actions.push(SessionAction::Established {
            remote_static,
            fingerprint,
        });
        Ok((
            SessionState::Established(Box::new(Established {
                cipher,
                remote_static,
                fingerprint,
                handshake_hash,
            })),
            actions,
        ))
    }

    fn apply(
        &mut self,
        result: Result<(SessionState, Vec<SessionAction>), NoiseError>,
    ) -> Result<Vec<SessionAction>, NoiseError> {
        match result {
            Ok((state, actions)) => {
                debug!(peer = %self.peer, state = state.name(), "Session transition");
                self.state = state;
                Ok(actions)
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Handshake failed");
                self.state = SessionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        match &mut self.state {
            SessionState::Established(est) => est.cipher.encrypt(plaintext),
            SessionState::Failed(reason) => Err(NoiseError::Failed(reason.clone())),
            _ => Err(NoiseError::NotEstablished(self.peer)),
        }
    }

    /// Authentication failures leave the session usable; the manager decides
    /// when repeated failures warrant a new handshake
    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        match &mut self.state {
            SessionState::Established(est) => est.cipher.decrypt(message),
            SessionState::Failed(reason) => Err(NoiseError::Failed(reason.clone())),
            _ => Err(NoiseError::NotEstablished(self.peer)),
        }
    }
}
