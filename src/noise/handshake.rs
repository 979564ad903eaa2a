// XX Handshake State
//
//   -> e
//   <- e, ee, s, es
//   -> s, se
//
// Both parties hold a long-term X25519 static key and learn the other's only
// after the first shared secret exists. Split happens once message 3 is done.

use crate::identity::StaticKeypair;
use crate::noise::symmetric::{SymmetricState, DH_LEN, TAG_LEN};
use crate::noise::transport::TransportCipher;
use crate::noise::NoiseError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Message 1 is a bare ephemeral key when it carries no payload
pub const MSG1_LEN: usize = DH_LEN;
pub const MSG2_MIN_LEN: usize = DH_LEN + DH_LEN + TAG_LEN + TAG_LEN;
pub const MSG3_MIN_LEN: usize = DH_LEN + TAG_LEN + TAG_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// In-progress XX handshake for one side
pub struct HandshakeState {
    role: Role,
    symmetric: SymmetricState,
    local_static: StaticSecret,
    local_static_public: [u8; 32],
    local_ephemeral: Option<StaticSecret>,
    remote_static: Option<[u8; 32]>,
    remote_ephemeral: Option<[u8; 32]>,
    /// Index of the next message in the pattern (0..=3)
    step: u8,
}

impl std::fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl HandshakeState {
    pub fn new(role: Role, local: &StaticKeypair, prologue: &[u8]) -> Self {
        Self {
            role,
            symmetric: SymmetricState::new(prologue),
            local_static: local.secret().clone(),
            local_static_public: local.public_key(),
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            step: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn step(&self) -> u8 {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step >= 3
    }

    /// True when the next message in the pattern is ours to write
    pub fn is_my_turn(&self) -> bool {
        match self.role {
            Role::Initiator => self.step == 0 || self.step == 2,
            Role::Responder => self.step == 1,
        }
    }

    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    pub fn handshake_hash(&self) -> [u8; 32] {
        self.symmetric.handshake_hash()
    }

    // ========================================================================
    // WRITE
    // ========================================================================

    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.is_complete() || !self.is_my_turn() {
            return Err(NoiseError::InvalidState(format!(
                "{:?} cannot write handshake message {}",
                self.role,
                self.step + 1
            )));
        }

        let mut out = Vec::with_capacity(MSG2_MIN_LEN + payload.len());
        match self.step {
            0 => {
                self.write_ephemeral(&mut out);
            }
            1 => {
                self.write_ephemeral(&mut out);
                let re = self.require_remote_ephemeral()?;
                let e = self.require_local_ephemeral()?.clone();
                self.symmetric.mix_dh(&e, &re)?;
                self.write_static(&mut out)?;
                let s = self.local_static.clone();
                self.symmetric.mix_dh(&s, &re)?;
            }
            _ => {
                self.write_static(&mut out)?;
                let re = self.require_remote_ephemeral()?;
                let s = self.local_static.clone();
                self.symmetric.mix_dh(&s, &re)?;
            }
        }
        out.extend_from_slice(&self.symmetric.encrypt_and_hash(payload)?);
        self.step += 1;
        Ok(out)
    }

    fn write_ephemeral(&mut self, out: &mut Vec<u8>) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        self.symmetric.mix_hash(&public);
        out.extend_from_slice(&public);
        self.local_ephemeral = Some(secret);
    }

    fn write_static(&mut self, out: &mut Vec<u8>) -> Result<(), NoiseError> {
        let public = self.local_static_public;
        out.extend_from_slice(&self.symmetric.encrypt_and_hash(&public)?);
        Ok(())
    }

    // ========================================================================
    // READ
    // ========================================================================

    /// Process the peer's next message and return its (decrypted) payload
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.is_complete() || self.is_my_turn() {
            return Err(NoiseError::InvalidState(format!(
                "{:?} cannot read handshake message {}",
                self.role,
                self.step + 1
            )));
        }

        let rest = match self.step {
            0 => self.read_ephemeral(message)?,
            1 => {
                let rest = self.read_ephemeral(message)?;
                let re = self.require_remote_ephemeral()?;
                let e = self.require_local_ephemeral()?.clone();
                self.symmetric.mix_dh(&e, &re)?;
                let rest = self.read_static(rest)?;
                let rs = self.require_remote_static()?;
                self.symmetric.mix_dh(&e, &rs)?;
                rest
            }
            _ => {
                let rest = self.read_static(message)?;
                let rs = self.require_remote_static()?;
                let e = self.require_local_ephemeral()?.clone();
                self.symmetric.mix_dh(&e, &rs)?;
                rest
            }
        };
        if self.symmetric.has_key() && rest.len() < TAG_LEN {
            return Err(NoiseError::InvalidMessage("payload shorter than tag".to_string()));
        }
        let payload = self.symmetric.decrypt_and_hash(rest)?;
        self.step += 1;
        Ok(payload)
    }

    fn read_ephemeral<'a>(&mut self, message: &'a [u8]) -> Result<&'a [u8], NoiseError> {
        if message.len() < DH_LEN {
            return Err(NoiseError::InvalidMessage(format!(
                "expected ephemeral key, got {} bytes",
                message.len()
            )));
        }
        let mut re = [0u8; DH_LEN];
        re.copy_from_slice(&message[..DH_LEN]);
        self.symmetric.mix_hash(&re);
        self.remote_ephemeral = Some(re);
        Ok(&message[DH_LEN..])
    }

    fn read_static<'a>(&mut self, message: &'a [u8]) -> Result<&'a [u8], NoiseError> {
        let len = DH_LEN + TAG_LEN;
        if message.len() < len {
            return Err(NoiseError::InvalidMessage(format!(
                "expected encrypted static key, got {} bytes",
                message.len()
            )));
        }
        let plain = self.symmetric.decrypt_and_hash(&message[..len])?;
        let rs: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| NoiseError::InvalidMessage("static key length".to_string()))?;
        self.remote_static = Some(rs);
        Ok(&message[len..])
    }

    // ========================================================================
    // SPLIT
    // ========================================================================

    /// Consume the finished handshake into per-direction transport ciphers
    pub fn into_transport(self, replay_window: usize) -> Result<(TransportCipher, [u8; 32]), NoiseError> {
        if !self.is_complete() {
            return Err(NoiseError::InvalidState("handshake not complete".to_string()));
        }
        let remote_static = self.require_remote_static()?;
        let (k1, k2) = self.symmetric.split();
        let cipher = match self.role {
            Role::Initiator => TransportCipher::new(&k1, &k2, replay_window),
            Role::Responder => TransportCipher::new(&k2, &k1, replay_window),
        };
        Ok((cipher, remote_static))
    }

    fn require_local_ephemeral(&self) -> Result<&StaticSecret, NoiseError> {
        self.local_ephemeral
            .as_ref()
            .ok_or_else(|| NoiseError::InvalidState("missing local ephemeral".to_string()))
    }

    fn require_remote_ephemeral(&self) -> Result<[u8; 32], NoiseError> {
        self.remote_ephemeral
            .ok_or_else(|| NoiseError::InvalidState("missing remote ephemeral".to_string()))
    }

    fn require_remote_static(&self) -> Result<[u8; 32], NoiseError> {
        self.remote_static
            .ok_or_else(|| NoiseError::InvalidState("missing remote static".to_string()))
    }
}
