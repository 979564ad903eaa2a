use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of the short, per-connection peer identifier on the wire
pub const PEER_ID_LEN: usize = 8;

/// Width of the stable identity fingerprint
pub const FINGERPRINT_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Invalid identifier length: {0} bytes")]
    InvalidLength(usize),
}

/// Short peer identifier carried in every packet header.
///
/// Names a peer for the lifetime of its current radio session; a restarted
/// peer may come back under a new one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// The all-ones identifier addresses every peer
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_LEN]);

    /// Generate a random identifier for a fresh session
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the short form from a stable fingerprint
    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&fingerprint.0[..PEER_ID_LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let array: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| PeerIdError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| PeerIdError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Stable identity: SHA-256 of the peer's Noise static public key.
///
/// Only known once a handshake with the peer has authenticated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_static_key(static_public: &[u8; 32]) -> Self {
        let digest = Sha256::digest(static_public);
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Short identifier derived from this fingerprint
    pub fn short_id(&self) -> PeerId {
        PeerId::from_fingerprint(self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", hex::encode(&self.0[..8]))
    }
}

impl FromStr for Fingerprint {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| PeerIdError::InvalidHex(e.to_string()))?;
        let array: [u8; FINGERPRINT_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PeerIdError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }
}

/// Either form of a peer identifier, for lookups that accept both
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRef {
    Short(PeerId),
    Stable(Fingerprint),
}

impl From<PeerId> for PeerRef {
    fn from(id: PeerId) -> Self {
        PeerRef::Short(id)
    }
}

impl From<Fingerprint> for PeerRef {
    fn from(fp: Fingerprint) -> Self {
        PeerRef::Stable(fp)
    }
}

impl FromStr for PeerRef {
    type Err = PeerIdError;

    /// 16 hex chars parse as a short id, 64 as a fingerprint
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            16 => s.parse().map(PeerRef::Short),
            64 => s.parse().map(PeerRef::Stable),
            n => Err(PeerIdError::InvalidLength(n / 2)),
        }
    }
}
