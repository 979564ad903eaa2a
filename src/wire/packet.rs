// Packet - the unit every layer above the wire exchanges
//
// Identity for deduplication is derived from content, not a random id, so
// identical retransmissions from the same sender collapse to one PacketId.

use crate::identity::{Keypair, PeerId, PublicKey, SignContext, Signature, Signer};
use crate::wire::codec::{PacketCodec, WireError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Wire protocol version written into every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Default hop budget for locally originated packets
pub const DEFAULT_TTL: u8 = 7;

/// Packet types understood by the core
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Presence: nickname, keys, direct neighbors
    Announce = 0x01,
    /// Public broadcast chat message
    Message = 0x02,
    /// Graceful departure
    Leave = 0x03,
    /// One step of a Noise XX handshake
    NoiseHandshake = 0x10,
    /// Transport-encrypted application payload
    NoiseEncrypted = 0x11,
    /// Piece of a packet too large for one transport write
    Fragment = 0x20,
    /// Gossip anti-entropy request
    RequestSync = 0x21,
    /// Chunk of a broadcast file transfer
    FileTransfer = 0x22,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Announce),
            0x02 => Some(Self::Message),
            0x03 => Some(Self::Leave),
            0x10 => Some(Self::NoiseHandshake),
            0x11 => Some(Self::NoiseEncrypted),
            0x20 => Some(Self::Fragment),
            0x21 => Some(Self::RequestSync),
            0x22 => Some(Self::FileTransfer),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Types whose payload only makes sense to a single recipient
    pub fn is_directed(self) -> bool {
        matches!(self, Self::NoiseHandshake | Self::NoiseEncrypted)
    }
}

/// Content-derived packet identity: truncated SHA-256 over
/// (type, sender, timestamp, payload)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketId([u8; 16]);

impl PacketId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Leading 8 bytes, used when advertising known ids in RequestSync
    pub fn prefix(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[..8]);
        out
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({})", hex::encode(&self.0[..8]))
    }
}

/// A decoded mesh packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub message_type: MessageType,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    /// Milliseconds since the Unix epoch at origin
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub signature: Option<Signature>,
    pub ttl: u8,
}

impl Packet {
    /// Create a broadcast packet stamped with the current time
    pub fn new(message_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            sender_id,
            recipient_id: None,
            timestamp: crate::now_millis(),
            payload,
            signature: None,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// True when no specific recipient is named
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.map_or(true, |r| r.is_broadcast())
    }

    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.recipient_id.as_ref() == Some(peer)
    }

    pub fn id(&self) -> PacketId {
        let mut hasher = Sha256::new();
        hasher.update([self.message_type.as_u8()]);
        hasher.update(self.sender_id.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(&self.payload);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        PacketId(bytes)
    }

    /// Sign the canonical encoding (TTL zeroed, no signature, uncompressed)
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), WireError> {
        let bytes = PacketCodec::signing_bytes(self)?;
        self.signature = Some(Signer::sign(keypair, SignContext::Packet, &bytes));
        Ok(())
    }

    /// Verify the signature trailer; unsigned packets never verify
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        match PacketCodec::signing_bytes(self) {
            Ok(bytes) => Signer::verify(public_key, SignContext::Packet, &bytes, signature),
            Err(_) => false,
        }
    }

    /// Copy for relaying with one hop spent, or None when the budget is gone
    pub fn relayed(&self) -> Option<Packet> {
        if self.ttl <= 1 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Some(next)
    }
}
