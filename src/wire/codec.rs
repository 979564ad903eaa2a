// Packet Codec - bit-exact binary frame layout
//
//   type(1) | flags(1) | sender(8) | [recipient(8)] | timestamp(8, BE)
//   | payload_len(2, BE) | version(1) | ttl(1) | payload | [signature(64)]
//
// Flags: bit 0 compressed payload, bit 1 recipient present, bit 2 signature
// present. Remaining bits are reserved and must be zero.

use crate::identity::{PeerId, Signature, PEER_ID_LEN, SIGNATURE_LEN};
use crate::wire::compression;
use crate::wire::packet::{MessageType, Packet, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_HAS_RECIPIENT: u8 = 0x02;
pub const FLAG_HAS_SIGNATURE: u8 = 0x04;
const RESERVED_FLAGS: u8 = !(FLAG_COMPRESSED | FLAG_HAS_RECIPIENT | FLAG_HAS_SIGNATURE);

/// Header size without the optional recipient
pub const BASE_HEADER_LEN: usize = 1 + 1 + PEER_ID_LEN + 8 + 2 + 1 + 1;

/// Hard cap on a payload, before or after compression
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest possible frame
pub const MAX_FRAME_LEN: usize = BASE_HEADER_LEN + PEER_ID_LEN + MAX_PAYLOAD_SIZE + SIGNATURE_LEN;

/// Payloads at least this large are offered to the compressor
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 100;

/// Wire-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown packet type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("Reserved flag bits set: 0x{0:02x}")]
    ReservedFlags(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Frame truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("Trailing bytes after frame: {0}")]
    TrailingBytes(usize),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid signature trailer")]
    InvalidSignature,

    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("Malformed TLV: {0}")]
    MalformedTlv(String),
}

/// Packet encoder/decoder
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PacketCodec {
    compression_threshold: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads shorter than this are never compressed; `usize::MAX` disables it
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    // ========================================================================
    // ENCODE
    // ========================================================================

    /// Encode a packet into one self-delimiting frame
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, WireError> {
        Self::encode_with(packet, self.compression_threshold, true)
    }

    /// Canonical bytes covered by a packet signature
    pub fn signing_bytes(packet: &Packet) -> Result<Vec<u8>, WireError> {
        let mut canonical = packet.clone();
        canonical.ttl = 0;
        canonical.signature = None;
        Self::encode_with(&canonical, usize::MAX, false)
    }

    fn encode_with(
        packet: &Packet,
        threshold: usize,
        include_signature: bool,
    ) -> Result<Vec<u8>, WireError> {
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                size: packet.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut flags = 0u8;
        let compressed = if packet.payload.len() >= threshold {
            compression::compress(&packet.payload)
        } else {
            None
        };
        let payload: &[u8] = match &compressed {
            Some(bytes) => {
                flags |= FLAG_COMPRESSED;
                bytes
            }
            None => &packet.payload,
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let recipient = packet.recipient_id;
        if recipient.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        let signature = packet.signature.as_ref().filter(|_| include_signature);
        if signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }

        let mut out = Vec::with_capacity(
            BASE_HEADER_LEN + PEER_ID_LEN + payload.len() + SIGNATURE_LEN,
        );
        out.push(packet.message_type.as_u8());
        out.push(flags);
        out.extend_from_slice(packet.sender_id.as_bytes());
        if let Some(recipient) = recipient {
            out.extend_from_slice(recipient.as_bytes());
        }
        out.extend_from_slice(&packet.timestamp.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.push(packet.version);
        out.push(packet.ttl);
        out.extend_from_slice(payload);
        if let Some(signature) = signature {
            out.extend_from_slice(signature.as_bytes());
        }
        Ok(out)
    }

    // ========================================================================
    // DECODE
    // ========================================================================

    /// Inspect the start of `buf` and report the full frame length.
    ///
    /// `Ok(None)` means more bytes are needed to decide. An error means `buf`
    /// cannot start a valid frame.
    pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
        let Some(&type_byte) = buf.first() else {
            return Ok(None);
        };
        if MessageType::from_u8(type_byte).is_none() {
            return Err(WireError::UnknownType(type_byte));
        }
        let Some(&flags) = buf.get(1) else {
            return Ok(None);
        };
        if flags & RESERVED_FLAGS != 0 {
            return Err(WireError::ReservedFlags(flags));
        }

        let header_len = header_len(flags);
        if buf.len() < header_len {
            return Ok(None);
        }

        let len_offset = header_len - 4;
        let payload_len = u16::from_be_bytes([buf[len_offset], buf[len_offset + 1]]) as usize;
        let version = buf[len_offset + 2];
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let signature_len = if flags & FLAG_HAS_SIGNATURE != 0 {
            SIGNATURE_LEN
        } else {
            0
        };
        Ok(Some(header_len + payload_len + signature_len))
    }

    /// Decode exactly one frame occupying all of `bytes`
    pub fn decode(&self, bytes: &[u8]) -> Result<Packet, WireError> {
        let total = Self::frame_len(bytes)?.ok_or(WireError::Truncated {
            needed: BASE_HEADER_LEN,
            have: bytes.len(),
        })?;
        if bytes.len() < total {
            return Err(WireError::Truncated {
                needed: total,
                have: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(WireError::TrailingBytes(bytes.len() - total));
        }

        let message_type =
            MessageType::from_u8(bytes[0]).ok_or(WireError::UnknownType(bytes[0]))?;
        let flags = bytes[1];
        let mut cursor = 2;

        let sender_id = read_peer_id(bytes, &mut cursor)?;
        let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
            Some(read_peer_id(bytes, &mut cursor)?)
        } else {
            None
        };

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[cursor..cursor + 8]);
        cursor += 8;
        let payload_len = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
        cursor += 2;
        let version = bytes[cursor];
        let ttl = bytes[cursor + 1];
        cursor += 2;

        let raw_payload = &bytes[cursor..cursor + payload_len];
        cursor += payload_len;
        let payload = if flags & FLAG_COMPRESSED != 0 {
            compression::decompress(raw_payload)?
        } else {
            raw_payload.to_vec()
        };

        let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
            let sig = Signature::from_bytes(&bytes[cursor..cursor + SIGNATURE_LEN])
                .map_err(|_| WireError::InvalidSignature)?;
            Some(sig)
        } else {
            None
        };

        Ok(Packet {
            version,
            message_type,
            sender_id,
            recipient_id,
            timestamp: u64::from_be_bytes(timestamp),
            payload,
            signature,
            ttl,
        })
    }
}

fn header_len(flags: u8) -> usize {
    if flags & FLAG_HAS_RECIPIENT != 0 {
        BASE_HEADER_LEN + PEER_ID_LEN
    } else {
        BASE_HEADER_LEN
    }
}

fn read_peer_id(bytes: &[u8], cursor: &mut usize) -> Result<PeerId, WireError> {
    let end = *cursor + PEER_ID_LEN;
    let slice = bytes.get(*cursor..end).ok_or(WireError::Truncated {
        needed: end,
        have: bytes.len(),
    })?;
    *cursor = end;
    PeerId::from_slice(slice).map_err(|_| WireError::Truncated {
        needed: end,
        have: bytes.len(),
    })
}
