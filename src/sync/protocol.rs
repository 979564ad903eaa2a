// Protocol - RequestSync payload and content-type selection
//
// RequestSync TLV:
//   0x01 version (1)
//   0x02 marker (8, BE) - monotonic per requester
//   0x03 continuation (n * 8) - id prefixes the requester already holds
//   0x04 types (1) - bitmask of requested content types

use crate::wire::tlv::{TlvReader, TlvWriter};
use crate::wire::{MessageType, PacketId, WireError};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub const SYNC_PROTOCOL_VERSION: u8 = 1;

const TAG_VERSION: u8 = 0x01;
const TAG_MARKER: u8 = 0x02;
const TAG_CONTINUATION: u8 = 0x03;
const TAG_TYPES: u8 = 0x04;

const ID_PREFIX_LEN: usize = 8;

/// Sync-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Malformed RequestSync: {0}")]
    Malformed(String),

    #[error("Unsupported sync version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ============================================================================
// CONTENT TYPES
// ============================================================================

/// The three gossip-synchronized content types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKind {
    Messages,
    Fragments,
    FileTransfers,
}

impl SyncKind {
    pub const ALL: [SyncKind; 3] = [Self::Messages, Self::Fragments, Self::FileTransfers];

    pub fn flag(self) -> SyncTypeFlags {
        match self {
            Self::Messages => SyncTypeFlags::MESSAGES,
            Self::Fragments => SyncTypeFlags::FRAGMENTS,
            Self::FileTransfers => SyncTypeFlags::FILE_TRANSFERS,
        }
    }

    pub fn for_message_type(message_type: MessageType) -> Option<Self> {
        match message_type {
            MessageType::Message => Some(Self::Messages),
            MessageType::Fragment => Some(Self::Fragments),
            MessageType::FileTransfer => Some(Self::FileTransfers),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Messages => 0,
            Self::Fragments => 1,
            Self::FileTransfers => 2,
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Messages => "messages",
            Self::Fragments => "fragments",
            Self::FileTransfers => "file-transfers",
        };
        f.write_str(name)
    }
}

/// Bitmask over [`SyncKind`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncTypeFlags(u8);

impl SyncTypeFlags {
    pub const MESSAGES: Self = Self(0x01);
    pub const FRAGMENTS: Self = Self(0x02);
    pub const FILE_TRANSFERS: Self = Self(0x04);
    const KNOWN: u8 = 0x07;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(Self::KNOWN)
    }

    /// Unknown bits are dropped so newer peers can ask for more
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: SyncKind) -> bool {
        self.0 & kind.flag().0 != 0
    }

    pub fn with(self, kind: SyncKind) -> Self {
        Self(self.0 | kind.flag().0)
    }

    pub fn kinds(self) -> impl Iterator<Item = SyncKind> {
        SyncKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl fmt::Debug for SyncTypeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}

// ============================================================================
// REQUEST SYNC
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestSync {
    pub version: u8,
    pub marker: u64,
    /// 8-byte [`PacketId`] prefixes the requester already has
    pub known: Vec<[u8; 8]>,
    pub types: SyncTypeFlags,
}

impl RequestSync {
    pub fn new(marker: u64, types: SyncTypeFlags) -> Self {
        Self {
            version: SYNC_PROTOCOL_VERSION,
            marker,
            known: Vec::new(),
            types,
        }
    }

    pub fn with_known<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = PacketId>,
    {
        self.known = ids.into_iter().map(|id| id.prefix()).collect();
        self
    }

    pub fn known_set(&self) -> HashSet<[u8; 8]> {
        self.known.iter().copied().collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let continuation: Vec<u8> = self.known.iter().flatten().copied().collect();
        let mut w = TlvWriter::new();
        w.put(TAG_VERSION, &[self.version])?
            .put(TAG_MARKER, &self.marker.to_be_bytes())?
            .put(TAG_CONTINUATION, &continuation)?
            .put(TAG_TYPES, &[self.types.bits()])?;
        Ok(w.finish())
    }

    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        let mut version = None;
        let mut marker = None;
        let mut known = Vec::new();
        let mut types = None;

        for record in TlvReader::new(data) {
            let (tag, value) = record?;
            match tag {
                TAG_VERSION => version = value.first().copied(),
                TAG_MARKER => {
                    let bytes: [u8; 8] = value
                        .try_into()
                        .map_err(|_| SyncError::Malformed("marker must be 8 bytes".to_string()))?;
                    marker = Some(u64::from_be_bytes(bytes));
                }
                TAG_CONTINUATION => {
                    if value.len() % ID_PREFIX_LEN != 0 {
                        return Err(SyncError::Malformed(
                            "continuation is not a whole number of id prefixes".to_string(),
                        ));
                    }
                    known = value
                        .chunks_exact(ID_PREFIX_LEN)
                        .filter_map(|c| <[u8; 8]>::try_from(c).ok())
                        .collect();
                }
                TAG_TYPES => types = value.first().map(|b| SyncTypeFlags::from_bits(*b)),
                _ => {}
            }
        }

        let version = version.ok_or_else(|| SyncError::Malformed("missing version".to_string()))?;
        if version != SYNC_PROTOCOL_VERSION {
            return Err(SyncError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            marker: marker.ok_or_else(|| SyncError::Malformed("missing marker".to_string()))?,
            known,
            types: types.ok_or_else(|| SyncError::Malformed("missing types".to_string()))?,
        })
    }
}
