// Announcement payload - presence, keys, and direct neighbors
//
// TLV tags: 0x01 nickname (UTF-8), 0x02 Noise static key (32),
// 0x03 Ed25519 signing key (32), 0x04 direct neighbors (n * 8).

use crate::identity::{PeerId, PEER_ID_LEN};
use crate::wire::codec::WireError;
use crate::wire::tlv::{TlvReader, TlvWriter};

const TAG_NICKNAME: u8 = 0x01;
const TAG_NOISE_KEY: u8 = 0x02;
const TAG_SIGNING_KEY: u8 = 0x03;
const TAG_NEIGHBORS: u8 = 0x04;

/// Neighbor lists longer than this are truncated on encode
pub const MAX_ANNOUNCED_NEIGHBORS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnouncementPayload {
    pub nickname: String,
    pub noise_public_key: [u8; 32],
    pub signing_public_key: [u8; 32],
    pub neighbors: Vec<PeerId>,
}

impl AnnouncementPayload {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut neighbors = Vec::with_capacity(self.neighbors.len() * PEER_ID_LEN);
        for peer in self.neighbors.iter().take(MAX_ANNOUNCED_NEIGHBORS) {
            neighbors.extend_from_slice(peer.as_bytes());
        }

        let mut w = TlvWriter::new();
        w.put(TAG_NICKNAME, self.nickname.as_bytes())?
            .put(TAG_NOISE_KEY, &self.noise_public_key)?
            .put(TAG_SIGNING_KEY, &self.signing_public_key)?
            .put(TAG_NEIGHBORS, &neighbors)?;
        Ok(w.finish())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut nickname = None;
        let mut noise_public_key = None;
        let mut signing_public_key = None;
        let mut neighbors = Vec::new();

        for record in TlvReader::new(data) {
            let (tag, value) = record?;
            match tag {
                TAG_NICKNAME => {
                    nickname = Some(String::from_utf8_lossy(value).into_owned());
                }
                TAG_NOISE_KEY => noise_public_key = Some(key32(value, "noise key")?),
                TAG_SIGNING_KEY => signing_public_key = Some(key32(value, "signing key")?),
                TAG_NEIGHBORS => {
                    if value.len() % PEER_ID_LEN != 0 {
                        return Err(WireError::MalformedTlv(
                            "neighbor list is not a whole number of ids".to_string(),
                        ));
                    }
                    neighbors = value
                        .chunks_exact(PEER_ID_LEN)
                        .filter_map(|c| PeerId::from_slice(c).ok())
                        .collect();
                }
                _ => {}
            }
        }

        Ok(Self {
            nickname: nickname.ok_or_else(|| missing("nickname"))?,
            noise_public_key: noise_public_key.ok_or_else(|| missing("noise key"))?,
            signing_public_key: signing_public_key.ok_or_else(|| missing("signing key"))?,
            neighbors,
        })
    }
}

fn key32(value: &[u8], what: &str) -> Result<[u8; 32], WireError> {
    value
        .try_into()
        .map_err(|_| WireError::MalformedTlv(format!("{} must be 32 bytes, got {}", what, value.len())))
}

fn missing(what: &str) -> WireError {
    WireError::MalformedTlv(format!("announcement missing {}", what))
}
