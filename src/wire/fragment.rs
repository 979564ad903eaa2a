// Fragmentation - split packets that exceed the link MTU
//
// Fragment payload: fragment_id(8) | index(2, BE) | total(2, BE)
//                   | original_type(1) | data
// The data of all fragments concatenated is the encoded original frame.

use crate::identity::{PeerId, PEER_ID_LEN};
use crate::wire::codec::{PacketCodec, WireError, BASE_HEADER_LEN, MAX_FRAME_LEN};
use crate::wire::packet::{MessageType, Packet};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const FRAGMENT_HEADER_LEN: usize = 8 + 2 + 2 + 1;

/// Smallest MTU that still leaves room for fragment data
pub const MIN_MTU: usize = BASE_HEADER_LEN + PEER_ID_LEN + FRAGMENT_HEADER_LEN + 16;

/// Parsed fragment header plus its data slice
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: [u8; 8],
    pub index: u16,
    pub total: u16,
    pub original_type: u8,
}

impl FragmentHeader {
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if payload.len() < FRAGMENT_HEADER_LEN {
            return Err(WireError::MalformedFragment(format!(
                "payload of {} bytes is shorter than the header",
                payload.len()
            )));
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);
        let original_type = payload[12];

        if total == 0 || index >= total {
            return Err(WireError::MalformedFragment(format!(
                "index {} out of range for total {}",
                index, total
            )));
        }
        Ok((
            Self {
                fragment_id,
                index,
                total,
                original_type,
            },
            &payload[FRAGMENT_HEADER_LEN..],
        ))
    }

    fn write(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + data.len());
        out.extend_from_slice(&self.fragment_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.original_type);
        out.extend_from_slice(data);
        out
    }
}

/// Split `packet` into fragment packets whose encodings fit within `mtu`.
///
/// A packet that already fits is returned unchanged as the only element.
pub fn fragment_packet(
    codec: &PacketCodec,
    packet: &Packet,
    mtu: usize,
) -> Result<Vec<Packet>, WireError> {
    let encoded = codec.encode(packet)?;
    if encoded.len() <= mtu {
        return Ok(vec![packet.clone()]);
    }
    if mtu < MIN_MTU {
        return Err(WireError::MalformedFragment(format!("mtu {} below minimum {}", mtu, MIN_MTU)));
    }

    // Fragment frames carry no signature; compression can only shrink them
    let overhead = BASE_HEADER_LEN
        + if packet.recipient_id.is_some() { PEER_ID_LEN } else { 0 }
        + FRAGMENT_HEADER_LEN;
    let chunk_size = mtu - overhead;
    let total = encoded.len().div_ceil(chunk_size);
    let total = u16::try_from(total).map_err(|_| {
        WireError::MalformedFragment(format!("{} fragments exceed the u16 index space", total))
    })?;

    let mut fragment_id = [0u8; 8];
    rand::thread_rng().fill(&mut fragment_id);

    let fragments = encoded
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| {
            let header = FragmentHeader {
                fragment_id,
                index: index as u16,
                total,
                original_type: packet.message_type.as_u8(),
            };
            Packet {
                version: packet.version,
                message_type: MessageType::Fragment,
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                timestamp: packet.timestamp,
                payload: header.write(data),
                signature: None,
                ttl: packet.ttl,
            }
        })
        .collect();
    Ok(fragments)
}

// ============================================================================
// REASSEMBLY
// ============================================================================

struct FragmentSet {
    total: u16,
    original_type: u8,
    pieces: BTreeMap<u16, Vec<u8>>,
    /// Buffered data bytes, never above MAX_FRAME_LEN
    bytes: usize,
    first_seen: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub expired: u64,
    pub evicted: u64,
    pub rejected: u64,
}

/// Collects fragments per (sender, fragment_id) until a set is complete
pub struct FragmentReassembler {
    codec: PacketCodec,
    sets: HashMap<(PeerId, [u8; 8]), FragmentSet>,
    max_sets: usize,
    timeout_ms: u64,
    stats: ReassemblyStats,
}

impl FragmentReassembler {
    pub fn new(codec: PacketCodec, max_sets: usize, timeout_ms: u64) -> Self {
        Self {
            codec,
            sets: HashMap::new(),
            max_sets: max_sets.max(1),
            timeout_ms,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    /// Feed one fragment packet; returns the original once every piece is in
    pub fn accept_at(&mut self, fragment: &Packet, now_ms: u64) -> Result<Option<Packet>, WireError> {
        let (header, data) = match FragmentHeader::parse(&fragment.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.rejected += 1;
                return Err(e);
            }
        };
        let key = (fragment.sender_id, header.fragment_id);

        // Every piece but the last carries a full chunk, so the original
        // frame is at least (total - 1) chunks long
        let is_last = header.index + 1 == header.total;
        let declared = (header.total as usize - 1).saturating_mul(data.len());
        if !is_last && declared >= MAX_FRAME_LEN {
            self.stats.rejected += 1;
            self.sets.remove(&key);
            return Err(WireError::MalformedFragment(format!(
                "{} fragments of {} bytes exceed the {} byte frame limit",
                header.total,
                data.len(),
                MAX_FRAME_LEN
            )));
        }

        if !self.sets.contains_key(&key) && self.sets.len() >= self.max_sets {
            self.evict_oldest();
        }
        let set = self.sets.entry(key).or_insert_with(|| FragmentSet {
            total: header.total,
            original_type: header.original_type,
            pieces: BTreeMap::new(),
            bytes: 0,
            first_seen: now_ms,
        });
        if set.total != header.total || set.original_type != header.original_type {
            self.stats.rejected += 1;
            return Err(WireError::MalformedFragment(
                "fragment disagrees with earlier pieces of its set".to_string(),
            ));
        }
        if !set.pieces.contains_key(&header.index) {
            if set.bytes + data.len() > MAX_FRAME_LEN {
                self.stats.rejected += 1;
                self.sets.remove(&key);
                return Err(WireError::MalformedFragment(format!(
                    "fragment set would buffer more than {} bytes",
                    MAX_FRAME_LEN
                )));
            }
            set.bytes += data.len();
            set.pieces.insert(header.index, data.to_vec());
        }

        if set.pieces.len() < set.total as usize {
            return Ok(None);
        }

        let Some(set) = self.sets.remove(&key) else {
            return Ok(None);
        };
        let bytes: Vec<u8> = set.pieces.into_values().flatten().collect();
        let packet = self.codec.decode(&bytes)?;
        if packet.message_type.as_u8() != set.original_type {
            self.stats.rejected += 1;
            return Err(WireError::MalformedFragment(
                "reassembled type does not match declared type".to_string(),
            ));
        }
        self.stats.completed += 1;
        debug!(sender = %fragment.sender_id, total = set.total, "Fragment set reassembled");
        Ok(Some(packet))
    }

    /// Drop incomplete sets older than the timeout
    pub fn prune_at(&mut self, now_ms: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.sets.len();
        self.sets
            .retain(|_, set| now_ms.saturating_sub(set.first_seen) <= timeout);
        let expired = before - self.sets.len();
        self.stats.expired += expired as u64;
        expired
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.first_seen)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            self.sets.remove(&key);
            self.stats.evicted += 1;
        }
    }
}
