// Mesh configuration - one struct per layer, aggregated by MeshConfig

use crate::dedup::FloodConfig;
use crate::mesh::error::{MeshError, MeshResult};
use crate::noise::SessionConfig;
use crate::sync::GossipConfig;
use crate::topology::TopologyConfig;
use crate::wire::{PacketCodec, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_TTL, MIN_MTU};
use serde::{Deserialize, Serialize};

// ============================================================================
// WIRE CONFIG
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConfig {
    /// Largest frame handed to the transport in one write
    pub mtu: usize,
    /// Payloads at least this long are offered to the compressor
    pub compression_threshold: usize,
    pub fragment_timeout_ms: u64,
    pub max_pending_fragment_sets: usize,
    /// Hop budget stamped on packets we originate
    pub default_ttl: u8,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            mtu: 512,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            fragment_timeout_ms: 30_000,
            max_pending_fragment_sets: 128,
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl WireConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_fragment_timeout_ms(mut self, ms: u64) -> Self {
        self.fragment_timeout_ms = ms;
        self
    }

    pub fn with_max_pending_fragment_sets(mut self, max: usize) -> Self {
        self.max_pending_fragment_sets = max;
        self
    }

    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new().with_compression_threshold(self.compression_threshold)
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.mtu < MIN_MTU {
            return Err(MeshError::Config(format!("mtu {} below minimum {}", self.mtu, MIN_MTU)));
        }
        if self.default_ttl == 0 {
            return Err(MeshError::Config("default_ttl cannot be 0".to_string()));
        }
        if self.max_pending_fragment_sets == 0 {
            return Err(MeshError::Config("max_pending_fragment_sets cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// MESH CONFIG
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Display name carried in announcements
    pub nickname: String,
    /// How often presence is re-announced; must beat the gossip stale timeout
    pub announce_interval_ms: u64,
    /// Packet ids remembered for relay dedup
    pub seen_cache_capacity: usize,
    /// Private messages held per peer while its handshake completes
    pub max_outbox_per_peer: usize,
    pub session: SessionConfig,
    pub wire: WireConfig,
    pub gossip: GossipConfig,
    pub flood: FloodConfig,
    pub topology: TopologyConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            announce_interval_ms: 20_000,
            seen_cache_capacity: 4096,
            max_outbox_per_peer: 32,
            session: SessionConfig::default(),
            wire: WireConfig::default(),
            gossip: GossipConfig::default(),
            flood: FloodConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            ..Self::default()
        }
    }

    pub fn with_announce_interval_ms(mut self, ms: u64) -> Self {
        self.announce_interval_ms = ms;
        self
    }

    pub fn with_seen_cache_capacity(mut self, capacity: usize) -> Self {
        self.seen_cache_capacity = capacity;
        self
    }

    pub fn with_max_outbox_per_peer(mut self, max: usize) -> Self {
        self.max_outbox_per_peer = max;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_wire(mut self, wire: WireConfig) -> Self {
        self.wire = wire;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_flood(mut self, flood: FloodConfig) -> Self {
        self.flood = flood;
        self
    }

    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.nickname.is_empty() || self.nickname.len() > 64 {
            return Err(MeshError::Config("nickname must be 1..=64 bytes".to_string()));
        }
        if self.announce_interval_ms == 0 {
            return Err(MeshError::Config("announce_interval_ms cannot be 0".to_string()));
        }
        if self.announce_interval_ms >= self.gossip.stale_peer_timeout_ms {
            return Err(MeshError::Config(format!(
                "announce_interval_ms ({}) must be shorter than stale_peer_timeout_ms ({})",
                self.announce_interval_ms, self.gossip.stale_peer_timeout_ms
            )));
        }
        if self.seen_cache_capacity == 0 {
            return Err(MeshError::Config("seen_cache_capacity cannot be 0".to_string()));
        }
        self.session.validate().map_err(|e| MeshError::Config(e.to_string()))?;
        self.wire.validate()?;
        self.gossip.validate().map_err(|e| MeshError::Config(e.to_string()))?;
        self.flood.validate()?;
        self.topology.validate()?;
        Ok(())
    }
}
