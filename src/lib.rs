// blemesh - store-and-forward mesh messaging core
//
// Layers, leaves first:
// - wire:      binary packet format, streaming assembly, fragmentation
// - noise:     Noise XX handshake and per-peer transport ciphers
// - dedup:     content keys, LRU cache, token-bucket flood control
// - topology:  confirmed-edge adjacency graph and shortest routes
// - sync:      gossip caches and RequestSync anti-entropy
// - mesh:      composition root tying the layers to a transport

pub mod dedup;
pub mod identity;
pub mod mesh;
pub mod noise;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod wire;

/// Current wall clock in milliseconds since the Unix epoch.
///
/// Every time-dependent API also has an explicit `*_at(now_ms)` form; this is
/// only the default clock behind the convenience wrappers.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
