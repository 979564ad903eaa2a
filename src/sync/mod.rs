// Sync module - HOW NODES CATCH UP
// Typed gossip caches, RequestSync anti-entropy, and stale-peer maintenance

mod cache;
mod gossip;
mod protocol;

pub use cache::{Admit, CachedPacket, TypedCache};
pub use gossip::{GossipAction, GossipConfig, GossipStats, GossipSyncManager, Observation};
pub use protocol::{RequestSync, SyncError, SyncKind, SyncTypeFlags, SYNC_PROTOCOL_VERSION};
