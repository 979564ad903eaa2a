// Mesh Module
// Ties the protocol layers to a transport: a synchronous node core and the
// tokio service that drives it.

pub mod config;
pub mod error;
pub mod node;
pub mod payload;
pub mod peer;
pub mod service;

pub use config::{MeshConfig, WireConfig};
pub use error::{MeshError, MeshResult};
pub use node::{MeshEvent, MeshNode, NodeOutput, NodeStats, Route};
pub use payload::{AppPayload, MessageId};
pub use peer::{PeerError, PeerInfo, PeerRegistry, PeerState, PeerStats, Upsert};
pub use service::{MeshCommand, MeshHandle, MeshService, PeerSummary, ServiceStats, DEFAULT_TICK};
