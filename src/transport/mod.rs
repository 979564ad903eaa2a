// Transport module - THE LINK (abstract)
// Raw bytes per link plus link up/down events; in-memory and TCP implementations

mod memory;
mod tcp;
mod traits;

pub use traits::{
    // Core trait
    Transport,
    // Configuration
    TransportConfig,
    // Link types
    LinkId, LinkInfo,
    // Address types
    PeerAddress,
    // Events and errors
    TransportEvent, TransportError, TransportState,
    // Statistics
    TransportStats,
};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};
