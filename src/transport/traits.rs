// Transport Traits and Core Types
// The seam below the mesh core: links that carry raw bytes, and the events
// that say when a link comes up, goes down or delivers data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Limits shared by every transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Links allowed open at once
    pub max_links: u32,
    pub connect_timeout_secs: u32,
    /// Largest chunk handed up in one `Received` event
    pub read_chunk: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_links: 16,
            connect_timeout_secs: 10,
            read_chunk: 4096,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_links(mut self, max: u32) -> Self {
        self.max_links = max;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u32) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size;
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_links == 0 {
            return Err(TransportError::InvalidConfig("max_links must be at least 1".to_string()));
        }
        if self.read_chunk == 0 {
            return Err(TransportError::InvalidConfig("read_chunk must be at least 1".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// PEER ADDRESS
// ============================================================================

/// Where a link goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddress {
    Tcp { host: String, port: u16 },
    /// Named endpoint on an in-process [`MemoryNetwork`](crate::transport::MemoryNetwork)
    Memory { name: String },
}

impl PeerAddress {
    pub fn tcp(host: &str, port: u16) -> Self {
        Self::Tcp {
            host: host.to_string(),
            port,
        }
    }

    pub fn memory(name: &str) -> Self {
        Self::Memory {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Memory { name } => write!(f, "mem://{}", name),
        }
    }
}

/// Accepts `tcp://host:port`, `mem://name`, or a bare `host:port`
impl FromStr for PeerAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("mem://") {
            if name.is_empty() {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::memory(name));
        }
        let hostport = s.strip_prefix("tcp://").unwrap_or(s);
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(Self::tcp(host, port))
    }
}

// ============================================================================
// LINKS
// ============================================================================

/// One radio-level (or stand-in) connection. A peer reconnecting gets a new one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId([u8; 8]);

impl LinkId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkId({})", self)
    }
}

/// Bookkeeping for one open link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    id: LinkId,
    address: PeerAddress,
    opened_at: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl LinkInfo {
    pub fn new(id: LinkId, address: PeerAddress) -> Self {
        Self {
            id,
            address,
            opened_at: crate::now_millis(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received = self.bytes_received.saturating_add(bytes as u64);
    }
}

// ============================================================================
// STATE, EVENTS, ERRORS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Running,
    /// Start failed; `start` may be retried
    Failed(String),
}

impl TransportState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Accepting inbound links at this address
    Listening { address: PeerAddress },

    /// A link came up, inbound or outbound
    Connected { link: LinkId, address: PeerAddress },

    Disconnected { link: LinkId, reason: String },

    /// Bytes arrived; frames may be split or coalesced arbitrarily
    Received { link: LinkId, data: Vec<u8> },

    Error { link: Option<LinkId>, error: TransportError },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connect timed out")]
    Timeout,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Link limit of {0} reached")]
    LinkLimit(u32),

    #[error("No open link {0}")]
    UnknownLink(LinkId),

    #[error("Transport not running")]
    NotRunning,

    #[error("Transport already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub links_active: u32,
    pub links_total: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub errors: u64,
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Raw bytes per link plus link up/down events.
///
/// Discovery and physical connection are the implementation's business; the
/// mesh core only sees links. Futures are `Send` so a service can own the
/// transport inside a spawned task.
pub trait Transport: Send {
    fn start(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop and drop every link
    fn stop(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Open a link to `address`
    fn connect(&mut self, address: PeerAddress) -> impl Future<Output = Result<LinkId, TransportError>> + Send;

    fn disconnect(&mut self, link: &LinkId) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Write bytes to one link
    fn send(&mut self, link: &LinkId, data: &[u8]) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Write bytes to every link; returns how many accepted them
    fn broadcast(&mut self, data: &[u8]) -> impl Future<Output = Result<u32, TransportError>> + Send {
        async move {
            let mut count = 0u32;
            for link in self.links() {
                if self.send(&link, data).await.is_ok() {
                    count += 1;
                }
            }
            Ok(count)
        }
    }

    /// Wait for the next event. Must be cancel-safe; `None` once stopped.
    fn next_event(&mut self) -> impl Future<Output = Option<TransportEvent>> + Send;

    fn state(&self) -> &TransportState;

    /// Address inbound links can reach, if any
    fn local_address(&self) -> Option<PeerAddress>;

    /// Currently open links
    fn links(&self) -> Vec<LinkId>;

    fn link_info(&self, link: &LinkId) -> Option<&LinkInfo>;

    fn stats(&self) -> TransportStats;
}
