// Memory Transport
// In-process links between named endpoints, for tests and the simulator.
//
// A `MemoryNetwork` is the shared medium. Links are created and torn down on
// the network (not on an endpoint) so a test can sever and restore a link
// after the endpoints have been moved into their services.

use crate::transport::{
    LinkId, LinkInfo, PeerAddress, Transport, TransportError, TransportEvent, TransportState,
    TransportStats,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct LinkEnd {
    owner: String,
    remote_name: String,
    remote: LinkId,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    links: HashMap<LinkId, LinkEnd>,
}

impl Hub {
    fn deliver(&self, owner: &str, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(owner) {
            // Receiver gone means the endpoint was dropped; nothing to tell
            let _ = tx.send(event);
        }
    }

    fn connect(&mut self, a: &str, b: &str) -> Result<(LinkId, LinkId), TransportError> {
        for name in [a, b] {
            if !self.endpoints.contains_key(name) {
                return Err(TransportError::InvalidAddress(format!("unknown endpoint {}", name)));
            }
        }
        if a == b {
            return Err(TransportError::InvalidAddress("cannot link an endpoint to itself".to_string()));
        }
        let (la, lb) = (LinkId::generate(), LinkId::generate());
        self.links.insert(
            la,
            LinkEnd {
                owner: a.to_string(),
                remote_name: b.to_string(),
                remote: lb,
            },
        );
        self.links.insert(
            lb,
            LinkEnd {
                owner: b.to_string(),
                remote_name: a.to_string(),
                remote: la,
            },
        );
        self.deliver(a, TransportEvent::Connected { link: la, address: PeerAddress::memory(b) });
        self.deliver(b, TransportEvent::Connected { link: lb, address: PeerAddress::memory(a) });
        Ok((la, lb))
    }

    fn close(&mut self, link: &LinkId, reason: &str) -> bool {
        let Some(end) = self.links.remove(link) else {
            return false;
        };
        self.links.remove(&end.remote);
        self.deliver(&end.owner, TransportEvent::Disconnected { link: *link, reason: reason.to_string() });
        self.deliver(
            &end.remote_name,
            TransportEvent::Disconnected { link: end.remote, reason: reason.to_string() },
        );
        true
    }
}

/// Shared in-process medium
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a named endpoint
    pub fn endpoint(&self, name: &str) -> Result<MemoryTransport, TransportError> {
        let mut hub = self.hub();
        if hub.endpoints.contains_key(name) {
            return Err(TransportError::InvalidAddress(format!("endpoint {} already exists", name)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        hub.endpoints.insert(name.to_string(), tx);
        Ok(MemoryTransport {
            name: name.to_string(),
            network: self.clone(),
            events: rx,
            state: TransportState::Stopped,
            links: HashMap::new(),
            chunk_size: None,
            stats: TransportStats::default(),
        })
    }

    /// Bring up a link between two endpoints; both see `Connected`
    pub fn link(&self, a: &str, b: &str) -> Result<(LinkId, LinkId), TransportError> {
        self.hub().connect(a, b)
    }

    /// Tear down every link between two endpoints; returns how many went down
    pub fn unlink(&self, a: &str, b: &str) -> usize {
        let mut hub = self.hub();
        let doomed: Vec<LinkId> = hub
            .links
            .iter()
            .filter(|(_, end)| end.owner == a && end.remote_name == b)
            .map(|(id, _)| *id)
            .collect();
        doomed.iter().filter(|id| hub.close(id, "link severed")).count()
    }

    pub fn link_count(&self) -> usize {
        self.hub().links.len() / 2
    }
}

/// One endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    name: String,
    network: MemoryNetwork,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    state: TransportState,
    links: HashMap<LinkId, LinkInfo>,
    chunk_size: Option<usize>,
    stats: TransportStats,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split every write into chunks of at most `size` bytes, like a radio MTU would
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = (size > 0).then_some(size);
        self
    }

    fn track(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected { link, address } => {
                self.links.insert(*link, LinkInfo::new(*link, address.clone()));
                self.stats.links_total += 1;
            }
            TransportEvent::Disconnected { link, .. } => {
                self.links.remove(link);
            }
            TransportEvent::Received { link, data } => {
                if let Some(info) = self.links.get_mut(link) {
                    info.record_received(data.len());
                }
                self.stats.bytes_received += data.len() as u64;
                self.stats.chunks_received += 1;
            }
            _ => {}
        }
        self.stats.links_active = self.links.len() as u32;
    }
}

impl Transport for MemoryTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.state.is_running() {
            return Err(TransportError::AlreadyRunning);
        }
        self.state = TransportState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        {
            let mut hub = self.network.hub();
            let ours: Vec<LinkId> = hub
                .links
                .iter()
                .filter(|(_, end)| end.owner == self.name)
                .map(|(id, _)| *id)
                .collect();
            for link in ours {
                hub.close(&link, "endpoint stopped");
            }
            hub.endpoints.remove(&self.name);
        }
        self.links.clear();
        self.stats.links_active = 0;
        self.state = TransportState::Stopped;
        Ok(())
    }

    async fn connect(&mut self, address: PeerAddress) -> Result<LinkId, TransportError> {
        if !self.state.is_running() {
            return Err(TransportError::NotRunning);
        }
        let PeerAddress::Memory { name } = &address else {
            return Err(TransportError::InvalidAddress(format!("Expected memory address, got {}", address)));
        };
        let (ours, _) = self.network.link(&self.name, name)?;
        Ok(ours)
    }

    async fn disconnect(&mut self, link: &LinkId) -> Result<(), TransportError> {
        if self.network.hub().close(link, "Disconnected by local") {
            Ok(())
        } else {
            Err(TransportError::UnknownLink(*link))
        }
    }

    async fn send(&mut self, link: &LinkId, data: &[u8]) -> Result<usize, TransportError> {
        if !self.state.is_running() {
            return Err(TransportError::NotRunning);
        }
        let chunk = self.chunk_size.unwrap_or(data.len().max(1));
        let chunks = {
            let hub = self.network.hub();
            let end = hub.links.get(link).ok_or(TransportError::UnknownLink(*link))?;
            let mut n = 0u64;
            for piece in data.chunks(chunk) {
                hub.deliver(
                    &end.remote_name,
                    TransportEvent::Received { link: end.remote, data: piece.to_vec() },
                );
                n += 1;
            }
            n
        };
        if let Some(info) = self.links.get_mut(link) {
            info.record_sent(data.len());
        }
        self.stats.bytes_sent += data.len() as u64;
        self.stats.chunks_sent += chunks;
        debug!(endpoint = %self.name, link = %link, len = data.len(), chunks, "memory send");
        Ok(data.len())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.events.recv().await?;
        self.track(&event);
        Some(event)
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn local_address(&self) -> Option<PeerAddress> {
        Some(PeerAddress::memory(&self.name))
    }

    fn links(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    fn link_info(&self, link: &LinkId) -> Option<&LinkInfo> {
        self.links.get(link)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
