// TCP Transport
// Stand-in link layer for running real nodes without radios. Each accepted or
// dialed stream becomes one link; a reader task per link feeds a single
// inbound queue that `next_event` drains.

use crate::transport::{
    LinkId, LinkInfo, PeerAddress, Transport, TransportConfig, TransportError, TransportEvent,
    TransportState, TransportStats,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

const INBOUND_CAPACITY: usize = 1024;
const WRITE_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    pub link: TransportConfig,
    pub bind_address: String,
    /// 0 picks a free port
    pub bind_port: u16,
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            link: TransportConfig::default(),
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link_config(mut self, link: TransportConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

fn tcp_address(addr: SocketAddr) -> PeerAddress {
    PeerAddress::tcp(&addr.ip().to_string(), addr.port())
}

/// Work arriving from background tasks
enum Inbound {
    Accepted(TcpStream, SocketAddr),
    Link(TransportEvent),
}

struct OpenLink {
    info: LinkInfo,
    outgoing: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Drop for OpenLink {
    fn drop(&mut self) {
        // Dropping `outgoing` ends the writer, which closes our half of the stream
        self.reader.abort();
    }
}

/// Background state that exists only while running
struct Running {
    listener: JoinHandle<()>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

pub struct TcpTransport {
    config: TcpTransportConfig,
    state: TransportState,
    local_address: Option<PeerAddress>,
    running: Option<Running>,
    links: HashMap<LinkId, OpenLink>,
    /// Events produced synchronously by our own calls
    queued: VecDeque<TransportEvent>,
    stats: TransportStats,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Stopped,
            local_address: None,
            running: None,
            links: HashMap::new(),
            queued: VecDeque::new(),
            stats: TransportStats::default(),
        }
    }

    fn check_capacity(&self) -> Result<(), TransportError> {
        let max = self.config.link.max_links;
        if self.links.len() >= max as usize {
            return Err(TransportError::LinkLimit(max));
        }
        Ok(())
    }

    fn open_link(&mut self, stream: TcpStream, address: PeerAddress) -> Result<LinkId, TransportError> {
        self.check_capacity()?;
        let inbound = self
            .running
            .as_ref()
            .map(|r| r.inbound_tx.clone())
            .ok_or(TransportError::NotRunning)?;
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            debug!(address = %address, error = %e, "set_nodelay failed");
        }

        let link = LinkId::generate();
        let (read_half, write_half) = stream.into_split();
        let (outgoing, queue) = mpsc::channel(WRITE_QUEUE);
        let reader = tokio::spawn(read_link(link, read_half, self.config.link.read_chunk, inbound));
        tokio::spawn(write_link(write_half, queue));

        debug!(link = %link, address = %address, "TCP link open");
        self.links.insert(
            link,
            OpenLink {
                info: LinkInfo::new(link, address),
                outgoing,
                reader,
            },
        );
        self.stats.links_total += 1;
        self.stats.links_active = self.links.len() as u32;
        Ok(link)
    }

    fn close_link(&mut self, link: &LinkId) -> bool {
        let closed = self.links.remove(link).is_some();
        self.stats.links_active = self.links.len() as u32;
        closed
    }

    /// Apply bookkeeping for a reader-task event; `None` when the link is
    /// already gone locally
    fn absorb(&mut self, event: TransportEvent) -> Option<TransportEvent> {
        match &event {
            TransportEvent::Received { link, data } => {
                let open = self.links.get_mut(link)?;
                open.info.record_received(data.len());
                self.stats.bytes_received += data.len() as u64;
                self.stats.chunks_received += 1;
            }
            TransportEvent::Disconnected { link, .. } => {
                if !self.close_link(link) {
                    return None;
                }
            }
            _ => {}
        }
        Some(event)
    }
}

async fn read_link(link: LinkId, mut stream: OwnedReadHalf, chunk: usize, inbound: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; chunk];
    loop {
        let (event, last) = match stream.read(&mut buf).await {
            Ok(0) => (
                TransportEvent::Disconnected { link, reason: "closed by peer".to_string() },
                true,
            ),
            Ok(n) => (TransportEvent::Received { link, data: buf[..n].to_vec() }, false),
            Err(e) => (TransportEvent::Disconnected { link, reason: e.to_string() }, true),
        };
        if inbound.send(Inbound::Link(event)).await.is_err() || last {
            return;
        }
    }
}

async fn write_link(mut stream: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = stream.write_all(&bytes).await {
            debug!(error = %e, "TCP write failed");
            return;
        }
    }
}

impl Transport for TcpTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.state.is_running() {
            return Err(TransportError::AlreadyRunning);
        }
        self.config.link.validate()?;

        let bind = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let listener = match TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(e) => {
                self.state = TransportState::Failed(e.to_string());
                return Err(TransportError::ConnectionFailed(format!("bind {}: {}", bind, e)));
            }
        };
        let address = tcp_address(listener.local_addr()?);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let accepted = inbound_tx.clone();
        let listener = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if accepted.send(Inbound::Accepted(stream, peer)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        return;
                    }
                }
            }
        });

        info!(address = %address, "TCP transport listening");
        self.running = Some(Running {
            listener,
            inbound_tx,
            inbound_rx,
        });
        self.queued.push_back(TransportEvent::Listening { address: address.clone() });
        self.local_address = Some(address);
        self.state = TransportState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        self.running = None;
        self.links.clear();
        self.queued.clear();
        self.local_address = None;
        self.stats.links_active = 0;
        self.state = TransportState::Stopped;
        Ok(())
    }

    async fn connect(&mut self, address: PeerAddress) -> Result<LinkId, TransportError> {
        if !self.state.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.check_capacity()?;
        let PeerAddress::Tcp { host, port } = &address else {
            return Err(TransportError::InvalidAddress(format!("not a TCP address: {}", address)));
        };

        let limit = Duration::from_secs(u64::from(self.config.link.connect_timeout_secs));
        let stream = timeout(limit, TcpStream::connect((host.as_str(), *port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let link = self.open_link(stream, address.clone())?;
        self.queued.push_back(TransportEvent::Connected { link, address });
        Ok(link)
    }

    async fn disconnect(&mut self, link: &LinkId) -> Result<(), TransportError> {
        if !self.close_link(link) {
            return Err(TransportError::UnknownLink(*link));
        }
        self.queued.push_back(TransportEvent::Disconnected {
            link: *link,
            reason: "closed locally".to_string(),
        });
        Ok(())
    }

    async fn send(&mut self, link: &LinkId, data: &[u8]) -> Result<usize, TransportError> {
        let open = self.links.get_mut(link).ok_or(TransportError::UnknownLink(*link))?;
        open.outgoing
            .send(data.to_vec())
            .await
            .map_err(|_| TransportError::SendFailed(format!("writer for {} has exited", link)))?;
        open.info.record_sent(data.len());
        self.stats.bytes_sent += data.len() as u64;
        self.stats.chunks_sent += 1;
        Ok(data.len())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            let inbound = self.running.as_mut()?.inbound_rx.recv().await?;
            match inbound {
                Inbound::Accepted(stream, peer) => {
                    let address = tcp_address(peer);
                    match self.open_link(stream, address.clone()) {
                        Ok(link) => return Some(TransportEvent::Connected { link, address }),
                        Err(error) => {
                            self.stats.errors += 1;
                            warn!(address = %address, error = %error, "Refused inbound link");
                            return Some(TransportEvent::Error { link: None, error });
                        }
                    }
                }
                Inbound::Link(event) => {
                    if let Some(event) = self.absorb(event) {
                        return Some(event);
                    }
                }
            }
        }
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn local_address(&self) -> Option<PeerAddress> {
        self.local_address.clone()
    }

    fn links(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    fn link_info(&self, link: &LinkId) -> Option<&LinkInfo> {
        self.links.get(link).map(|open| &open.info)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
