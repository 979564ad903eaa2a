// Mesh Service - one tokio task per node
//
// The task owns the `MeshNode` and its transport. Ingestion, application
// commands and maintenance ticks are taken one at a time from a single
// `select!`, so protocol state never sees two writers.

use crate::identity::{Fingerprint, PeerId, PeerRef};
use crate::mesh::error::{MeshError, MeshResult};
use crate::mesh::node::{MeshEvent, MeshNode, NodeOutput, NodeStats, Route};
use crate::mesh::payload::MessageId;
use crate::mesh::peer::{PeerState, PeerStats};
use crate::now_millis;
use crate::transport::{LinkId, PeerAddress, Transport, TransportEvent, TransportStats};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Maintenance cadence; gossip and announce timers are checked on each tick
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// COMMANDS
// ============================================================================

/// Snapshot of one known peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub nickname: String,
    pub fingerprint: Fingerprint,
    pub state: PeerState,
    pub verified: bool,
    pub session_established: bool,
}

#[derive(Clone, Debug)]
pub struct ServiceStats {
    pub node: NodeStats,
    pub peers: PeerStats,
    pub transport: TransportStats,
}

pub enum MeshCommand {
    SendPublic {
        text: String,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    SendPrivate {
        peer: PeerRef,
        text: String,
        reply: oneshot::Sender<MeshResult<MessageId>>,
    },
    SendReadReceipt {
        peer: PeerRef,
        id: MessageId,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    Verify {
        peer: PeerRef,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    Connect {
        address: PeerAddress,
        reply: oneshot::Sender<MeshResult<LinkId>>,
    },
    Announce,
    Route {
        peer: PeerRef,
        reply: oneshot::Sender<Route>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    Stats {
        reply: oneshot::Sender<ServiceStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cloneable front end to a running [`MeshService`]
#[derive(Clone)]
pub struct MeshHandle {
    peer_id: PeerId,
    fingerprint: Fingerprint,
    commands: mpsc::Sender<MeshCommand>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> MeshCommand) -> MeshResult<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MeshError::ServiceStopped)?;
        rx.await.map_err(|_| MeshError::ServiceStopped)
    }

    pub async fn send_public(&self, text: &str) -> MeshResult<()> {
        let text = text.to_string();
        self.request(|reply| MeshCommand::SendPublic { text, reply }).await?
    }

    /// Queue an encrypted message; a handshake is started when needed
    pub async fn send_private(&self, peer: impl Into<PeerRef>, text: &str) -> MeshResult<MessageId> {
        let (peer, text) = (peer.into(), text.to_string());
        self.request(|reply| MeshCommand::SendPrivate { peer, text, reply }).await?
    }

    pub async fn send_read_receipt(&self, peer: impl Into<PeerRef>, id: MessageId) -> MeshResult<()> {
        let peer = peer.into();
        self.request(|reply| MeshCommand::SendReadReceipt { peer, id, reply }).await?
    }

    /// Challenge a peer; the outcome arrives as [`MeshEvent::PeerVerified`]
    pub async fn verify_peer(&self, peer: impl Into<PeerRef>) -> MeshResult<()> {
        let peer = peer.into();
        self.request(|reply| MeshCommand::Verify { peer, reply }).await?
    }

    pub async fn connect(&self, address: PeerAddress) -> MeshResult<LinkId> {
        self.request(|reply| MeshCommand::Connect { address, reply }).await?
    }

    pub async fn announce(&self) -> MeshResult<()> {
        self.commands
            .send(MeshCommand::Announce)
            .await
            .map_err(|_| MeshError::ServiceStopped)
    }

    pub async fn route(&self, peer: impl Into<PeerRef>) -> MeshResult<Route> {
        let peer = peer.into();
        self.request(|reply| MeshCommand::Route { peer, reply }).await
    }

    pub async fn peers(&self) -> MeshResult<Vec<PeerSummary>> {
        self.request(|reply| MeshCommand::Peers { reply }).await
    }

    pub async fn stats(&self) -> MeshResult<ServiceStats> {
        self.request(|reply| MeshCommand::Stats { reply }).await
    }

    /// Announce departure, stop the transport and end the task
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.request(|reply| MeshCommand::Shutdown { reply }).await
    }
}

// ============================================================================
// SERVICE
// ============================================================================

enum Step {
    Transport(Option<TransportEvent>),
    Command(Option<MeshCommand>),
    Tick,
}

pub struct MeshService<T: Transport> {
    node: MeshNode,
    transport: T,
    commands: mpsc::Receiver<MeshCommand>,
    events: broadcast::Sender<MeshEvent>,
    tick: Duration,
}

impl<T: Transport + 'static> MeshService<T> {
    pub fn spawn(node: MeshNode, transport: T) -> (MeshHandle, JoinHandle<MeshResult<()>>) {
        Self::spawn_with_tick(node, transport, DEFAULT_TICK)
    }

    pub fn spawn_with_tick(
        node: MeshNode,
        transport: T,
        tick: Duration,
    ) -> (MeshHandle, JoinHandle<MeshResult<()>>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = MeshHandle {
            peer_id: node.peer_id(),
            fingerprint: node.fingerprint(),
            commands: command_tx,
            events: event_tx.clone(),
        };
        let service = MeshService {
            node,
            transport,
            commands: command_rx,
            events: event_tx,
            tick,
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) -> MeshResult<()> {
        if !self.transport.state().is_running() {
            self.transport.start().await?;
        }
        info!(peer = %self.node.peer_id(), nickname = %self.node.nickname(), "Mesh service started");

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                event = self.transport.next_event() => Step::Transport(event),
                command = self.commands.recv() => Step::Command(command),
                _ = ticker.tick() => Step::Tick,
            };

            let outputs = match step {
                Step::Transport(Some(event)) => self.node.on_transport_event_at(event, now_millis()),
                Step::Transport(None) => {
                    info!(peer = %self.node.peer_id(), "Transport closed; stopping");
                    return Ok(());
                }
                Step::Command(Some(MeshCommand::Shutdown { reply })) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return Ok(());
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => {
                    debug!(peer = %self.node.peer_id(), "All handles dropped; stopping");
                    self.shutdown().await;
                    return Ok(());
                }
                Step::Tick => self.node.maintenance_at(now_millis()),
            };
            self.dispatch(outputs).await;
        }
    }

    async fn handle_command(&mut self, command: MeshCommand) -> Vec<NodeOutput> {
        let now = now_millis();
        match command {
            MeshCommand::SendPublic { text, reply } => {
                let (result, out) = split(self.node.send_public_at(&text, now));
                let _ = reply.send(result);
                out
            }
            MeshCommand::SendPrivate { peer, text, reply } => {
                let peer = self.node.resolve_peer(&peer);
                match self.node.send_private_at(peer, &text, now) {
                    Ok((id, out)) => {
                        let _ = reply.send(Ok(id));
                        out
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Vec::new()
                    }
                }
            }
            MeshCommand::SendReadReceipt { peer, id, reply } => {
                let peer = self.node.resolve_peer(&peer);
                let (result, out) = split(self.node.send_read_receipt_at(peer, id, now));
                let _ = reply.send(result);
                out
            }
            MeshCommand::Verify { peer, reply } => {
                let peer = self.node.resolve_peer(&peer);
                let (result, out) = split(self.node.verify_peer_at(peer, now));
                let _ = reply.send(result);
                out
            }
            MeshCommand::Connect { address, reply } => {
                let result = self.transport.connect(address.clone()).await.map_err(MeshError::from);
                if let Err(e) = &result {
                    warn!(address = %address, error = %e, "Connect failed");
                }
                let _ = reply.send(result);
                Vec::new()
            }
            MeshCommand::Announce => self.node.announce_at(now),
            MeshCommand::Route { peer, reply } => {
                let peer = self.node.resolve_peer(&peer);
                let _ = reply.send(self.node.route_to(&peer));
                Vec::new()
            }
            MeshCommand::Peers { reply } => {
                let _ = reply.send(self.peer_summaries());
                Vec::new()
            }
            MeshCommand::Stats { reply } => {
                let _ = reply.send(ServiceStats {
                    node: self.node.stats().clone(),
                    peers: self.node.peers().stats(),
                    transport: self.transport.stats(),
                });
                Vec::new()
            }
            // Handled by the run loop
            MeshCommand::Shutdown { reply } => {
                let _ = reply.send(());
                Vec::new()
            }
        }
    }

    fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.node
            .peers()
            .all_peers()
            .into_iter()
            .map(|p| PeerSummary {
                peer_id: p.peer_id(),
                nickname: p.nickname().to_string(),
                fingerprint: *p.fingerprint(),
                state: p.state(),
                verified: p.is_verified(),
                session_established: self.node.is_established(&p.peer_id()),
            })
            .collect()
    }

    async fn dispatch(&mut self, outputs: Vec<NodeOutput>) {
        for output in outputs {
            match output {
                NodeOutput::Send { link, bytes } => {
                    if let Err(e) = self.transport.send(&link, &bytes).await {
                        // The link may have dropped since the node decided to use it
                        debug!(link = %link, len = bytes.len(), error = %e, "Send failed");
                    }
                }
                NodeOutput::Event(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let leave = self.node.leave_at(now_millis());
        self.dispatch(leave).await;
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "Transport stop failed");
        }
        info!(peer = %self.node.peer_id(), "Mesh service stopped");
    }
}

fn split(result: MeshResult<Vec<NodeOutput>>) -> (MeshResult<()>, Vec<NodeOutput>) {
    match result {
        Ok(out) => (Ok(()), out),
        Err(e) => (Err(e), Vec::new()),
    }
}
