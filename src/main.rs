// mesh - command-line front end for blemesh
//
//   mesh keygen                      new identity, printed as URL-safe base64
//   mesh simulate --nodes 4          in-process line of nodes, then a restart
//   mesh route --link a:b --link b:c --from a --to c
//   mesh serve --port 7000 --connect 10.0.0.2:7000

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use blemesh::dedup::FloodConfig;
use blemesh::identity::{IdentityKeys, PeerId, PeerRef};
use blemesh::mesh::{
    MeshConfig, MeshError, MeshEvent, MeshHandle, MeshNode, MeshService, Route, WireConfig,
};
use blemesh::noise::SessionConfig;
use blemesh::sync::GossipConfig;
use blemesh::topology::{TopologyConfig, TopologyTracker};
use blemesh::transport::{MemoryNetwork, PeerAddress, TcpTransport, TcpTransportConfig};
use clap::{Args, Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("Invalid identity: {0}")]
    Identity(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "mesh", version, about = "Store-and-forward mesh messaging node")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an identity and print it with its ids
    Keygen,

    /// Run a line of in-process nodes and exercise delivery and reconnect
    Simulate {
        #[arg(long, default_value_t = 4)]
        nodes: usize,

        /// Split every link write into chunks this size, like a radio would
        #[arg(long, default_value_t = 180)]
        chunk_size: usize,

        #[arg(long, default_value = "hello mesh")]
        message: String,

        #[command(flatten)]
        tuning: Tuning,
    },

    /// Shortest confirmed route over the given links
    Route {
        /// An undirected link as NAME:NAME; both ends announce each other
        #[arg(long = "link", required = true)]
        links: Vec<String>,

        /// One-sided claim NAME:NAME; the first lists the second, not vice versa
        #[arg(long = "claim")]
        claims: Vec<String>,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Run a node over TCP, reading chat commands from stdin
    Serve {
        /// Identity from `mesh keygen`; a fresh one is generated when absent
        #[arg(long)]
        identity: Option<String>,

        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(long, default_value_t = 7000)]
        port: u16,

        /// Peers to dial, as HOST:PORT
        #[arg(long)]
        connect: Vec<String>,

        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Protocol tunables shared by every node-running command
#[derive(Args, Clone)]
struct Tuning {
    #[arg(long, default_value = "anon")]
    nickname: String,

    #[arg(long, default_value_t = 512)]
    mtu: usize,

    #[arg(long, default_value_t = 7)]
    ttl: u8,

    #[arg(long, default_value_t = 20_000)]
    announce_interval_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    stale_peer_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    max_decrypt_failures: u32,

    #[arg(long, default_value_t = 1024)]
    replay_window: usize,

    #[arg(long, default_value_t = 300_000)]
    neighbor_ttl_ms: u64,

    /// Per-sender burst of public messages before rate limiting
    #[arg(long, default_value_t = 30.0)]
    sender_burst: f64,
}

impl Tuning {
    fn config(&self, nickname: &str) -> MeshConfig {
        MeshConfig::new(nickname)
            .with_announce_interval_ms(self.announce_interval_ms)
            .with_wire(WireConfig::new().with_mtu(self.mtu).with_default_ttl(self.ttl))
            .with_session(
                SessionConfig::new()
                    .with_max_decrypt_failures(self.max_decrypt_failures)
                    .with_replay_window(self.replay_window),
            )
            .with_gossip(GossipConfig::new().with_stale_peer_timeout_ms(self.stale_peer_timeout_ms))
            .with_topology(TopologyConfig::new().with_neighbor_ttl_ms(self.neighbor_ttl_ms))
            .with_flood(FloodConfig::new().with_sender_bucket(self.sender_burst, 0.5))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let result = match cli.command {
        Command::Keygen => keygen(),
        Command::Simulate {
            nodes,
            chunk_size,
            message,
            tuning,
        } => simulate(nodes, chunk_size, &message, &tuning).await,
        Command::Route {
            links,
            claims,
            from,
            to,
        } => route(&links, &claims, &from, &to),
        Command::Serve {
            identity,
            bind,
            port,
            connect,
            tuning,
        } => serve(identity.as_deref(), &bind, port, &connect, &tuning).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// KEYGEN
// ============================================================================

fn keygen() -> CliResult<()> {
    let keys = IdentityKeys::generate();
    println!("identity:    {}", encode_identity(&keys));
    println!("peer id:     {}", keys.peer_id());
    println!("fingerprint: {}", keys.fingerprint());
    Ok(())
}

fn encode_identity(keys: &IdentityKeys) -> String {
    URL_SAFE_NO_PAD.encode(keys.to_bytes().as_slice())
}

fn decode_identity(text: &str) -> CliResult<IdentityKeys> {
    let bytes = URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|e| CliError::Identity(e.to_string()))?;
    IdentityKeys::from_bytes(&bytes).map_err(|e| CliError::Identity(e.to_string()))
}

// ============================================================================
// ROUTE
// ============================================================================

/// Stable made-up id for a label so the graph can be described by name
fn label_id(label: &str) -> PeerId {
    let digest = Sha256::digest(label.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    PeerId::from_bytes(bytes)
}

fn parse_pair(text: &str) -> CliResult<(String, String)> {
    let (a, b) = text
        .split_once(':')
        .ok_or_else(|| CliError::Argument(format!("expected NAME:NAME, got {}", text)))?;
    if a.is_empty() || b.is_empty() {
        return Err(CliError::Argument(format!("empty name in {}", text)));
    }
    Ok((a.to_string(), b.to_string()))
}

fn route(links: &[String], claims: &[String], from: &str, to: &str) -> CliResult<()> {
    let mut announced: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for text in links {
        let (a, b) = parse_pair(text)?;
        announced.entry(a.clone()).or_default().push(b.clone());
        announced.entry(b).or_default().push(a);
    }
    for text in claims {
        let (a, b) = parse_pair(text)?;
        announced.entry(a).or_default().push(b);
    }

    let names: BTreeMap<PeerId, String> = announced
        .keys()
        .chain(announced.values().flatten())
        .map(|name| (label_id(name), name.clone()))
        .collect();

    let mut topology = TopologyTracker::new(TopologyConfig::default());
    for (name, neighbors) in &announced {
        let ids: Vec<PeerId> = neighbors.iter().map(|n| label_id(n)).collect();
        topology.update_neighbors(label_id(name), &ids);
    }

    match topology.compute_route(&label_id(from), &label_id(to)) {
        Some(hops) => {
            let mut path = vec![from.to_string()];
            path.extend(hops.iter().map(|h| names.get(h).cloned().unwrap_or_else(|| h.to_string())));
            path.push(to.to_string());
            println!("{}", path.join(" -> "));
        }
        None => println!("no route from {} to {}", from, to),
    }
    Ok(())
}

// ============================================================================
// SIMULATE
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

async fn wait_for(
    rx: &mut broadcast::Receiver<MeshEvent>,
    what: &'static str,
    pred: impl Fn(&MeshEvent) -> bool,
) -> CliResult<MeshEvent> {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(CliError::Timeout(what)),
            }
        }
    })
    .await
    .map_err(|_| CliError::Timeout(what))?
}

async fn wait_for_route(handle: &MeshHandle, to: PeerId) -> CliResult<Route> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match handle.route(to).await? {
            Route::Unreachable if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await
            }
            Route::Unreachable => return Err(CliError::Timeout("a confirmed route")),
            route => return Ok(route),
        }
    }
}

fn spawn_memory_node(
    net: &MemoryNetwork,
    name: &str,
    keys: IdentityKeys,
    chunk_size: usize,
    tuning: &Tuning,
) -> CliResult<MeshHandle> {
    let node = MeshNode::new(keys, tuning.config(name))?;
    let transport = net
        .endpoint(name)
        .map_err(MeshError::from)?
        .with_chunk_size(chunk_size);
    let (handle, _task) = MeshService::spawn_with_tick(node, transport, Duration::from_millis(200));
    Ok(handle)
}

async fn simulate(count: usize, chunk_size: usize, message: &str, tuning: &Tuning) -> CliResult<()> {
    if count < 2 {
        return Err(CliError::Argument("need at least 2 nodes".to_string()));
    }
    let net = MemoryNetwork::new();
    let names: Vec<String> = (0..count).map(|i| format!("n{}", i)).collect();
    let first_keys = IdentityKeys::generate();

    let mut handles = Vec::with_capacity(count);
    for (i, name) in names.iter().enumerate() {
        let keys = if i == 0 { first_keys.clone() } else { IdentityKeys::generate() };
        handles.push(spawn_memory_node(&net, name, keys, chunk_size, tuning)?);
    }
    let mut first_events = handles[0].subscribe();
    let mut last_events = handles[count - 1].subscribe();
    for pair in names.windows(2) {
        net.link(&pair[0], &pair[1]).map_err(MeshError::from)?;
    }

    let (first, last) = (handles[0].clone(), handles[count - 1].clone());
    let route = wait_for_route(&first, last.peer_id()).await?;
    info!(route = ?route, "Route from first to last node");

    // Broadcast flood across the line
    first.send_public(message).await?;
    if let MeshEvent::PublicMessage { text, .. } =
        wait_for(&mut last_events, "public message", |e| matches!(e, MeshEvent::PublicMessage { .. })).await?
    {
        println!("public:  {} -> {}: {}", names[0], names[count - 1], text);
    }

    // Multi-hop private message with delivery ack
    let id = first.send_private(last.fingerprint(), message).await?;
    wait_for(&mut last_events, "private message", |e| matches!(e, MeshEvent::PrivateMessage { .. })).await?;
    wait_for(&mut first_events, "delivery ack", |e| matches!(e, MeshEvent::DeliveryAck { id: acked, .. } if *acked == id)).await?;
    println!("private: {} -> {} delivered and acknowledged", names[0], names[count - 1]);

    // Restart the first node with the same identity and talk again
    first.shutdown().await?;
    let restarted = spawn_memory_node(&net, &names[0], first_keys, chunk_size, tuning)?;
    let mut restarted_events = restarted.subscribe();
    net.link(&names[0], &names[1]).map_err(MeshError::from)?;
    let neighbor = handles[1].peer_id();
    wait_for(&mut restarted_events, "relink after restart", |e| {
        matches!(e, MeshEvent::PeerAnnounced { peer, direct: true, .. } if *peer == neighbor)
    })
    .await?;

    // Farther adjacency is relearned on the next announce round; until then
    // the handshake travels by flooding

    let id = restarted.send_private(PeerRef::Stable(last.fingerprint()), "back again").await?;
    wait_for(&mut restarted_events, "delivery ack after restart", |e| {
        matches!(e, MeshEvent::DeliveryAck { id: acked, .. } if *acked == id)
    })
    .await?;
    println!("restart: {} re-handshaked with {} and delivered", names[0], names[count - 1]);

    for handle in handles.iter().skip(1).chain(std::iter::once(&restarted)) {
        let stats = handle.stats().await?;
        info!(
            peer = %handle.peer_id(),
            delivered = stats.node.delivered,
            relayed = stats.node.relayed,
            forwarded = stats.node.forwarded,
            duplicates = stats.node.duplicates,
            "Node stats"
        );
        handle.shutdown().await?;
    }
    Ok(())
}

// ============================================================================
// SERVE
// ============================================================================

async fn serve(identity: Option<&str>, bind: &str, port: u16, connect: &[String], tuning: &Tuning) -> CliResult<()> {
    let keys = match identity {
        Some(text) => decode_identity(text)?,
        None => {
            let keys = IdentityKeys::generate();
            println!("generated identity: {}", encode_identity(&keys));
            keys
        }
    };
    println!("peer id {}  fingerprint {}", keys.peer_id(), keys.fingerprint());

    let node = MeshNode::new(keys, tuning.config(&tuning.nickname))?;
    let transport = TcpTransport::new(TcpTransportConfig::new().with_bind_address(bind).with_bind_port(port));
    let (handle, task) = MeshService::spawn(node, transport);
    let mut events = handle.subscribe();

    for target in connect {
        let address: PeerAddress = target
            .parse()
            .map_err(|_| CliError::Argument(format!("expected HOST:PORT, got {}", target)))?;
        if let Err(e) = handle.connect(address).await {
            warn!(target = %target, error = %e, "Could not connect");
        }
    }

    println!("commands: /msg PEER TEXT, /verify PEER, /route PEER, /peers, /quit; anything else is public");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_line(&handle, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "Event stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if handle.is_running() {
        handle.shutdown().await?;
    }
    if let Ok(Err(e)) = task.await {
        warn!(error = %e, "Service ended with error");
    }
    Ok(())
}

fn parse_peer(text: &str) -> CliResult<PeerRef> {
    text.parse()
        .map_err(|e| CliError::Argument(format!("bad peer {}: {}", text, e)))
}

/// Returns false when the user asked to quit
async fn run_line(handle: &MeshHandle, line: &str) -> CliResult<bool> {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("") | None => {}
        Some("/quit") => return Ok(false),
        Some("/peers") => {
            for peer in handle.peers().await? {
                println!(
                    "{} {:<16} {:?} verified={} session={}",
                    peer.peer_id, peer.nickname, peer.state, peer.verified, peer.session_established
                );
            }
        }
        Some("/route") => {
            let peer = parse_peer(parts.next().unwrap_or_default())?;
            println!("{:?}", handle.route(peer).await?);
        }
        Some("/verify") => {
            let peer = parse_peer(parts.next().unwrap_or_default())?;
            handle.verify_peer(peer).await?;
        }
        Some("/msg") => {
            let peer = parse_peer(parts.next().unwrap_or_default())?;
            let text = parts.next().unwrap_or_default();
            let id = handle.send_private(peer, text).await?;
            println!("queued {}", id);
        }
        Some(_) => handle.send_public(line).await?,
    }
    Ok(true)
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::PublicMessage { sender, nickname, text, .. } => {
            println!("<{}|{}> {}", nickname.as_deref().unwrap_or("?"), sender, text)
        }
        MeshEvent::PrivateMessage { sender, text, .. } => println!("[private {}] {}", sender, text),
        MeshEvent::DeliveryAck { peer, id } => println!("delivered {} to {}", id, peer),
        MeshEvent::ReadReceipt { peer, id } => println!("{} read {}", peer, id),
        MeshEvent::PeerAnnounced { peer, nickname, direct } => {
            println!("peer {} ({}) {}", peer, nickname, if *direct { "linked" } else { "heard" })
        }
        MeshEvent::PeerVerified { peer, verified } => println!("peer {} verified={}", peer, verified),
        other => info!(event = ?other, "Mesh event"),
    }
}
