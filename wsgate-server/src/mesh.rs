//! Broker-to-broker mesh: carries group publishes and targeted frames
//! between instances so that fan-out reaches every connection of a project,
//! whichever instance it landed on.
//!
//! Links are plain TCP carrying newline-delimited JSON [`MeshMessage`]s.
//! Both ends open with a `hello` whose HMAC (over node id and timestamp,
//! keyed by the shared cluster secret) must verify before anything else
//! is accepted. Every node is expected to be linked to every other node;
//! events are never forwarded beyond the first hop. When two nodes dial
//! each other, the link opened by the lower node id is the one kept.
//!
//! Outbound events go through one ordered broadcast worker so peers see
//! event ids in the order they were assigned. Inbound events are
//! deduplicated per peer (see [`DedupSet`]) and handed to the event
//! processor in `server`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};

use crate::backplane::{Backplane, LocalGroups};
use crate::handle::{ClientIdentity, ConnId, ConnectionHandle};
use crate::registry::SessionRegistry;

/// Longest accepted mesh line. Longer lines drop the link.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Per-peer ring buffer size for event dedup.
const DEDUP_CAPACITY: usize = 10_000;

/// Accepted clock difference for `hello` timestamps.
const HELLO_MAX_SKEW_SECS: i64 = 60;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a dialer whose link lost the tie-break checks whether the
/// winning link is still up.
const STANDBY_POLL: Duration = Duration::from_secs(1);

const HELLO_CONTEXT: &str = "wsgate-mesh-v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeshMessage {
    #[serde(rename = "hello")]
    Hello {
        node_id: String,
        timestamp: i64,
        mac: String,
    },
    /// Fan a frame out to a group on the receiving node.
    #[serde(rename = "publish")]
    Publish {
        event_id: String,
        group: String,
        frame: String,
    },
    /// Deliver a frame to one identity's connections on the receiving node.
    #[serde(rename = "direct")]
    Direct {
        event_id: String,
        project: String,
        receiver: String,
        frame: String,
    },
}

impl MeshMessage {
    fn event_id(&self) -> Option<&str> {
        match self {
            MeshMessage::Hello { .. } => None,
            MeshMessage::Publish { event_id, .. } | MeshMessage::Direct { event_id, .. } => {
                Some(event_id.as_str())
            }
        }
    }

    fn set_event_id(&mut self, id: String) {
        match self {
            MeshMessage::Hello { .. } => {}
            MeshMessage::Publish { event_id, .. } | MeshMessage::Direct { event_id, .. } => {
                *event_id = id;
            }
        }
    }
}

fn hello_mac_bytes(secret: &str, node_id: &str, timestamp: i64) -> Result<HmacSha256, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(format!("{HELLO_CONTEXT}:{node_id}:{timestamp}").as_bytes());
    Ok(mac)
}

/// MAC a node puts in its `hello`.
pub fn hello_mac(secret: &str, node_id: &str, timestamp: i64) -> String {
    match hello_mac_bytes(secret, node_id, timestamp) {
        Ok(mac) => URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()),
        Err(_) => String::new(),
    }
}

/// Check a peer's `hello`: MAC under the shared secret, timestamp within skew.
pub fn verify_hello(secret: &str, node_id: &str, timestamp: i64, mac: &str, now: i64) -> bool {
    if (now - timestamp).abs() > HELLO_MAX_SKEW_SECS {
        return false;
    }
    let Ok(provided) = URL_SAFE_NO_PAD.decode(mac) else {
        return false;
    };
    hello_mac_bytes(secret, node_id, timestamp)
        .map(|m| m.verify_slice(&provided).is_ok())
        .unwrap_or(false)
}

/// Per-peer event dedup.
///
/// Two layers:
/// 1. Monotonic high-water mark on the counter part of `{node}:{counter}`.
///    Anything at or below the mark is stale.
/// 2. Ring buffer of recent ids for exact duplicates.
#[derive(Default)]
pub struct DedupSet {
    inner: Mutex<HashMap<String, PeerDedup>>,
}

#[derive(Default)]
struct PeerDedup {
    high_water: u64,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_counter(event_id: &str) -> Option<u64> {
        event_id.rsplit_once(':').and_then(|(_, c)| c.parse().ok())
    }

    /// Returns true if this event is new.
    pub fn check_and_insert(&self, peer: &str, event_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.entry(peer.to_string()).or_default();

        if let Some(counter) = Self::parse_counter(event_id) {
            if counter <= state.high_water {
                return false;
            }
            state.high_water = counter;
        }

        if state.seen.contains(event_id) {
            return false;
        }
        if state.seen.len() >= DEDUP_CAPACITY {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        state.seen.insert(event_id.to_string());
        state.order.push_back(event_id.to_string());
        true
    }

    /// Forget a disconnected peer. Its counters restart from the wall clock
    /// on reconnect, so the high-water mark goes too.
    pub fn remove_peer(&self, peer: &str) {
        self.inner.lock().remove(peer);
    }
}

/// A live link, tagged with a generation so a stale link's cleanup never
/// removes its replacement. Notifying `shutdown` closes the link.
#[derive(Clone)]
pub struct PeerEntry {
    pub tx: mpsc::Sender<MeshMessage>,
    pub conn_gen: u64,
    pub shutdown: Arc<Notify>,
}

/// An inbound event, tagged with the peer whose `hello` authenticated the link.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    pub peer_id: String,
    pub msg: MeshMessage,
}

pub struct MeshManager {
    pub node_id: String,
    secret: String,
    peers: tokio::sync::Mutex<HashMap<String, PeerEntry>>,
    peer_count: AtomicUsize,
    event_tx: mpsc::Sender<MeshEvent>,
    event_counter: AtomicU64,
    dedup: DedupSet,
    broadcast_tx: mpsc::Sender<MeshMessage>,
    conn_gen: AtomicU64,
}

impl MeshManager {
    /// `{node_id}:{counter}`, strictly increasing for this node.
    pub fn next_event_id(&self) -> String {
        let counter = self.event_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}", self.node_id, counter)
    }

    /// Queue a message for ordered delivery to all peers. The worker
    /// stamps the event id, so ids leave this node in increasing order.
    pub fn broadcast(&self, msg: MeshMessage) {
        if self.broadcast_tx.try_send(msg).is_err() {
            tracing::warn!("Mesh broadcast queue full or closed");
        }
    }

    /// Never waits on a peer: a link whose write queue is full is dropped
    /// and left to reconnect.
    async fn broadcast_to_peers(&self, mut msg: MeshMessage) {
        msg.set_event_id(self.next_event_id());
        let targets: Vec<(String, PeerEntry)> = self
            .peers
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        for (peer_id, entry) in targets {
            match entry.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(peer = %peer_id, "Mesh peer not keeping up, dropping link");
                    self.remove_peer(&peer_id, entry.conn_gen).await;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(peer = %peer_id, "Mesh broadcast: link already closing");
                }
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    pub async fn is_linked(&self, peer_id: &str) -> bool {
        self.peers.lock().await.contains_key(peer_id)
    }

    /// Register a link. Two nodes that dial each other get two links; both
    /// ends keep the one opened by the lower node id. Returns `false` when
    /// this link lost that tie-break and must be closed.
    async fn insert_peer(&self, peer_id: &str, entry: PeerEntry, opened_by_us: bool) -> bool {
        let opener = if opened_by_us { self.node_id.as_str() } else { peer_id };
        let preferred = opener == self.node_id.as_str().min(peer_id);

        let mut peers = self.peers.lock().await;
        if let Some(existing) = peers.get(peer_id) {
            if !preferred {
                tracing::info!(peer = %peer_id, conn_gen = entry.conn_gen, "Redundant mesh link, keeping existing");
                return false;
            }
            tracing::info!(peer = %peer_id, conn_gen = entry.conn_gen, "Duplicate mesh link, replacing existing");
            existing.shutdown.notify_one();
        }
        peers.insert(peer_id.to_string(), entry);
        self.peer_count.store(peers.len(), Ordering::Relaxed);
        true
    }

    async fn remove_peer(&self, peer_id: &str, conn_gen: u64) {
        let mut peers = self.peers.lock().await;
        if peers.get(peer_id).is_some_and(|e| e.conn_gen == conn_gen) {
            if let Some(entry) = peers.remove(peer_id) {
                entry.shutdown.notify_one();
            }
            self.dedup.remove_peer(peer_id);
            tracing::info!(peer = %peer_id, "Mesh peer removed");
        }
        self.peer_count.store(peers.len(), Ordering::Relaxed);
    }
}

/// Create the mesh manager and its ordered broadcast worker.
///
/// Returns the manager and the stream of authenticated inbound events.
pub fn start(node_id: String, secret: String) -> (Arc<MeshManager>, mpsc::Receiver<MeshEvent>) {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<MeshMessage>(1024);

    let manager = Arc::new(MeshManager {
        node_id,
        secret,
        peers: tokio::sync::Mutex::new(HashMap::new()),
        peer_count: AtomicUsize::new(0),
        event_tx,
        // Seeded from the wall clock so a restarted node keeps issuing
        // increasing ids.
        event_counter: AtomicU64::new(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64,
        ),
        dedup: DedupSet::new(),
        broadcast_tx,
        conn_gen: AtomicU64::new(0),
    });

    let worker = Arc::clone(&manager);
    tokio::spawn(async move {
        while let Some(msg) = broadcast_rx.recv().await {
            worker.broadcast_to_peers(msg).await;
        }
    });

    (manager, event_rx)
}

/// Accept mesh links until the listener fails.
pub async fn serve(listener: TcpListener, manager: Arc<MeshManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "Incoming mesh connection");
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    handle_link(stream, &manager, true).await;
                });
            }
            Err(e) => {
                tracing::error!("Mesh accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Keep a link to `addr` up, reconnecting with exponential backoff.
pub fn connect_peer_with_retry(addr: String, manager: Arc<MeshManager>) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);

        loop {
            tracing::info!(peer_addr = %addr, "Connecting to mesh peer");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    backoff = Duration::from_secs(1);
                    if let Some(peer_id) = handle_link(stream, &manager, false).await {
                        // Stand by while the peer's own link to us is up.
                        while manager.is_linked(&peer_id).await {
                            tokio::time::sleep(STANDBY_POLL).await;
                        }
                    }
                    tracing::warn!(peer_addr = %addr, "Mesh link dropped, will reconnect");
                }
                Err(e) => {
                    tracing::warn!(
                        peer_addr = %addr,
                        backoff_secs = backoff.as_secs(),
                        "Mesh connect failed: {e}"
                    );
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    });
}

async fn write_message(w: &mut OwnedWriteHalf, msg: &MeshMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_string(msg).map_err(std::io::Error::other)?;
    line.push('\n');
    w.write_all(line.as_bytes()).await
}

/// Read one line, bounded by [`MAX_LINE_LEN`]. `Ok(None)` on EOF.
async fn read_message_line<R>(reader: &mut R, line: &mut String) -> std::io::Result<Option<()>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    line.clear();
    let n = reader.take(MAX_LINE_LEN as u64 + 1).read_line(line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "mesh line too long"));
    }
    Ok(Some(()))
}

/// Run one link (either direction) until it drops. Returns the peer's node
/// id once its `hello` authenticated.
async fn handle_link(stream: TcpStream, manager: &Arc<MeshManager>, incoming: bool) -> Option<String> {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let now = chrono::Utc::now().timestamp();
    let hello = MeshMessage::Hello {
        node_id: manager.node_id.clone(),
        timestamp: now,
        mac: hello_mac(&manager.secret, &manager.node_id, now),
    };
    if let Err(e) = write_message(&mut write_half, &hello).await {
        tracing::warn!(incoming, "Mesh hello send failed: {e}");
        return None;
    }

    let peer_id = match tokio::time::timeout(HELLO_TIMEOUT, read_message_line(&mut reader, &mut line)).await {
        Ok(Ok(Some(()))) => match serde_json::from_str::<MeshMessage>(line.trim_end()) {
            Ok(MeshMessage::Hello { node_id, timestamp, mac }) => {
                let now = chrono::Utc::now().timestamp();
                if node_id == manager.node_id {
                    tracing::warn!(incoming, "Mesh peer claims our own node id, dropping");
                    return None;
                }
                if !verify_hello(&manager.secret, &node_id, timestamp, &mac, now) {
                    tracing::warn!(peer = %node_id, incoming, "Mesh hello failed authentication");
                    return None;
                }
                node_id
            }
            _ => {
                tracing::warn!(incoming, "Mesh link did not open with hello");
                return None;
            }
        },
        Ok(Ok(None)) => {
            tracing::debug!(incoming, "Mesh link closed before hello");
            return None;
        }
        Ok(Err(e)) => {
            tracing::warn!(incoming, "Mesh hello read failed: {e}");
            return None;
        }
        Err(_) => {
            tracing::warn!(incoming, "Mesh hello timed out");
            return None;
        }
    };

    let (write_tx, mut write_rx) = mpsc::channel::<MeshMessage>(256);
    let my_gen = manager.conn_gen.fetch_add(1, Ordering::Relaxed);
    let shutdown = Arc::new(Notify::new());
    let entry = PeerEntry { tx: write_tx, conn_gen: my_gen, shutdown: Arc::clone(&shutdown) };
    if !manager.insert_peer(&peer_id, entry, !incoming).await {
        return Some(peer_id);
    }
    tracing::info!(peer = %peer_id, incoming, "Mesh link established");

    let write_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = write_rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &msg).await {
                tracing::warn!(peer = %write_peer, "Mesh write failed: {e}");
                break;
            }
        }
    });

    let mut received: u64 = 0;
    loop {
        let read = tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!(peer = %peer_id, received, "Mesh link closed locally");
                break;
            }
            read = read_message_line(&mut reader, &mut line) => read,
        };
        match read {
            Ok(Some(())) => {}
            Ok(None) => {
                tracing::info!(peer = %peer_id, received, "Mesh link EOF");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer_id, received, "Mesh read error: {e}");
                break;
            }
        }
        let msg = match serde_json::from_str::<MeshMessage>(line.trim_end()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %peer_id, "Mesh invalid JSON: {e}");
                continue;
            }
        };
        let Some(event_id) = msg.event_id() else {
            continue;
        };
        if !manager.dedup.check_and_insert(&peer_id, event_id) {
            tracing::debug!(peer = %peer_id, event_id, "Mesh duplicate event dropped");
            continue;
        }
        received += 1;
        if manager
            .event_tx
            .send(MeshEvent { peer_id: peer_id.clone(), msg })
            .await
            .is_err()
        {
            break;
        }
    }

    writer.abort();
    manager.remove_peer(&peer_id, my_gen).await;
    Some(peer_id)
}

/// Backplane spanning every node in the mesh.
///
/// Local members are served straight from the in-process table; everything
/// is also broadcast to peers, which fan out to their own members.
pub struct ClusterBackplane {
    local: LocalGroups,
    mesh: Arc<MeshManager>,
}

impl ClusterBackplane {
    pub fn new(mesh: Arc<MeshManager>) -> Self {
        Self { local: LocalGroups::new(), mesh }
    }

    /// Apply an event received from a peer to this node's connections.
    pub fn apply_event(&self, event: MeshEvent, registry: &SessionRegistry) {
        match event.msg {
            MeshMessage::Publish { group, frame, .. } => {
                let n = self.local.fan_out(&group, &Arc::from(frame), None);
                tracing::trace!(peer = %event.peer_id, group, delivered = n, "Remote publish");
            }
            MeshMessage::Direct { project, receiver, frame, .. } => {
                let identity = ClientIdentity::new(project, receiver);
                let frame: Arc<str> = Arc::from(frame);
                for handle in registry.lookup(&identity) {
                    handle.deliver(Arc::clone(&frame));
                }
            }
            MeshMessage::Hello { .. } => {}
        }
    }
}

impl Backplane for ClusterBackplane {
    fn join_group(&self, group: &str, handle: Arc<ConnectionHandle>) {
        self.local.join_group(group, handle);
    }

    fn leave_group(&self, group: &str, conn: ConnId) {
        self.local.leave_group(group, conn);
    }

    fn publish(&self, group: &str, frame: Arc<str>, exclude: Option<ConnId>) {
        self.local.fan_out(group, &frame, exclude);
        self.mesh.broadcast(MeshMessage::Publish {
            event_id: String::new(),
            group: group.to_string(),
            frame: frame.to_string(),
        });
    }

    fn relay_direct(&self, receiver: &ClientIdentity, frame: Arc<str>) {
        self.mesh.broadcast(MeshMessage::Direct {
            event_id: String::new(),
            project: receiver.project.clone(),
            receiver: receiver.id.clone(),
            frame: frame.to_string(),
        });
    }

    fn peer_count(&self) -> usize {
        self.mesh.peer_count()
    }
}
