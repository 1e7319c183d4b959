//! The delivery side of one live WebSocket connection.
//!
//! A [`ConnectionHandle`] is shared (behind `Arc`) by the session registry,
//! the group table and the connection task. Everyone else only ever pushes
//! frames into its bounded queue; the connection task owns the socket.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// `(project, id)`: who a connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity {
    pub project: String,
    pub id: String,
}

impl ClientIdentity {
    pub fn new(project: impl Into<String>, id: impl Into<String>) -> Self {
        Self { project: project.into(), id: id.into() }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The connection task has gone away.
    Closed,
    /// The outbound queue was full; the connection is now marked unhealthy.
    Overflow,
}

#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnId,
    pub identity: ClientIdentity,
    /// Whether inbound frames from this connection are routed.
    pub sendable: bool,
    /// Claims left over after `id` and `sendable` were consumed.
    pub claims: Map<String, Value>,
    tx: mpsc::Sender<Arc<str>>,
    healthy: AtomicBool,
}

impl ConnectionHandle {
    /// Create a handle with an outbound queue of `queue_depth` frames.
    pub fn new(
        identity: ClientIdentity,
        sendable: bool,
        claims: Map<String, Value>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            sendable,
            claims,
            tx,
            healthy: AtomicBool::new(true),
        });
        (handle, rx)
    }

    /// The group this connection belongs to: its project.
    pub fn group(&self) -> &str {
        &self.identity.project
    }

    /// Queue a frame without waiting.
    pub fn deliver(&self, frame: Arc<str>) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                if self.healthy.swap(false, Ordering::Relaxed) {
                    tracing::warn!(conn_id = self.id, identity = %self.identity, "Outbound queue full, dropping connection");
                }
                Delivery::Overflow
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// False once a delivery overflowed the queue.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
