//! Per-client connection actor.
//!
//! A connection moves `Connecting -> Open -> Closed`:
//! - [`handshake`] admits or rejects the upgrade request (Connecting).
//! - [`Connection::open`] registers the handle with the session registry
//!   and the project group (Open). The upgrade handler runs it before the
//!   101 response goes out.
//! - Inbound frames are gated (sendable, size, rate) and handed to
//!   [`routing`]; outbound frames drain from the handle's queue.
//! - [`Connection::close`] (also run on drop) removes both registrations (Closed).

pub mod handshake;
pub mod routing;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backplane::Backplane;
use crate::config::ServerConfig;
use crate::handle::ConnectionHandle;
use crate::registry::SessionRegistry;

pub use handshake::{Admission, Gatekeeper, HandshakeError};
pub use routing::RouteOutcome;

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Inbound token bucket. A non-positive rate disables limiting.
struct RateLimiter {
    tokens: f64,
    max: f64,
    refill: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(per_sec: f64) -> Self {
        Self { tokens: per_sec, max: per_sec, refill: per_sec, last: Instant::now() }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        if self.max <= 0.0 {
            return true;
        }
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill).min(self.max);
        self.last = now;
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

pub struct Connection {
    state: ConnectionState,
    handle: Arc<ConnectionHandle>,
    registry: Arc<SessionRegistry>,
    backplane: Arc<dyn Backplane>,
    limiter: RateLimiter,
    max_frame_bytes: usize,
}

impl Connection {
    /// Build the actor for an admitted client. Nothing is registered yet.
    pub fn new(
        admission: Admission,
        config: &ServerConfig,
        registry: Arc<SessionRegistry>,
        backplane: Arc<dyn Backplane>,
    ) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (handle, rx) = ConnectionHandle::new(
            admission.identity,
            admission.sendable,
            admission.claims,
            config.outbound_queue,
        );
        let conn = Self {
            state: ConnectionState::Connecting,
            handle,
            registry,
            backplane,
            limiter: RateLimiter::new(config.rate_limit),
            max_frame_bytes: config.max_frame_bytes,
        };
        (conn, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Register with the session and the project group. Returns how many
    /// handles the identity now has.
    pub fn open(&mut self) -> usize {
        let handles = self.registry.register(&self.handle);
        self.backplane
            .join_group(self.handle.group(), Arc::clone(&self.handle));
        self.state = ConnectionState::Open;
        handles
    }

    /// Handle one inbound text frame. `None` when the frame was dropped
    /// before routing.
    pub fn on_text(&mut self, text: &str) -> Option<RouteOutcome> {
        if self.state != ConnectionState::Open {
            return None;
        }
        if !self.handle.sendable {
            tracing::trace!(conn_id = self.handle.id, "Ignoring frame from receive-only client");
            return None;
        }
        if text.len() > self.max_frame_bytes {
            tracing::debug!(conn_id = self.handle.id, len = text.len(), "Frame too large, dropping");
            return None;
        }
        if !self.limiter.try_take(Instant::now()) {
            tracing::debug!(conn_id = self.handle.id, "Rate limited");
            return None;
        }
        let outcome =
            routing::route(&self.handle, text, &self.registry, self.backplane.as_ref());
        if outcome == RouteOutcome::Malformed {
            tracing::debug!(conn_id = self.handle.id, "Malformed frame dropped");
        }
        Some(outcome)
    }

    /// Leave the group and the session. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Open {
            self.backplane.leave_group(self.handle.group(), self.handle.id);
            let remaining = self.registry.deregister(&self.handle.identity, self.handle.id);
            tracing::debug!(conn_id = self.handle.id, remaining, "Deregistered");
        }
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drive an admitted WebSocket until either side goes away. `conn` is
/// already open, so frames routed to it before the upgrade completed are
/// waiting in `rx`.
pub async fn serve(mut socket: WebSocket, mut conn: Connection, mut rx: mpsc::Receiver<Arc<str>>, ip: IpAddr) {
    let conn_id = conn.handle.id;

    loop {
        if !conn.handle.is_healthy() {
            tracing::info!(conn_id, "Outbound queue overflowed, disconnecting");
            break;
        }
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        conn.on_text(text.as_str());
                    }
                    Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            conn.on_text(text);
                        }
                        Err(_) => tracing::debug!(conn_id, "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, "WebSocket read error: {e}");
                        break;
                    }
                }
            }
            out = rx.recv() => {
                match out {
                    Some(frame) => {
                        let msg = WsMessage::Text(frame.to_string().into());
                        match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(msg)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => {
                                tracing::debug!(conn_id, "WebSocket send failed or timed out");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    conn.close();
    tracing::info!(conn_id, %ip, "Connection closed");
    let _ = socket.send(WsMessage::Close(None)).await;
}
