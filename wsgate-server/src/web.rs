//! HTTP surface: the WebSocket entrypoint and a health endpoint.
//!
//! `GET /ws/{project}/{token}` upgrades to a WebSocket once the handshake
//! checks pass. Failures get a bare 403 so clients learn nothing about
//! which check failed.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::connection::{self, Connection};
use crate::domain::UNKNOWN_ORIGIN;
use crate::server::SharedState;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/ws/{project}/{token}", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The client address, optionally taken from the first `X-Forwarded-For` hop.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// One counted connection for an IP, released on drop.
struct IpSlot {
    state: Arc<SharedState>,
    ip: IpAddr,
}

impl IpSlot {
    fn acquire(state: &Arc<SharedState>, ip: IpAddr) -> Option<Self> {
        let mut ip_conns = state.ip_connections.lock();
        let count = ip_conns.get(&ip).copied().unwrap_or(0);
        if count >= state.config.max_conns_per_ip {
            return None;
        }
        ip_conns.insert(ip, count + 1);
        Some(Self { state: Arc::clone(state), ip })
    }
}

impl Drop for IpSlot {
    fn drop(&mut self) {
        let mut ip_conns = self.state.ip_connections.lock();
        if let Some(count) = ip_conns.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ip_conns.remove(&self.ip);
            }
        }
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path((project, token)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let ip = client_ip(&headers, addr, state.config.trust_forwarded_for);
    let Some(slot) = IpSlot::acquire(&state, ip) else {
        tracing::warn!(%ip, "WebSocket connection rejected: per-IP limit reached");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    };

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    match state.gatekeeper.authenticate(&project, &token, origin).await {
        Ok(admission) => {
            // Registered before the 101 goes out. If the upgrade never
            // completes, dropping `conn` deregisters it.
            let (mut conn, rx) = Connection::new(
                admission,
                &state.config,
                Arc::clone(&state.registry),
                Arc::clone(&state.backplane),
            );
            let handles = conn.open();
            let handle = conn.handle();
            tracing::info!(
                conn_id = handle.id,
                %ip,
                project = %handle.identity.project,
                client_id = %handle.identity.id,
                sendable = handle.sendable,
                extra_claims = handle.claims.len(),
                handles,
                "Connection opened"
            );
            ws.on_upgrade(move |socket| async move {
                let _slot = slot;
                connection::serve(socket, conn, rx, ip).await;
            })
            .into_response()
        }
        Err(e) => {
            tracing::info!(
                %ip,
                %project,
                origin = origin.unwrap_or(UNKNOWN_ORIGIN),
                "Handshake rejected: {e}"
            );
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
    sessions: usize,
    connections: usize,
    cluster_peers: usize,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions: state.registry.session_count(),
        connections: state.registry.connection_count(),
        cluster_peers: state.backplane.peer_count(),
    })
}
