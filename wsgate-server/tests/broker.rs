//! End-to-end broker tests: real server on 127.0.0.1:0, real WebSocket clients.
//!
//! Covers:
//! - Handshake admission and the bare 403 on every rejection
//! - Broadcast, targeted delivery, multi-connection identities
//! - Project isolation and receive-only clients
//! - Cleanup on disconnect, per-IP cap, single-use tokens
//! - Health endpoint and the SQLite-backed startup path

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use wsgate_server::config::ServerConfig;
use wsgate_server::db::Db;
use wsgate_server::project::RuleKind;
use wsgate_server::server::Server;
use wsgate_server::token;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);
const ACME_ORIGIN: Option<&str> = Some("https://app.acme.com");

struct TestBroker {
    addr: SocketAddr,
    db: Arc<Db>,
    _handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestBroker {
    async fn start(config: ServerConfig) -> Self {
        let db = Arc::new(Db::open_memory().unwrap());
        db.create_project("acme", false, None).unwrap();
        db.add_domain_rule("acme", "*.acme.com", RuleKind::Allow).unwrap();
        db.add_domain_rule("acme", "beta.acme.com", RuleKind::Deny).unwrap();
        db.create_project("globex", true, None).unwrap();

        let config = ServerConfig { listen_addr: "127.0.0.1:0".to_string(), ..config };
        let (addr, handle) = Server::with_projects(config, db.clone()).start().await.unwrap();
        Self { addr, db, _handle: handle }
    }

    fn token(&self, project: &str, claims: Value) -> String {
        let secret = self.db.get_project(project).unwrap().unwrap().secret;
        token::sign(&claims, &secret).unwrap()
    }

    async fn connect(&self, project: &str, claims: Value, origin: Option<&str>) -> Ws {
        let token = self.token(project, claims);
        try_connect(self.addr, project, &token, origin).await.unwrap()
    }

    async fn health(&self) -> Value {
        reqwest::get(format!("http://{}/api/v1/health", self.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Cleanup after a disconnect finishes after the client's close.
    async fn wait_for_connections(&self, n: u64) {
        for _ in 0..100 {
            if self.health().await["connections"] == json!(n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("broker never reached {n} connections");
    }
}

async fn try_connect(
    addr: SocketAddr,
    project: &str,
    token: &str,
    origin: Option<&str>,
) -> Result<Ws, tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws/{project}/{token}").into_client_request()?;
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_str(origin).unwrap());
    }
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

fn assert_rejected(result: Result<Ws, tungstenite::Error>, status: u16) {
    match result {
        Err(tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), status);
            assert!(
                resp.body().as_ref().is_none_or(|b| b.is_empty()),
                "rejection leaked a body"
            );
        }
        Err(e) => panic!("expected HTTP {status}, got {e}"),
        Ok(_) => panic!("expected HTTP {status}, connection was accepted"),
    }
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(Duration::from_millis(300), ws.next()).await {
        panic!("unexpected frame: {}", text.as_str());
    }
}

// ── Routing ────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_everyone_but_sender() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    let mut c = broker.connect("acme", json!({"id": "c"}), ACME_ORIGIN).await;
    broker.wait_for_connections(3).await;

    send(&mut a, json!({"message": "hi"})).await;
    assert_eq!(recv_json(&mut b).await, json!({"sender": "a", "message": "hi"}));
    assert_eq!(recv_json(&mut c).await, json!({"sender": "a", "message": "hi"}));
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn targeted_message_reaches_only_receiver() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    let mut c = broker.connect("acme", json!({"id": "c"}), ACME_ORIGIN).await;
    broker.wait_for_connections(3).await;

    send(&mut a, json!({"message": {"k": 1}, "receivers": ["b"]})).await;
    assert_eq!(recv_json(&mut b).await, json!({"sender": "a", "message": {"k": 1}}));
    assert_silent(&mut c).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn every_connection_of_an_identity_receives() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b1 = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    let mut b2 = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    broker.wait_for_connections(3).await;
    assert_eq!(broker.health().await["sessions"], json!(2));

    send(&mut a, json!({"message": "x", "receivers": "b"})).await;
    assert_eq!(recv_json(&mut b1).await["message"], "x");
    assert_eq!(recv_json(&mut b2).await["message"], "x");
}

#[tokio::test]
async fn broadcast_reaches_senders_other_tabs() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a1 = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut a2 = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;

    send(&mut a1, json!({"message": "everyone"})).await;
    assert_eq!(recv_json(&mut a2).await, json!({"sender": "a", "message": "everyone"}));
    assert_eq!(recv_json(&mut b).await, json!({"sender": "a", "message": "everyone"}));
    assert_silent(&mut a1).await;
}

#[tokio::test]
async fn client_is_reachable_as_soon_as_handshake_completes() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;

    for i in 0..30 {
        let id = format!("b{i}");
        let mut b = broker.connect("acme", json!({"id": id}), ACME_ORIGIN).await;
        send(&mut a, json!({"message": i, "receivers": id})).await;
        assert_eq!(recv_json(&mut b).await, json!({"sender": "a", "message": i}));
    }
}

#[tokio::test]
async fn bursts_are_not_rate_limited_by_default() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;

    for i in 0..50 {
        send(&mut a, json!({"message": i})).await;
    }
    for i in 0..50 {
        assert_eq!(recv_json(&mut b).await["message"], json!(i));
    }
}

#[tokio::test]
async fn self_targeted_message_reaches_other_tabs_only() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a1 = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut a2 = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    broker.wait_for_connections(2).await;

    send(&mut a1, json!({"message": "sync", "receivers": ["a"]})).await;
    assert_eq!(recv_json(&mut a2).await, json!({"sender": "a", "message": "sync"}));
    assert_silent(&mut a1).await;
}

#[tokio::test]
async fn projects_are_isolated() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut other = broker.connect("globex", json!({"id": "b"}), Some("https://globex.io")).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    broker.wait_for_connections(3).await;

    send(&mut a, json!({"message": "acme only"})).await;
    send(&mut a, json!({"message": "for b", "receivers": ["b"]})).await;
    assert_eq!(recv_json(&mut b).await["message"], "acme only");
    assert_eq!(recv_json(&mut b).await["message"], "for b");
    assert_silent(&mut other).await;
}

#[tokio::test]
async fn receive_only_client_is_muted() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut quiet = broker.connect("acme", json!({"id": "q", "sendable": false}), ACME_ORIGIN).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    broker.wait_for_connections(2).await;

    send(&mut quiet, json!({"message": "let me talk"})).await;
    assert_silent(&mut a).await;

    send(&mut a, json!({"message": "you listen"})).await;
    assert_eq!(recv_json(&mut quiet).await["message"], "you listen");
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    broker.wait_for_connections(2).await;

    a.send(Message::Text("{not json".to_string().into())).await.unwrap();
    send(&mut a, json!({"msg": "wrong key"})).await;
    send(&mut a, json!({"message": "ok"})).await;
    assert_eq!(recv_json(&mut b).await["message"], "ok");
}

#[tokio::test]
async fn oversized_frames_are_dropped() {
    let config = ServerConfig { max_frame_bytes: 128, ..Default::default() };
    let broker = TestBroker::start(config).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    broker.wait_for_connections(2).await;

    send(&mut a, json!({"message": "x".repeat(512)})).await;
    send(&mut a, json!({"message": "small"})).await;
    assert_eq!(recv_json(&mut b).await["message"], "small");
}

// ── Handshake ──────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_rejections_are_bare_403() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let good = broker.token("acme", json!({"id": "a"}));
    let now = chrono::Utc::now().timestamp();

    // Unknown project
    assert_rejected(try_connect(broker.addr, "initech", &good, ACME_ORIGIN).await, 403);
    // Origin not allowed, explicitly denied, opaque, absent
    assert_rejected(try_connect(broker.addr, "acme", &good, Some("https://evil.com")).await, 403);
    assert_rejected(try_connect(broker.addr, "acme", &good, Some("https://beta.acme.com")).await, 403);
    assert_rejected(try_connect(broker.addr, "acme", &good, Some("null")).await, 403);
    assert_rejected(try_connect(broker.addr, "acme", &good, None).await, 403);
    // Token signed for another project
    let foreign = broker.token("globex", json!({"id": "a"}));
    assert_rejected(try_connect(broker.addr, "acme", &foreign, ACME_ORIGIN).await, 403);
    // Garbage, missing id, expired
    assert_rejected(try_connect(broker.addr, "acme", "not.a.token", ACME_ORIGIN).await, 403);
    let anonymous = broker.token("acme", json!({"name": "a"}));
    assert_rejected(try_connect(broker.addr, "acme", &anonymous, ACME_ORIGIN).await, 403);
    let expired = broker.token("acme", json!({"id": "a", "exp": now - 10}));
    assert_rejected(try_connect(broker.addr, "acme", &expired, ACME_ORIGIN).await, 403);

    assert_eq!(broker.health().await["connections"], json!(0));
    // The valid token still works.
    try_connect(broker.addr, "acme", &good, ACME_ORIGIN).await.unwrap();
}

#[tokio::test]
async fn project_name_is_case_insensitive_and_allow_any_admits_missing_origin() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let token = broker.token("globex", json!({"id": 7}));
    try_connect(broker.addr, "GLOBEX", &token, None).await.unwrap();
}

#[tokio::test]
async fn rotated_secret_invalidates_old_tokens() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let old = broker.token("acme", json!({"id": "a"}));
    let mut open = try_connect(broker.addr, "acme", &old, ACME_ORIGIN).await.unwrap();
    broker.db.rotate_secret("acme").unwrap();

    assert_rejected(try_connect(broker.addr, "acme", &old, ACME_ORIGIN).await, 403);
    let mut fresh = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    broker.wait_for_connections(2).await;

    // The connection opened under the old secret is untouched.
    send(&mut open, json!({"message": "still here"})).await;
    assert_eq!(recv_json(&mut fresh).await["message"], "still here");
}

#[tokio::test]
async fn single_use_tokens_open_one_connection() {
    let config = ServerConfig { single_use_tokens: true, ..Default::default() };
    let broker = TestBroker::start(config).await;
    let token = broker.token("acme", json!({"id": "a"}));
    let _first = try_connect(broker.addr, "acme", &token, ACME_ORIGIN).await.unwrap();
    assert_rejected(try_connect(broker.addr, "acme", &token, ACME_ORIGIN).await, 403);
}

#[tokio::test]
async fn per_ip_connection_cap() {
    let config = ServerConfig { max_conns_per_ip: 2, ..Default::default() };
    let broker = TestBroker::start(config).await;
    let token = broker.token("acme", json!({"id": "a"}));
    let _one = try_connect(broker.addr, "acme", &token, ACME_ORIGIN).await.unwrap();
    let mut two = try_connect(broker.addr, "acme", &token, ACME_ORIGIN).await.unwrap();
    assert_rejected(try_connect(broker.addr, "acme", &token, ACME_ORIGIN).await, 429);

    // Freed on disconnect.
    two.close(None).await.unwrap();
    broker.wait_for_connections(1).await;
    let mut admitted = false;
    for _ in 0..50 {
        if try_connect(broker.addr, "acme", &token, ACME_ORIGIN).await.is_ok() {
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(admitted, "slot was never released");
}

// ── Lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_removes_session() {
    let broker = TestBroker::start(ServerConfig::default()).await;
    let mut a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    let mut b = broker.connect("acme", json!({"id": "b"}), ACME_ORIGIN).await;
    broker.wait_for_connections(2).await;

    b.close(None).await.unwrap();
    broker.wait_for_connections(1).await;
    assert_eq!(broker.health().await["sessions"], json!(1));

    // Routing to the departed identity is a silent no-op.
    send(&mut a, json!({"message": "anyone?", "receivers": ["b"]})).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn health_reports_node_state() {
    let config = ServerConfig { node_id: Some("edge-1".into()), ..Default::default() };
    let broker = TestBroker::start(config).await;
    let _a = broker.connect("acme", json!({"id": "a"}), ACME_ORIGIN).await;
    broker.wait_for_connections(1).await;

    let health = broker.health().await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["node_id"], "edge-1");
    assert_eq!(health["sessions"], json!(1));
    assert_eq!(health["cluster_peers"], json!(0));
    assert!(health["uptime_secs"].is_u64());
}

#[tokio::test]
async fn starts_from_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wsgate.db");
    let secret = {
        let db = Db::open(&path).unwrap();
        let p = db.create_project("acme", true, None).unwrap();
        p.secret
    };

    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".into(),
        db_path: path.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let (addr, _handle) = Server::new(config).start().await.unwrap();
    let token = token::sign(&json!({"id": "a"}), &secret).unwrap();
    try_connect(addr, "acme", &token, Some("https://anywhere.dev")).await.unwrap();
}
