//! Server configuration (command line, with `WSGATE_*` environment fallbacks).

use clap::{Parser, ValueEnum};

/// How the `exp` claim of a connection token is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExpiryPolicy {
    /// Never look at `exp`.
    Ignore,
    /// Enforce `exp` when the token carries one.
    #[default]
    IfPresent,
    /// Reject tokens without `exp`.
    Required,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "wsgate-server", version, about = "Multi-tenant WebSocket gatekeeper and message broker")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "WSGATE_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite project database.
    #[arg(long, env = "WSGATE_DB", default_value = "wsgate.db")]
    pub db_path: String,

    /// Treatment of the token `exp` claim.
    #[arg(long, env = "WSGATE_TOKEN_EXPIRY", value_enum, default_value_t = ExpiryPolicy::IfPresent)]
    pub token_expiry: ExpiryPolicy,

    /// Reject a token the second time it is presented (per instance).
    #[arg(long, env = "WSGATE_SINGLE_USE_TOKENS")]
    pub single_use_tokens: bool,

    /// How long a used token without `exp` stays blocked.
    #[arg(long, env = "WSGATE_REPLAY_TTL_SECS", default_value_t = 86_400)]
    pub replay_ttl_secs: i64,

    /// Inbound frames larger than this are dropped.
    #[arg(long, env = "WSGATE_MAX_FRAME_BYTES", default_value_t = 65_536)]
    pub max_frame_bytes: usize,

    /// Concurrent WebSocket connections allowed per client IP.
    #[arg(long, env = "WSGATE_MAX_CONNS_PER_IP", default_value_t = 20)]
    pub max_conns_per_ip: u32,

    /// Sustained inbound frames per second per connection (burst of the same
    /// size). 0 disables the limit.
    #[arg(long, env = "WSGATE_RATE_LIMIT", default_value_t = 0.0)]
    pub rate_limit: f64,

    /// Outbound frames buffered per connection before it is dropped as too slow.
    #[arg(long, env = "WSGATE_OUTBOUND_QUEUE", default_value_t = 1024)]
    pub outbound_queue: usize,

    /// Take the client IP from the first `X-Forwarded-For` entry.
    #[arg(long, env = "WSGATE_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Name of this node in the mesh (random if unset).
    #[arg(long, env = "WSGATE_NODE_ID")]
    pub node_id: Option<String>,

    /// Address to accept mesh links from other brokers.
    #[arg(long, env = "WSGATE_CLUSTER_LISTEN")]
    pub cluster_listen: Option<String>,

    /// Other brokers to link to (comma-separated host:port).
    #[arg(long, env = "WSGATE_CLUSTER_PEERS", value_delimiter = ',')]
    pub cluster_peers: Vec<String>,

    /// Shared secret authenticating mesh links.
    #[arg(long, env = "WSGATE_CLUSTER_SECRET", hide_env_values = true)]
    pub cluster_secret: Option<String>,
}

impl ServerConfig {
    pub fn clustering_enabled(&self) -> bool {
        self.cluster_listen.is_some() || !self.cluster_peers.is_empty()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: "wsgate.db".to_string(),
            token_expiry: ExpiryPolicy::IfPresent,
            single_use_tokens: false,
            replay_ttl_secs: 86_400,
            max_frame_bytes: 65_536,
            max_conns_per_ip: 20,
            rate_limit: 0.0,
            outbound_queue: 1024,
            trust_forwarded_for: false,
            node_id: None,
            cluster_listen: None,
            cluster_peers: Vec::new(),
            cluster_secret: None,
        }
    }
}
