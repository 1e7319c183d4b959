//! Shared server state and startup.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::backplane::{Backplane, LocalGroups};
use crate::config::ServerConfig;
use crate::connection::Gatekeeper;
use crate::db::Db;
use crate::mesh::{self, ClusterBackplane};
use crate::project::ProjectLookup;
use crate::registry::SessionRegistry;
use crate::web;

/// State shared by every connection and HTTP handler.
pub struct SharedState {
    pub config: ServerConfig,
    pub node_id: String,
    pub gatekeeper: Gatekeeper,
    pub registry: Arc<SessionRegistry>,
    pub backplane: Arc<dyn Backplane>,
    /// Open WebSocket connections per client IP.
    pub ip_connections: Mutex<HashMap<IpAddr, u32>>,
    pub started_at: Instant,
}

pub struct Server {
    config: ServerConfig,
    projects: Option<Arc<dyn ProjectLookup>>,
}

struct Launched {
    http_addr: SocketAddr,
    cluster_addr: Option<SocketAddr>,
    handle: JoinHandle<Result<()>>,
}

impl Server {
    /// Server reading projects from the SQLite store at `config.db_path`.
    pub fn new(config: ServerConfig) -> Self {
        Self { config, projects: None }
    }

    /// Server reading projects from any directory implementation.
    pub fn with_projects(config: ServerConfig, projects: Arc<dyn ProjectLookup>) -> Self {
        Self { config, projects: Some(projects) }
    }

    /// Run until the HTTP listener fails.
    pub async fn run(self) -> Result<()> {
        self.launch().await?.handle.await?
    }

    /// Start in the background. Returns the bound HTTP address.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let launched = self.launch().await?;
        Ok((launched.http_addr, launched.handle))
    }

    /// Start a clustered node in the background. Returns the bound HTTP and
    /// mesh addresses; `cluster_listen` must be set.
    pub async fn start_cluster(self) -> Result<(SocketAddr, SocketAddr, JoinHandle<Result<()>>)> {
        let launched = self.launch().await?;
        let cluster_addr = launched
            .cluster_addr
            .context("start_cluster requires --cluster-listen")?;
        Ok((launched.http_addr, cluster_addr, launched.handle))
    }

    async fn launch(self) -> Result<Launched> {
        let config = self.config;
        let projects: Arc<dyn ProjectLookup> = match self.projects {
            Some(p) => p,
            None => Arc::new(
                Db::open(&config.db_path)
                    .with_context(|| format!("opening project store {}", config.db_path))?,
            ),
        };

        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{:08x}", rand::random::<u32>()));
        let registry = Arc::new(SessionRegistry::new());

        let mut cluster_addr = None;
        let backplane: Arc<dyn Backplane> = if config.clustering_enabled() {
            let secret = config
                .cluster_secret
                .clone()
                .filter(|s| !s.is_empty())
                .context("--cluster-secret is required when clustering is enabled")?;
            let (manager, mut events) = mesh::start(node_id.clone(), secret);
            let cluster = Arc::new(ClusterBackplane::new(Arc::clone(&manager)));

            let processor = Arc::clone(&cluster);
            let processor_registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    processor.apply_event(event, &processor_registry);
                }
            });

            if let Some(addr) = &config.cluster_listen {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding mesh listener {addr}"))?;
                let local = listener.local_addr()?;
                tracing::info!(%local, %node_id, "Mesh listening");
                cluster_addr = Some(local);
                tokio::spawn(mesh::serve(listener, Arc::clone(&manager)));
            }
            for peer in config.cluster_peers.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
                mesh::connect_peer_with_retry(peer.to_string(), Arc::clone(&manager));
            }
            cluster as Arc<dyn Backplane>
        } else {
            Arc::new(LocalGroups::new())
        };

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("binding {}", config.listen_addr))?;
        let http_addr = listener.local_addr()?;

        let state = Arc::new(SharedState {
            gatekeeper: Gatekeeper::new(projects, &config),
            config,
            node_id,
            registry,
            backplane,
            ip_connections: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        });
        tracing::info!(%http_addr, node_id = %state.node_id, "HTTP/WebSocket listening");

        let app = web::router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .context("HTTP server failed")
        });

        Ok(Launched { http_addr, cluster_addr, handle })
    }
}
