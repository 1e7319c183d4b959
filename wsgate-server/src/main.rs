use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (WSGATE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("WSGATE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("wsgate_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = wsgate_server::config::ServerConfig::parse();
    tracing::info!("Starting wsgate on {}", config.listen_addr);
    if config.clustering_enabled() {
        tracing::info!(
            listen = config.cluster_listen.as_deref().unwrap_or("-"),
            peers = config.cluster_peers.len(),
            "Cluster mesh enabled"
        );
    }

    let server = wsgate_server::server::Server::new(config);
    server.run().await
}
