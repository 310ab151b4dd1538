//! # podfed-server
//!
//! A federated video pod served over HTTP.
//!
//! This binary provides:
//! - **REST API** (axum) for uploading, listing, editing and deleting videos
//! - **Pod administration** endpoints to befriend and remove other pods
//! - **Federation inbox** where friend pods deliver handshakes, catalog
//!   events and snapshots
//! - **Background propagation** with retries, plus periodic view flushing

mod api;
mod config;
mod error;
mod transport;

use std::sync::Arc;

use podfed::core::Keypair;
use podfed::store::SqliteStore;
use podfed::{LocalSwarm, Pod, SwarmClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::transport::HttpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,podfed_server=debug,podfed=debug")),
        )
        .init();

    info!("Starting podfed server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        host = %config.pod_host,
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        gossip = config.gossip,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize storage, the swarm and the pod identity
    // -----------------------------------------------------------------------
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    tokio::fs::create_dir_all(&config.media_path).await?;
    let swarm: Arc<dyn SwarmClient> = Arc::new(LocalSwarm::open(&config.swarm_path).await?);

    let keypair = match &config.key_seed {
        Some(seed) => Keypair::from_seed(seed),
        None => {
            warn!("PODFED_KEY_SEED not set; using an ephemeral signing key");
            Keypair::generate()
        }
    };

    // -----------------------------------------------------------------------
    // 4. Assemble the pod and spawn its background tasks
    // -----------------------------------------------------------------------
    let transport = Arc::new(HttpTransport::new(
        config.pod_host.clone(),
        config.federation_scheme.clone(),
        config.request_timeout,
    )?);
    let pod = Arc::new(Pod::new(
        config.pod_config(),
        keypair,
        store,
        transport,
        swarm,
    ));
    info!(fingerprint = %pod.fingerprint(), "Pod identity ready");
    pod.start();

    let http_addr = config.http_addr;
    let app_state = AppState {
        pod: Arc::clone(&pod),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                pod.shutdown().await?;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // -----------------------------------------------------------------------
    // 6. Stop background tasks and flush pending views
    // -----------------------------------------------------------------------
    pod.shutdown().await?;

    Ok(())
}
