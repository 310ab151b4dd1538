//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so a pod can start with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use podfed::core::PodHost;
use podfed::PodConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host other pods use to reach this one.
    /// Env: `POD_HOST`
    /// Default: `localhost:9000`
    pub pod_host: PodHost,

    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:9000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./pod.db`
    pub database_path: PathBuf,

    /// Where uploaded files are kept.
    /// Env: `MEDIA_PATH`
    /// Default: `./media`
    pub media_path: PathBuf,

    /// Content directory of the local swarm client.
    /// Env: `SWARM_PATH`
    /// Default: `./swarm`
    pub swarm_path: PathBuf,

    /// Scheme used to reach other pods.
    /// Env: `FEDERATION_SCHEME`
    /// Default: `http`
    pub federation_scheme: String,

    /// Pass events from friends on to our other friends.
    /// Env: `GOSSIP` (true/false)
    /// Default: `true`
    pub gossip: bool,

    /// Env: `VIEW_FLUSH_MS`
    /// Default: `5000`
    pub view_flush_interval: Duration,

    /// Delivery attempts per outbound item.
    /// Env: `MAX_ATTEMPTS`
    /// Default: `5`
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    /// Env: `RETRY_BASE_MS`
    /// Default: `500`
    pub retry_base: Duration,

    /// Seed of the pod's signing key (64 hex chars).
    /// Env: `KEY_SEED_HEX`
    /// Default: none (a fresh key every start).
    pub key_seed: Option<[u8; 32]>,

    /// Timeout of one federation request.
    pub request_timeout: Duration,

    /// Maximum upload size in bytes (1 GiB).
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pod_host: PodHost::localhost(9000),
            http_addr: ([0, 0, 0, 0], 9000).into(),
            database_path: PathBuf::from("./pod.db"),
            media_path: PathBuf::from("./media"),
            swarm_path: PathBuf::from("./swarm"),
            federation_scheme: "http".to_string(),
            gossip: true,
            view_flush_interval: Duration::from_millis(5000),
            max_attempts: 5,
            retry_base: Duration::from_millis(500),
            key_seed: None,
            request_timeout: Duration::from_secs(10),
            max_upload_size: 1024 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = var("POD_HOST") {
            match PodHost::new(&host) {
                Ok(parsed) => config.pod_host = parsed,
                Err(e) => tracing::warn!(value = %host, error = %e, "Invalid POD_HOST, using default"),
            }
        }

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = var("MEDIA_PATH") {
            config.media_path = PathBuf::from(path);
        }
        if let Some(path) = var("SWARM_PATH") {
            config.swarm_path = PathBuf::from(path);
        }

        if let Some(scheme) = var("FEDERATION_SCHEME") {
            if scheme == "http" || scheme == "https" {
                config.federation_scheme = scheme;
            } else {
                tracing::warn!(value = %scheme, "Invalid FEDERATION_SCHEME, using default");
            }
        }

        if let Some(val) = var("GOSSIP") {
            config.gossip = val != "false" && val != "0";
        }

        if let Some(val) = var("VIEW_FLUSH_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.view_flush_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid VIEW_FLUSH_MS, using default"),
            }
        }

        if let Some(val) = var("MAX_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_attempts = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_ATTEMPTS, using default"),
            }
        }

        if let Some(val) = var("RETRY_BASE_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.retry_base = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %val, "Invalid RETRY_BASE_MS, using default"),
            }
        }

        if let Some(seed) = var("KEY_SEED_HEX") {
            match parse_seed(&seed) {
                Ok(bytes) => config.key_seed = Some(bytes),
                Err(e) => tracing::warn!(error = %e, "Invalid KEY_SEED_HEX, generating a key"),
            }
        }

        config
    }

    /// The pod settings this server runs with.
    pub fn pod_config(&self) -> PodConfig {
        let mut pod = PodConfig::new(self.pod_host.clone())
            .with_gossip(self.gossip)
            .with_view_flush_interval(self.view_flush_interval);
        pod.propagator.retry.max_attempts = self.max_attempts;
        pod.propagator.retry.initial_delay = self.retry_base;
        pod
    }
}

/// Parse a 64-character hex string into a 32-byte seed.
fn parse_seed(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(s.trim()).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
}
