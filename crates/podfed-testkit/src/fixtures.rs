//! Test fixtures and helpers.
//!
//! A [`Cluster`] is a handful of pods wired together on one in-memory
//! network, sharing a content directory in a temp dir.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use podfed::{LocalSwarm, Pod, PodConfig, Result, SwarmClient, UploadRequest, Video};
use podfed_core::{Keypair, PodHost, VideoUuid};
use podfed_store::MemoryStore;
use podfed_sync::{DrainReport, MemoryNetwork, MemoryTransport, MessageHandler, RetryPolicy};
use tempfile::TempDir;

pub type TestPod = Pod<MemoryStore, MemoryTransport>;

/// Upper bound on propagation rounds in [`Cluster::settle`].
const MAX_SETTLE_ROUNDS: usize = 32;

/// Retries that finish in milliseconds and never sleep a random amount.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        jitter: false,
    }
}

/// Host of the `index`-th pod: `localhost:9001`, `localhost:9002`, ...
pub fn pod_host(index: usize) -> PodHost {
    PodHost::localhost(9001 + index as u16)
}

/// Several pods on one memory network.
pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub pods: Vec<Arc<TestPod>>,
    dir: TempDir,
}

impl Cluster {
    /// `count` pods with gossip off and fast retries.
    pub async fn new(count: usize) -> Result<Self> {
        Self::with_config(count, |config| config).await
    }

    /// `count` pods, each config passed through `customize` first.
    pub async fn with_config(
        count: usize,
        customize: impl Fn(PodConfig) -> PodConfig,
    ) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let network = MemoryNetwork::new();
        let swarm: Arc<dyn SwarmClient> =
            Arc::new(LocalSwarm::open(dir.path().join("swarm")).await?);

        let mut pods = Vec::with_capacity(count);
        for index in 0..count {
            let host = pod_host(index);
            let mut config = PodConfig::new(host.clone()).with_gossip(false);
            config.propagator.retry = fast_retry();
            let config = customize(config);

            let mut seed = [0u8; 32];
            seed[0] = index as u8;
            let pod = Arc::new(Pod::new(
                config,
                Keypair::from_seed(&seed),
                Arc::new(MemoryStore::new()),
                Arc::new(network.transport(host.clone())),
                Arc::clone(&swarm),
            ));
            let handler: Weak<dyn MessageHandler> = Arc::downgrade(&pod) as _;
            network.register(host, handler).await;
            pods.push(pod);
        }

        Ok(Self { network, pods, dir })
    }

    pub fn pod(&self, index: usize) -> &Arc<TestPod> {
        &self.pods[index]
    }

    pub fn host(&self, index: usize) -> PodHost {
        pod_host(index)
    }

    /// Scratch directory for upload files.
    pub fn media_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Upload a video whose file contents are its name.
    pub async fn upload(&self, index: usize, name: &str) -> Result<Video> {
        self.upload_bytes(index, name, name.as_bytes()).await
    }

    /// Upload a video with the given file contents.
    pub async fn upload_bytes(&self, index: usize, name: &str, bytes: &[u8]) -> Result<Video> {
        let file = self
            .dir
            .path()
            .join(format!("{}-{}.webm", index, VideoUuid::new_v4()));
        tokio::fs::write(&file, bytes).await?;
        self.pod(index)
            .upload(UploadRequest {
                name: name.into(),
                description: "my super description for pod".into(),
                tags: vec!["tag1".into(), "tag2".into()],
                duration: 10,
                author: "root".into(),
                file,
            })
            .await
    }

    /// Take a pod off the network, or put it back.
    pub async fn set_reachable(&self, index: usize, reachable: bool) {
        self.network.set_reachable(&pod_host(index), reachable).await;
    }

    /// Drain every pod's queues until nothing moves and nothing is queued.
    ///
    /// Returns the combined report of every round.
    pub async fn settle(&self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut moved = false;
            for pod in &self.pods {
                let report = pod.propagate_pending().await?;
                moved |= !report.is_idle();
                total.delivered += report.delivered;
                total.exhausted += report.exhausted;
                total.dropped += report.dropped;
                total.demoted.extend(report.demoted);
            }

            let mut queued = 0;
            for pod in &self.pods {
                queued += pod.outbound_pending().await?;
            }
            if !moved && queued == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Flush accumulated views on every pod.
    pub async fn flush_views(&self) -> Result<usize> {
        let mut emitted = 0;
        for pod in &self.pods {
            emitted += pod.flush_views().await?;
        }
        Ok(emitted)
    }

    /// True if every pod holds the same catalog.
    pub async fn converged(&self) -> Result<bool> {
        let mut digests = Vec::with_capacity(self.pods.len());
        for pod in &self.pods {
            digests.push(pod.catalog_digest().await?);
        }
        Ok(digests.windows(2).all(|w| w[0] == w[1]))
    }
}
