//! Swarm references: the seam between the catalog and the content swarm.
//!
//! The pod never moves video bytes itself. At upload it asks a
//! [`SwarmClient`] to seed the file and gets back a [`ContentId`]; on
//! playback it asks for a local path for that identifier. The identifier
//! depends only on the file bytes, so every pod derives the same one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use podfed_core::ContentId;
use podfed_store::Store;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{PodError, Result};

/// A content-distribution swarm.
///
/// One client is built at startup, shared by reference, and closed at shutdown.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Start seeding a file; returns its identifier.
    async fn seed(&self, path: &Path) -> Result<ContentId>;

    /// Local path of the content, fetching it if needed. `None` if unavailable.
    async fn fetch(&self, content_id: &ContentId) -> Result<Option<PathBuf>>;

    /// Stop seeding and release resources.
    async fn close(&self) -> Result<()>;
}

/// A directory-backed swarm client.
///
/// Seeding copies the file into the content directory under its digest.
/// Pods sharing the directory can fetch each other's content.
pub struct LocalSwarm {
    base_path: PathBuf,
    closed: AtomicBool,
}

impl LocalSwarm {
    /// Open (creating if needed) a content directory.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            closed: AtomicBool::new(false),
        })
    }

    fn content_path(&self, content_id: &ContentId) -> PathBuf {
        self.base_path.join(content_id.digest_hex())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PodError::Swarm("swarm client is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SwarmClient for LocalSwarm {
    async fn seed(&self, path: &Path) -> Result<ContentId> {
        self.ensure_open()?;
        let bytes = fs::read(path)
            .await
            .map_err(|e| PodError::Swarm(format!("cannot read {}: {e}", path.display())))?;
        let content_id = ContentId::from_content(&bytes);

        let target = self.content_path(&content_id);
        if !fs::try_exists(&target).await? {
            fs::write(&target, &bytes).await?;
        }
        debug!(%content_id, path = %path.display(), "seeding file");
        Ok(content_id)
    }

    async fn fetch(&self, content_id: &ContentId) -> Result<Option<PathBuf>> {
        self.ensure_open()?;
        let path = self.content_path(content_id);
        if fs::try_exists(&path).await? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(path = %self.base_path.display(), "swarm client closed");
        }
        Ok(())
    }
}

/// Records which local file backs each content identifier.
pub struct SwarmReferenceManager<S> {
    client: Arc<dyn SwarmClient>,
    store: Arc<S>,
}

impl<S: Store> SwarmReferenceManager<S> {
    pub fn new(client: Arc<dyn SwarmClient>, store: Arc<S>) -> Self {
        Self { client, store }
    }

    /// Seed `path` and remember it as the file behind the returned identifier.
    pub async fn register_file(&self, path: &Path) -> Result<ContentId> {
        let content_id = self.client.seed(path).await?;
        self.store
            .put_content_ref(&content_id, &path.to_string_lossy())
            .await?;
        info!(%content_id, path = %path.display(), "registered file");
        Ok(content_id)
    }

    /// Local path for an identifier.
    ///
    /// Known references whose file still exists win; anything else is asked
    /// of the swarm.
    pub async fn resolve(&self, content_id: &ContentId) -> Result<PathBuf> {
        if let Some(path) = self.store.get_content_ref(content_id).await? {
            let path = PathBuf::from(path);
            if fs::try_exists(&path).await? {
                return Ok(path);
            }
            debug!(%content_id, path = %path.display(), "referenced file is gone; asking swarm");
        }

        match self.client.fetch(content_id).await? {
            Some(path) => {
                self.store
                    .put_content_ref(content_id, &path.to_string_lossy())
                    .await?;
                Ok(path)
            }
            None => Err(PodError::ContentNotFound(content_id.to_string())),
        }
    }

    /// Shut the swarm client down.
    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podfed_store::MemoryStore;

    async fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_same_bytes_same_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = LocalSwarm::open(dir.path().join("swarm")).await.unwrap();

        let a = write(dir.path(), "a.webm", b"video bytes").await;
        let b = write(dir.path(), "b.webm", b"video bytes").await;
        let c = write(dir.path(), "c.webm", b"other bytes").await;

        let id_a = swarm.seed(&a).await.unwrap();
        assert_eq!(id_a, swarm.seed(&b).await.unwrap());
        assert_ne!(id_a, swarm.seed(&c).await.unwrap());
        assert!(id_a.as_str().starts_with("magnet:?xt=urn:blake3:"));
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let swarm: Arc<dyn SwarmClient> =
            Arc::new(LocalSwarm::open(dir.path().join("swarm")).await.unwrap());
        let manager = SwarmReferenceManager::new(swarm, Arc::new(MemoryStore::new()));

        let file = write(dir.path(), "upload.webm", b"payload").await;
        let id = manager.register_file(&file).await.unwrap();
        assert_eq!(manager.resolve(&id).await.unwrap(), file);

        // The upload is gone; the swarm still has the seeded copy.
        fs::remove_file(&file).await.unwrap();
        let fetched = manager.resolve(&id).await.unwrap();
        assert_ne!(fetched, file);
        assert_eq!(fs::read(&fetched).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let swarm: Arc<dyn SwarmClient> = Arc::new(LocalSwarm::open(dir.path()).await.unwrap());
        let manager = SwarmReferenceManager::new(swarm, Arc::new(MemoryStore::new()));

        let err = manager
            .resolve(&ContentId::from_content(b"never seeded"))
            .await
            .unwrap_err();
        assert!(matches!(err, PodError::ContentNotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_client_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = LocalSwarm::open(dir.path()).await.unwrap();
        let file = write(dir.path(), "x", b"x").await;
        swarm.close().await.unwrap();
        assert!(matches!(swarm.seed(&file).await, Err(PodError::Swarm(_))));
    }
}
