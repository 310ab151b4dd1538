//! The local pod directory.
//!
//! Owns every read-modify-write of a [`Pod`] entry. The negotiator and the
//! propagator both change pod entries (state, score, last seen); routing
//! them through one lock keeps those updates from overwriting each other.

use std::sync::Arc;

use podfed_core::{now_millis, Pod, PodHost, RelationshipState};
use podfed_store::{Store, StoreExt};
use tokio::sync::Mutex;

use crate::error::Result;

pub struct PodDirectory<S> {
    store: Arc<S>,
    write_lock: Mutex<()>,
}

impl<S: Store> PodDirectory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, host: &PodHost) -> Result<Option<Pod>> {
        Ok(self.store.get_pod(host).await?)
    }

    /// Current state, `Unknown` for hosts never seen.
    pub async fn state_of(&self, host: &PodHost) -> Result<RelationshipState> {
        Ok(self
            .store
            .get_pod(host)
            .await?
            .map(|p| p.state)
            .unwrap_or(RelationshipState::Unknown))
    }

    /// All known pods, ordered by host.
    pub async fn list(&self) -> Result<Vec<Pod>> {
        Ok(self.store.list_pods().await?)
    }

    /// Hosts currently in state `Friend`.
    pub async fn friends(&self) -> Result<Vec<PodHost>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(Pod::is_friend)
            .map(|p| p.host)
            .collect())
    }

    /// Atomically read, modify and write back the entry for `host`.
    ///
    /// The entry is created as `Unknown` if missing. Returns the closure's result.
    pub async fn update<F, R>(&self, host: &PodHost, f: F) -> Result<R>
    where
        F: FnOnce(&mut Pod) -> R + Send,
        R: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut pod = self.store.pod_or_new(host).await?;
        let before = pod.clone();
        let out = f(&mut pod);
        if pod != before {
            self.store.upsert_pod(&pod).await?;
        }
        Ok(out)
    }

    /// Refresh `last_seen_at` for a pod we just heard from.
    ///
    /// Hosts not in the directory are not added.
    pub async fn touch(&self, host: &PodHost) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut pod) = self.store.get_pod(host).await? {
            pod.last_seen_at = now_millis();
            self.store.upsert_pod(&pod).await?;
        }
        Ok(())
    }
}
