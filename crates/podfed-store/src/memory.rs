//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use podfed_core::{
    now_millis, ContentId, DedupKey, EventType, OutboundItem, Pod, PodHost, PropagationEvent,
    Video, VideoRecord, VideoUuid,
};

use crate::error::{Result, StoreError};
use crate::traits::{QueuedItem, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Catalog indexed by uuid.
    videos: HashMap<VideoUuid, Video>,
    next_video_id: u64,

    /// Pod directory, ordered by host.
    pods: BTreeMap<PodHost, Pod>,

    applied: HashSet<DedupKey>,
    /// Applied `ViewsIncremented` events per video.
    views: HashMap<VideoUuid, Vec<PropagationEvent>>,

    /// All queued items, ordered by seq.
    outbound: BTreeMap<u64, QueuedItem>,
    next_seq: u64,

    content_refs: HashMap<ContentId, String>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner {
                next_video_id: 1,
                next_seq: 1,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }
}

impl MemoryStoreInner {
    fn upsert_video(&mut self, record: &VideoRecord, is_local: bool) -> u64 {
        if let Some(existing) = self.videos.get_mut(&record.uuid) {
            existing.record = record.clone();
            return existing.id;
        }

        let id = self.next_video_id;
        self.next_video_id += 1;
        self.videos.insert(
            record.uuid,
            Video {
                id,
                is_local,
                record: record.clone(),
            },
        );
        id
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_video(&self, uuid: &VideoUuid) -> Result<Option<Video>> {
        Ok(self.read()?.videos.get(uuid).cloned())
    }

    async fn upsert_video(&self, record: &VideoRecord, is_local: bool) -> Result<u64> {
        Ok(self.write()?.upsert_video(record, is_local))
    }

    async fn list_videos(&self, include_tombstoned: bool) -> Result<Vec<Video>> {
        let inner = self.read()?;
        let mut videos: Vec<Video> = inner
            .videos
            .values()
            .filter(|v| include_tombstoned || !v.record.tombstoned)
            .cloned()
            .collect();
        videos.sort_by_key(|v| (v.record.created_at, v.id));
        Ok(videos)
    }

    async fn get_pod(&self, host: &PodHost) -> Result<Option<Pod>> {
        Ok(self.read()?.pods.get(host).cloned())
    }

    async fn upsert_pod(&self, pod: &Pod) -> Result<()> {
        self.write()?.pods.insert(pod.host.clone(), pod.clone());
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.read()?.pods.values().cloned().collect())
    }

    async fn has_applied(&self, key: &DedupKey) -> Result<bool> {
        Ok(self.read()?.applied.contains(key))
    }

    async fn commit_event(
        &self,
        event: &PropagationEvent,
        write: Option<(&VideoRecord, bool)>,
        _at: i64,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        if !inner.applied.insert(event.dedup_key()) {
            return Ok(false);
        }
        if event.event_type == EventType::ViewsIncremented {
            inner
                .views
                .entry(event.video_uuid)
                .or_default()
                .push(event.clone());
        }
        if let Some((record, is_local)) = write {
            inner.upsert_video(record, is_local);
        }
        Ok(true)
    }

    async fn applied_views(&self, uuid: &VideoUuid) -> Result<Vec<PropagationEvent>> {
        let mut views = self.read()?.views.get(uuid).cloned().unwrap_or_default();
        views.sort_by(|a, b| a.stamp().cmp(&b.stamp()));
        Ok(views)
    }

    async fn enqueue_outbound(&self, destination: &PodHost, item: &OutboundItem) -> Result<u64> {
        let mut inner = self.write()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.outbound.insert(
            seq,
            QueuedItem {
                seq,
                destination: destination.clone(),
                item: item.clone(),
                enqueued_at: now_millis(),
            },
        );
        Ok(seq)
    }

    async fn peek_outbound(&self, destination: &PodHost) -> Result<Option<QueuedItem>> {
        let inner = self.read()?;
        Ok(inner
            .outbound
            .values()
            .find(|q| &q.destination == destination)
            .cloned())
    }

    async fn ack_outbound(&self, destination: &PodHost, seq: u64) -> Result<()> {
        let mut inner = self.write()?;
        if inner
            .outbound
            .get(&seq)
            .is_some_and(|q| &q.destination == destination)
        {
            inner.outbound.remove(&seq);
        }
        Ok(())
    }

    async fn drop_outbound(&self, destination: &PodHost) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.outbound.len();
        inner.outbound.retain(|_, q| &q.destination != destination);
        Ok(before - inner.outbound.len())
    }

    async fn outbound_destinations(&self) -> Result<Vec<PodHost>> {
        let inner = self.read()?;
        let mut hosts: Vec<PodHost> = inner
            .outbound
            .values()
            .map(|q| q.destination.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    async fn outbound_len(&self, destination: Option<&PodHost>) -> Result<usize> {
        let inner = self.read()?;
        Ok(match destination {
            Some(d) => inner.outbound.values().filter(|q| &q.destination == d).count(),
            None => inner.outbound.len(),
        })
    }

    async fn put_content_ref(&self, content_id: &ContentId, path: &str) -> Result<()> {
        self.write()?
            .content_refs
            .insert(content_id.clone(), path.to_string());
        Ok(())
    }

    async fn get_content_ref(&self, content_id: &ContentId) -> Result<Option<String>> {
        Ok(self.read()?.content_refs.get(content_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podfed_core::{EventPayload, LogicalTimestamp, SnapshotRecord, Stamp, VideoAddedPayload};

    fn record(created_at: i64) -> VideoRecord {
        let origin = PodHost::new("localhost:9001").unwrap();
        VideoRecord::from_added(
            VideoUuid::new_v4(),
            origin.clone(),
            &VideoAddedPayload {
                name: "v".into(),
                description: String::new(),
                tags: vec![],
                duration: 1,
                author: "root".into(),
                content_id: ContentId::from_content(b"v"),
                thumbnail_path: String::new(),
                created_at,
            },
            &Stamp::new(LogicalTimestamp(1), origin),
        )
    }

    #[tokio::test]
    async fn test_ids_assigned_once() {
        let store = MemoryStore::new();
        let a = record(5);
        let b = record(1);
        assert_eq!(store.upsert_video(&a, true).await.unwrap(), 1);
        assert_eq!(store.upsert_video(&b, false).await.unwrap(), 2);
        assert_eq!(store.upsert_video(&a, false).await.unwrap(), 1);
        assert!(store.get_video(&a.uuid).await.unwrap().unwrap().is_local);

        let listed: Vec<u64> = store
            .list_videos(false)
            .await
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(listed, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_commit_event_is_all_or_nothing() {
        let store = MemoryStore::new();
        let mut r = record(1);
        let (uuid, origin) = (r.uuid, r.origin.clone());
        store.upsert_video(&r, true).await.unwrap();

        let view = |ts| {
            PropagationEvent::new(
                uuid,
                origin.clone(),
                LogicalTimestamp(ts),
                EventPayload::ViewsIncremented { delta: 2 },
            )
        };
        r.views = 2;
        assert!(store.commit_event(&view(5), Some((&r, true)), 0).await.unwrap());

        // Same key again: nothing is written.
        let mut stale = r.clone();
        stale.views = 99;
        assert!(!store.commit_event(&view(5), Some((&stale, true)), 0).await.unwrap());
        assert_eq!(store.get_video(&r.uuid).await.unwrap().unwrap().record.views, 2);

        store.commit_event(&view(3), None, 0).await.unwrap();
        let timestamps: Vec<u64> = store
            .applied_views(&r.uuid)
            .await
            .unwrap()
            .iter()
            .map(|e| e.timestamp.as_u64())
            .collect();
        assert_eq!(timestamps, vec![3, 5]);
        assert!(store.has_applied(&view(3).dedup_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_outbound_per_destination() {
        let store = MemoryStore::new();
        let a = PodHost::new("a.example").unwrap();
        let b = PodHost::new("b.example").unwrap();
        let s1 = store
            .enqueue_outbound(&a, &OutboundItem::Snapshot(vec![]))
            .await
            .unwrap();
        store
            .enqueue_outbound(&b, &OutboundItem::Snapshot(vec![SnapshotRecord::new(record(1), vec![])]))
            .await
            .unwrap();

        // Acking with the wrong destination is a no-op.
        store.ack_outbound(&b, s1).await.unwrap();
        assert_eq!(store.outbound_len(None).await.unwrap(), 2);

        assert_eq!(store.peek_outbound(&a).await.unwrap().unwrap().seq, s1);
        assert_eq!(store.drop_outbound(&b).await.unwrap(), 1);
        assert_eq!(store.outbound_destinations().await.unwrap(), vec![a]);
    }
}
