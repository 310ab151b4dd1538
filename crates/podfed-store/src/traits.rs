//! Store trait: the abstract interface for pod persistence.
//!
//! This trait allows the federation engine to be storage-agnostic.
//! Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use podfed_core::{
    ContentId, DedupKey, OutboundItem, Pod, PodHost, PropagationEvent, Video, VideoRecord,
    VideoUuid,
};

use crate::error::Result;

/// An item waiting in a destination's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    /// Position in the queue. Strictly increasing per store.
    pub seq: u64,
    pub destination: PodHost,
    pub item: OutboundItem,
    /// When the item was queued (Unix ms).
    pub enqueued_at: i64,
}

/// The Store trait: async interface for pod persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Catalog upserts are keyed by uuid**: the local `id` is assigned on first
///   insert and never changes; `is_local` is fixed at first insert too.
/// - **Dedup keys are write-once**: `commit_event` reports whether the key
///   was new, and writes the record it carries in the same transaction.
/// - **Outbound queues are FIFO per destination** and survive restarts.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Catalog Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a video by uuid, tombstoned or not.
    async fn get_video(&self, uuid: &VideoUuid) -> Result<Option<Video>>;

    /// Insert or replace the record for `record.uuid`.
    ///
    /// Returns the pod-local id.
    async fn upsert_video(&self, record: &VideoRecord, is_local: bool) -> Result<u64>;

    /// List videos ordered by creation time, then local id.
    async fn list_videos(&self, include_tombstoned: bool) -> Result<Vec<Video>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Pod Directory
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_pod(&self, host: &PodHost) -> Result<Option<Pod>>;

    /// Insert or replace a pod entry.
    async fn upsert_pod(&self, pod: &Pod) -> Result<()>;

    /// All known pods, ordered by host.
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Dedup Index
    // ─────────────────────────────────────────────────────────────────────────

    /// Check whether an event with this key has been applied.
    async fn has_applied(&self, key: &DedupKey) -> Result<bool>;

    /// Record an event as applied and, when `write` is given, store the
    /// record it produced. Both happen or neither does.
    ///
    /// Returns false, writing nothing, if the event's key was already present.
    async fn commit_event(
        &self,
        event: &PropagationEvent,
        write: Option<(&VideoRecord, bool)>,
        at: i64,
    ) -> Result<bool>;

    /// The `ViewsIncremented` events applied for a video, in timestamp order.
    async fn applied_views(&self, uuid: &VideoUuid) -> Result<Vec<PropagationEvent>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound Queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an item to the destination's queue. Returns its sequence number.
    async fn enqueue_outbound(&self, destination: &PodHost, item: &OutboundItem) -> Result<u64>;

    /// The oldest item queued for a destination.
    async fn peek_outbound(&self, destination: &PodHost) -> Result<Option<QueuedItem>>;

    /// Remove a delivered (or abandoned) item.
    async fn ack_outbound(&self, destination: &PodHost, seq: u64) -> Result<()>;

    /// Discard everything queued for a destination. Returns how many items went.
    async fn drop_outbound(&self, destination: &PodHost) -> Result<usize>;

    /// Destinations with at least one queued item.
    async fn outbound_destinations(&self) -> Result<Vec<PodHost>>;

    /// Queue length for one destination, or across all when `None`.
    async fn outbound_len(&self, destination: Option<&PodHost>) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Content References
    // ─────────────────────────────────────────────────────────────────────────

    /// Remember where the file behind a content identifier lives locally.
    async fn put_content_ref(&self, content_id: &ContentId, path: &str) -> Result<()>;

    async fn get_content_ref(&self, content_id: &ContentId) -> Result<Option<String>>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// The directory entry for `host`, or a fresh `Unknown` one.
    fn pod_or_new(
        &self,
        host: &PodHost,
    ) -> impl std::future::Future<Output = Result<Pod>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn pod_or_new(&self, host: &PodHost) -> Result<Pod> {
        Ok(self
            .get_pod(host)
            .await?
            .unwrap_or_else(|| Pod::new(host.clone())))
    }
}
