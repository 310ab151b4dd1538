//! Event applier: idempotent merge of incoming events into the catalog.
//!
//! Every event is checked against the dedup index before it touches the
//! catalog, so redelivery is a no-op. Mutations that arrive before the
//! `VideoAdded` they depend on wait in a bounded pending buffer and are
//! replayed, in timestamp order, as soon as the add lands. All work on one
//! uuid runs under that uuid's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use podfed_core::{
    now_millis, validate_event, validate_snapshot_record, EventPayload, PodHost,
    PropagationEvent, SnapshotRecord, VideoRecord, VideoUuid,
};
use podfed_store::Store;
use tracing::{debug, warn};

use crate::error::Result;
use crate::keyed_lock::KeyedLocks;

/// Configuration for the applier.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Maximum events held while waiting for their `VideoAdded`.
    pub pending_capacity: usize,
    /// How long a pending event may wait before it is discarded.
    pub pending_window: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 1024,
            pending_window: Duration::from_secs(30),
        }
    }
}

/// What applying one event did to the local catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The catalog changed.
    Applied,
    /// Already applied (same dedup key), or the record carried nothing new.
    Duplicate,
    /// The video is not known yet; the event waits for its add.
    Buffered,
    /// Superseded by a newer write or targeting a tombstone. Recorded as a no-op.
    ConflictIgnored,
}

/// An event waiting for (or replayed after) the add of its video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEvent {
    pub event: PropagationEvent,
    /// The pod that handed us the event, `None` for local events.
    pub sender: Option<PodHost>,
}

/// Result of [`Applier::apply`] or [`Applier::merge_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    /// Buffered events that were applied because this call created the video.
    pub replayed: Vec<BufferedEvent>,
}

impl ApplyReport {
    fn new(outcome: ApplyOutcome) -> Self {
        Self {
            outcome,
            replayed: Vec::new(),
        }
    }
}

struct PendingEntry {
    buffered: BufferedEvent,
    received_at: Instant,
}

#[derive(Default)]
struct PendingBuffer {
    by_uuid: HashMap<VideoUuid, Vec<PendingEntry>>,
    len: usize,
}

impl PendingBuffer {
    fn push(&mut self, buffered: BufferedEvent, now: Instant, capacity: usize) {
        let key = buffered.event.dedup_key();
        let uuid = buffered.event.video_uuid;
        if self
            .by_uuid
            .get(&uuid)
            .is_some_and(|entries| entries.iter().any(|e| e.buffered.event.dedup_key() == key))
        {
            return;
        }

        if self.len >= capacity.max(1) {
            self.evict_oldest();
        }
        self.by_uuid.entry(uuid).or_default().push(PendingEntry {
            buffered,
            received_at: now,
        });
        self.len += 1;
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_uuid
            .iter()
            .flat_map(|(uuid, entries)| entries.iter().enumerate().map(move |(i, e)| (e.received_at, *uuid, i)))
            .min_by_key(|(at, _, _)| *at);

        if let Some((_, uuid, index)) = oldest {
            if let Some(entries) = self.by_uuid.get_mut(&uuid) {
                let evicted = entries.remove(index);
                warn!(
                    uuid = %uuid,
                    event_type = %evicted.buffered.event.event_type,
                    "pending buffer full; evicted oldest event"
                );
                if entries.is_empty() {
                    self.by_uuid.remove(&uuid);
                }
                self.len -= 1;
            }
        }
    }

    fn take(&mut self, uuid: &VideoUuid) -> Vec<BufferedEvent> {
        let mut entries = self.by_uuid.remove(uuid).unwrap_or_default();
        self.len -= entries.len();
        entries.sort_by(|a, b| a.buffered.event.stamp().cmp(&b.buffered.event.stamp()));
        entries.into_iter().map(|e| e.buffered).collect()
    }

    fn sweep(&mut self, now: Instant, window: Duration) -> usize {
        let mut dropped = 0;
        self.by_uuid.retain(|uuid, entries| {
            entries.retain(|e| {
                let keep = now.saturating_duration_since(e.received_at) < window;
                if !keep {
                    warn!(
                        uuid = %uuid,
                        event_type = %e.buffered.event.event_type,
                        origin = %e.buffered.event.origin,
                        "video never arrived; discarding pending event"
                    );
                    dropped += 1;
                }
                keep
            });
            !entries.is_empty()
        });
        self.len -= dropped;
        dropped
    }
}

pub struct Applier<S> {
    local: PodHost,
    store: Arc<S>,
    config: ApplierConfig,
    locks: KeyedLocks<VideoUuid>,
    pending: Mutex<PendingBuffer>,
}

impl<S: Store> Applier<S> {
    pub fn new(local: PodHost, store: Arc<S>, config: ApplierConfig) -> Self {
        Self {
            local,
            store,
            config,
            locks: KeyedLocks::new(),
            pending: Mutex::new(PendingBuffer::default()),
        }
    }

    /// Validate and merge one event.
    ///
    /// `sender` is the pod that delivered it (`None` for local mutations).
    pub async fn apply(
        &self,
        event: PropagationEvent,
        sender: Option<PodHost>,
    ) -> Result<ApplyReport> {
        if let Err(e) = validate_event(&event) {
            warn!(
                uuid = %event.video_uuid,
                origin = %event.origin,
                error = %e,
                "rejecting invalid event"
            );
            return Err(e.into());
        }

        let _guard = self.locks.lock(&event.video_uuid).await;
        let (outcome, created) = self.apply_locked(&event).await?;
        debug!(
            uuid = %event.video_uuid,
            event_type = %event.event_type,
            origin = %event.origin,
            ts = %event.timestamp,
            ?outcome,
            "applied event"
        );

        let mut report = ApplyReport::new(outcome);
        if outcome == ApplyOutcome::Buffered {
            self.lock_pending().push(
                BufferedEvent { event, sender },
                Instant::now(),
                self.config.pending_capacity,
            );
        } else if created {
            report.replayed = self.replay(&event.video_uuid).await?;
        }
        Ok(report)
    }

    /// Merge one entry of a catalog snapshot.
    ///
    /// Fields merge by per-field last-writer-wins. The view count is never
    /// copied: the carried view events go through the dedup index like any
    /// other event, so views the sender counted are added here exactly once.
    pub async fn merge_record(&self, entry: SnapshotRecord) -> Result<ApplyReport> {
        validate_snapshot_record(&entry)?;
        let SnapshotRecord { mut record, views } = entry;

        let uuid = record.uuid;
        let _guard = self.locks.lock(&uuid).await;
        let existing = self.store.get_video(&uuid).await?;
        let created = existing.is_none();
        let mut outcome = match existing {
            None => {
                record.views = 0;
                let is_local = record.origin == self.local;
                self.store.upsert_video(&record, is_local).await?;
                ApplyOutcome::Applied
            }
            Some(mut video) => {
                if video.record.merge(&record) {
                    video.record.touch();
                    self.store.upsert_video(&video.record, video.is_local).await?;
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Duplicate
                }
            }
        };

        let mut counted = 0;
        for event in &views {
            if self.apply_locked(event).await?.0 == ApplyOutcome::Applied {
                counted += 1;
            }
        }
        if counted > 0 {
            outcome = ApplyOutcome::Applied;
        }

        let mut report = ApplyReport::new(outcome);
        if created {
            report.replayed = self.replay(&uuid).await?;
        }
        debug!(
            uuid = %uuid,
            created,
            views = counted,
            replayed = report.replayed.len(),
            "merged snapshot record"
        );
        Ok(report)
    }

    /// Discard pending events older than the window. Returns how many went.
    pub fn sweep_pending(&self) -> usize {
        self.lock_pending()
            .sweep(Instant::now(), self.config.pending_window)
    }

    /// Number of events waiting for their video.
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingBuffer> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply buffered events for a uuid that now exists. Caller holds the uuid lock.
    async fn replay(&self, uuid: &VideoUuid) -> Result<Vec<BufferedEvent>> {
        let waiting = self.lock_pending().take(uuid);
        let mut replayed = Vec::new();
        for buffered in waiting {
            let (outcome, _) = self.apply_locked(&buffered.event).await?;
            debug!(
                uuid = %uuid,
                event_type = %buffered.event.event_type,
                ?outcome,
                "replayed pending event"
            );
            if outcome == ApplyOutcome::Applied {
                replayed.push(buffered);
            }
        }
        Ok(replayed)
    }

    /// Merge a validated event. Caller holds the uuid lock.
    ///
    /// The dedup key and the changed record are committed together.
    /// Returns the outcome and whether the video was created.
    async fn apply_locked(&self, event: &PropagationEvent) -> Result<(ApplyOutcome, bool)> {
        if self.store.has_applied(&event.dedup_key()).await? {
            return Ok((ApplyOutcome::Duplicate, false));
        }

        let stamp = event.stamp();
        let existing = self.store.get_video(&event.video_uuid).await?;

        let (outcome, created, write) = match (&event.payload, existing) {
            (EventPayload::Added(payload), None) => {
                let record =
                    VideoRecord::from_added(event.video_uuid, event.origin.clone(), payload, &stamp);
                let is_local = event.origin == self.local;
                (ApplyOutcome::Applied, true, Some((record, is_local)))
            }
            (_, None) => return Ok((ApplyOutcome::Buffered, false)),
            (_, Some(video)) if video.is_tombstoned() => {
                // Removal wins; a second removal is a no-op too.
                (ApplyOutcome::ConflictIgnored, false, None)
            }
            (EventPayload::Added(payload), Some(mut video)) => {
                if video.record.apply_added(payload, &stamp) {
                    (ApplyOutcome::Applied, false, Some((video.record, video.is_local)))
                } else {
                    (ApplyOutcome::ConflictIgnored, false, None)
                }
            }
            (EventPayload::Updated(payload), Some(mut video)) => {
                if video.record.apply_update(payload, &stamp) {
                    (ApplyOutcome::Applied, false, Some((video.record, video.is_local)))
                } else {
                    (ApplyOutcome::ConflictIgnored, false, None)
                }
            }
            (EventPayload::Removed, Some(mut video)) => {
                video.record.tombstoned = true;
                video.record.touch();
                (ApplyOutcome::Applied, false, Some((video.record, video.is_local)))
            }
            (EventPayload::ViewsIncremented { delta }, Some(mut video)) => {
                video.record.views = video.record.views.saturating_add(*delta);
                (ApplyOutcome::Applied, false, Some((video.record, video.is_local)))
            }
        };

        let write = write.as_ref().map(|(record, is_local)| (record, *is_local));
        if !self.store.commit_event(event, write, now_millis()).await? {
            return Ok((ApplyOutcome::Duplicate, false));
        }
        Ok((outcome, created))
    }
}
