//! Video catalog entries and their last-writer-wins merge rules.
//!
//! A [`VideoRecord`] is the replicable part of a video: everything except the
//! pod-local primary key and the `is_local` flag. Each mutable field group
//! carries the [`Stamp`] of the write that last set it, so merges are
//! commutative and idempotent regardless of arrival order.

use serde::{Deserialize, Serialize};

use crate::event::{VideoAddedPayload, VideoUpdatedPayload};
use crate::types::{now_millis, ContentId, PodHost, Stamp, VideoUuid};

/// Stamp of the last write to each mutable field group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStamps {
    pub name: Stamp,
    pub description: Stamp,
    pub tags: Stamp,
    /// Duration, author, content identifier, thumbnail and creation time.
    pub metadata: Stamp,
}

impl FieldStamps {
    /// Every group stamped by the same write.
    pub fn uniform(stamp: &Stamp) -> Self {
        Self {
            name: stamp.clone(),
            description: stamp.clone(),
            tags: stamp.clone(),
            metadata: stamp.clone(),
        }
    }
}

/// The replicable projection of a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub uuid: VideoUuid,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Duration in seconds.
    pub duration: u32,
    pub author: String,
    /// The pod the video was uploaded to.
    pub origin: PodHost,
    pub content_id: ContentId,
    pub thumbnail_path: String,
    pub views: u64,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds of the last local change. Pod-local bookkeeping,
    /// not part of the replicated state.
    pub updated_at: i64,
    pub tombstoned: bool,
    pub stamps: FieldStamps,
}

impl VideoRecord {
    /// Build the first version of a record from a `VideoAdded` payload.
    pub fn from_added(
        uuid: VideoUuid,
        origin: PodHost,
        payload: &VideoAddedPayload,
        stamp: &Stamp,
    ) -> Self {
        Self {
            uuid,
            name: payload.name.clone(),
            description: payload.description.clone(),
            tags: payload.tags.clone(),
            duration: payload.duration,
            author: payload.author.clone(),
            origin,
            content_id: payload.content_id.clone(),
            thumbnail_path: payload.thumbnail_path.clone(),
            views: 0,
            created_at: payload.created_at,
            updated_at: payload.created_at,
            tombstoned: false,
            stamps: FieldStamps::uniform(stamp),
        }
    }

    /// Overwrite every field group the stamp is strictly newer for.
    ///
    /// Returns true if anything changed.
    pub fn apply_added(&mut self, payload: &VideoAddedPayload, stamp: &Stamp) -> bool {
        let mut changed = false;
        if *stamp > self.stamps.name {
            self.name = payload.name.clone();
            self.stamps.name = stamp.clone();
            changed = true;
        }
        if *stamp > self.stamps.description {
            self.description = payload.description.clone();
            self.stamps.description = stamp.clone();
            changed = true;
        }
        if *stamp > self.stamps.tags {
            self.tags = payload.tags.clone();
            self.stamps.tags = stamp.clone();
            changed = true;
        }
        if *stamp > self.stamps.metadata {
            self.duration = payload.duration;
            self.author = payload.author.clone();
            self.content_id = payload.content_id.clone();
            self.thumbnail_path = payload.thumbnail_path.clone();
            self.created_at = payload.created_at;
            self.stamps.metadata = stamp.clone();
            changed = true;
        }
        if changed {
            self.touch();
        }
        changed
    }

    /// Apply the fields an update carries, field by field.
    ///
    /// Returns true if anything changed.
    pub fn apply_update(&mut self, payload: &VideoUpdatedPayload, stamp: &Stamp) -> bool {
        let mut changed = false;
        if let Some(name) = &payload.name {
            if *stamp > self.stamps.name {
                self.name = name.clone();
                self.stamps.name = stamp.clone();
                changed = true;
            }
        }
        if let Some(description) = &payload.description {
            if *stamp > self.stamps.description {
                self.description = description.clone();
                self.stamps.description = stamp.clone();
                changed = true;
            }
        }
        if let Some(tags) = &payload.tags {
            if *stamp > self.stamps.tags {
                self.tags = tags.clone();
                self.stamps.tags = stamp.clone();
                changed = true;
            }
        }
        if changed {
            self.touch();
        }
        changed
    }

    /// Merge another replica of the same video into this one.
    ///
    /// Per-field last-writer-wins; the tombstone is sticky. The view count is
    /// left alone: views only ever move by deltas.
    pub fn merge(&mut self, other: &VideoRecord) -> bool {
        let mut changed = false;
        if other.stamps.name > self.stamps.name {
            self.name = other.name.clone();
            self.stamps.name = other.stamps.name.clone();
            changed = true;
        }
        if other.stamps.description > self.stamps.description {
            self.description = other.description.clone();
            self.stamps.description = other.stamps.description.clone();
            changed = true;
        }
        if other.stamps.tags > self.stamps.tags {
            self.tags = other.tags.clone();
            self.stamps.tags = other.stamps.tags.clone();
            changed = true;
        }
        if other.stamps.metadata > self.stamps.metadata {
            self.duration = other.duration;
            self.author = other.author.clone();
            self.content_id = other.content_id.clone();
            self.thumbnail_path = other.thumbnail_path.clone();
            self.created_at = other.created_at;
            self.stamps.metadata = other.stamps.metadata.clone();
            changed = true;
        }
        if other.tombstoned && !self.tombstoned {
            self.tombstoned = true;
            changed = true;
        }
        if other.updated_at > self.updated_at {
            self.updated_at = other.updated_at;
        }
        changed
    }

    /// Mark the record as changed now. Never moves `updated_at` backwards.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(now_millis());
    }
}

/// A video as held in one pod's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    /// Pod-local primary key. Never compared across pods.
    pub id: u64,
    /// True only on the pod the video was uploaded to.
    pub is_local: bool,
    pub record: VideoRecord,
}

impl Video {
    pub fn uuid(&self) -> VideoUuid {
        self.record.uuid
    }

    pub fn is_tombstoned(&self) -> bool {
        self.record.tombstoned
    }
}
