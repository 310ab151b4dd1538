//! Propagation events: one catalog mutation, broadcast to friends.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ContentId, LogicalTimestamp, PodHost, Stamp, VideoUuid};
use crate::video::VideoRecord;

/// Discriminator for the mutation an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    VideoAdded,
    VideoUpdated,
    VideoRemoved,
    ViewsIncremented,
}

impl EventType {
    /// Stable wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::VideoAdded => "video_added",
            EventType::VideoUpdated => "video_updated",
            EventType::VideoRemoved => "video_removed",
            EventType::ViewsIncremented => "views_incremented",
        }
    }

    /// Integer code used in canonical encodings.
    pub fn to_u8(&self) -> u8 {
        match self {
            EventType::VideoAdded => 1,
            EventType::VideoUpdated => 2,
            EventType::VideoRemoved => 3,
            EventType::ViewsIncremented => 4,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full description of a freshly uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoAddedPayload {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub duration: u32,
    pub author: String,
    pub content_id: ContentId,
    pub thumbnail_path: String,
    pub created_at: i64,
}

/// The fields an update changes; absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUpdatedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl VideoUpdatedPayload {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.tags.is_none()
    }
}

/// Event payload, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Added(VideoAddedPayload),
    Updated(VideoUpdatedPayload),
    Removed,
    ViewsIncremented { delta: u64 },
}

impl EventPayload {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Added(_) => EventType::VideoAdded,
            EventPayload::Updated(_) => EventType::VideoUpdated,
            EventPayload::Removed => EventType::VideoRemoved,
            EventPayload::ViewsIncremented { .. } => EventType::ViewsIncremented,
        }
    }
}

/// A single catalog mutation as it travels between pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationEvent {
    pub event_type: EventType,
    pub video_uuid: VideoUuid,
    /// The pod that generated the event.
    pub origin: PodHost,
    pub timestamp: LogicalTimestamp,
    pub payload: EventPayload,
}

impl PropagationEvent {
    /// Build an event; the type is taken from the payload.
    pub fn new(
        video_uuid: VideoUuid,
        origin: PodHost,
        timestamp: LogicalTimestamp,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_type: payload.event_type(),
            video_uuid,
            origin,
            timestamp,
            payload,
        }
    }

    /// The key under which this event is recorded as applied.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            video_uuid: self.video_uuid,
            event_type: self.event_type,
            timestamp: self.timestamp,
            origin: self.origin.clone(),
        }
    }

    /// The write stamp used for last-writer-wins comparisons.
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.timestamp, self.origin.clone())
    }
}

/// `(videoUuid, eventType, logicalTimestamp, originPodHost)`.
///
/// Two deliveries with the same key are the same event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub video_uuid: VideoUuid,
    pub event_type: EventType,
    pub timestamp: LogicalTimestamp,
    pub origin: PodHost,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.video_uuid, self.event_type, self.timestamp, self.origin
        )
    }
}

/// One video of a catalog snapshot.
///
/// The record's own `views` is not trusted by the receiver. The count is
/// rebuilt from `views`, the `ViewsIncremented` events the sender applied,
/// so events the receiver sees again later are skipped by their dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub record: VideoRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub views: Vec<PropagationEvent>,
}

impl SnapshotRecord {
    pub fn new(record: VideoRecord, views: Vec<PropagationEvent>) -> Self {
        Self { record, views }
    }

    /// Sum of the carried view deltas.
    pub fn view_total(&self) -> u64 {
        self.views
            .iter()
            .map(|e| match e.payload {
                EventPayload::ViewsIncremented { delta } => delta,
                _ => 0,
            })
            .sum()
    }
}

/// Work item in a destination's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundItem {
    /// A single mutation.
    Event(PropagationEvent),
    /// One batch of a catalog snapshot for a new friend.
    Snapshot(Vec<SnapshotRecord>),
}

impl OutboundItem {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundItem::Event(e) => e.event_type.as_str(),
            OutboundItem::Snapshot(_) => "snapshot",
        }
    }
}
