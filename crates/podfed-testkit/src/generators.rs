//! Proptest generators for property-based testing.

use proptest::prelude::*;

use podfed_core::{
    ContentId, EventPayload, LogicalTimestamp, PodHost, PropagationEvent, VideoAddedPayload,
    VideoUpdatedPayload, VideoUuid,
};

/// Hosts generated events come from.
pub const HOSTS: [&str; 3] = ["a.example", "b.example", "c.example"];

/// Generate one of the [`HOSTS`].
pub fn pod_host() -> impl Strategy<Value = PodHost> {
    prop::sample::select(&HOSTS[..]).prop_filter_map("invalid host", |h| PodHost::new(h).ok())
}

/// Generate a non-nil video uuid.
pub fn video_uuid() -> impl Strategy<Value = VideoUuid> {
    any::<[u8; 16]>()
        .prop_filter("nil uuid", |b| b.iter().any(|&x| x != 0))
        .prop_map(VideoUuid::from_bytes)
}

/// Generate a video name.
pub fn video_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9 ]{0,23}".prop_map(String::from)
}

/// Generate a tag list.
pub fn tags() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,8}", 0..=4)
}

/// Generate the payload of a new video.
pub fn added_payload() -> impl Strategy<Value = VideoAddedPayload> {
    (video_name(), "[a-z ]{0,40}", tags(), 1u32..=7200, any::<[u8; 8]>()).prop_map(
        |(name, description, tags, duration, content)| VideoAddedPayload {
            name,
            description,
            tags,
            duration,
            author: "root".into(),
            content_id: ContentId::from_content(&content),
            thumbnail_path: String::new(),
            created_at: 1_000,
        },
    )
}

/// Generate an update carrying at least one field.
pub fn updated_payload() -> impl Strategy<Value = VideoUpdatedPayload> {
    (
        prop::option::of(video_name()),
        prop::option::of("[a-z ]{0,40}".prop_map(String::from)),
        prop::option::of(tags()),
    )
        .prop_filter_map("empty update", |(name, description, tags)| {
            let payload = VideoUpdatedPayload {
                name,
                description,
                tags,
            };
            (!payload.is_empty()).then_some(payload)
        })
}

/// A mutation following the initial `VideoAdded`.
#[derive(Debug, Clone)]
pub enum Mutation {
    Update(VideoUpdatedPayload),
    Views(u64),
    Remove,
}

fn mutation(allow_remove: bool) -> BoxedStrategy<Mutation> {
    let update = updated_payload().prop_map(Mutation::Update);
    let views = (1u64..=5).prop_map(Mutation::Views);
    if allow_remove {
        prop_oneof![4 => update, 4 => views, 1 => Just(Mutation::Remove)].boxed()
    } else {
        prop_oneof![update, views].boxed()
    }
}

/// Everything that happened to one video, in the order it happened.
///
/// Timestamps strictly increase, so no two events share a dedup key.
#[derive(Debug, Clone)]
pub struct History {
    pub uuid: VideoUuid,
    pub origin: PodHost,
    pub events: Vec<PropagationEvent>,
}

impl History {
    pub fn contains_removal(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::Removed))
    }

    /// Sum of every view delta in the history.
    pub fn total_views(&self) -> u64 {
        self.events
            .iter()
            .map(|e| match e.payload {
                EventPayload::ViewsIncremented { delta } => delta,
                _ => 0,
            })
            .sum()
    }
}

fn history_with(allow_remove: bool) -> impl Strategy<Value = History> {
    (
        video_uuid(),
        pod_host(),
        added_payload(),
        prop::collection::vec((mutation(allow_remove), pod_host()), 0..12),
    )
        .prop_map(|(uuid, origin, added, mutations)| {
            let mut events = vec![PropagationEvent::new(
                uuid,
                origin.clone(),
                LogicalTimestamp(1),
                EventPayload::Added(added),
            )];
            for (i, (mutation, viewer)) in mutations.into_iter().enumerate() {
                let ts = LogicalTimestamp(i as u64 + 2);
                // Only the origin edits or removes; views come from anywhere.
                let event = match mutation {
                    Mutation::Update(u) => {
                        PropagationEvent::new(uuid, origin.clone(), ts, EventPayload::Updated(u))
                    }
                    Mutation::Remove => {
                        PropagationEvent::new(uuid, origin.clone(), ts, EventPayload::Removed)
                    }
                    Mutation::Views(delta) => PropagationEvent::new(
                        uuid,
                        viewer,
                        ts,
                        EventPayload::ViewsIncremented { delta },
                    ),
                };
                events.push(event);
            }
            History {
                uuid,
                origin,
                events,
            }
        })
}

/// Generate a history that may include removals.
pub fn history() -> impl Strategy<Value = History> {
    history_with(true)
}

/// Generate a history with no removal.
pub fn live_history() -> impl Strategy<Value = History> {
    history_with(false)
}

/// Generate a history together with a permutation of its events.
pub fn shuffled<H>(history: H) -> impl Strategy<Value = (History, Vec<PropagationEvent>)>
where
    H: Strategy<Value = History>,
{
    history.prop_flat_map(|h| {
        let events = h.events.clone();
        (Just(h), Just(events).prop_shuffle())
    })
}
