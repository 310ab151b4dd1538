//! Event validation: structural checks applied before anything is merged.
//!
//! Validation is pure. A failing event is rejected permanently, never retried.

use crate::error::ValidationError;
use crate::event::{
    EventPayload, EventType, PropagationEvent, SnapshotRecord, VideoAddedPayload,
    VideoUpdatedPayload,
};
use crate::video::VideoRecord;

/// Field limits for catalog content.
pub mod limits {
    pub const MAX_TAGS: usize = 16;
    pub const MAX_TAG_LEN: usize = 64;
    pub const MAX_NAME_LEN: usize = 120;
    pub const MAX_DESCRIPTION_LEN: usize = 10_000;
    pub const MAX_AUTHOR_LEN: usize = 120;
}

/// Validate an incoming propagation event.
///
/// This performs:
/// - Identity checks (uuid, origin, timestamp)
/// - Payload/type agreement
/// - Field limits on the payload
pub fn validate_event(event: &PropagationEvent) -> Result<(), ValidationError> {
    // 1. Identity
    if event.video_uuid.is_nil() {
        return Err(ValidationError::NilUuid);
    }
    if event.origin.as_str().is_empty() {
        return Err(ValidationError::MissingOrigin);
    }
    if event.timestamp.as_u64() == 0 {
        return Err(ValidationError::ZeroTimestamp);
    }

    // 2. The declared type must match the payload
    if event.payload.event_type() != event.event_type {
        return Err(ValidationError::PayloadMismatch(event.event_type));
    }

    // 3. Payload
    match &event.payload {
        EventPayload::Added(added) => validate_added(added),
        EventPayload::Updated(updated) => validate_updated(updated),
        EventPayload::Removed => Ok(()),
        EventPayload::ViewsIncremented { delta } => {
            if *delta == 0 {
                Err(ValidationError::ZeroViewDelta)
            } else {
                Ok(())
            }
        }
    }
}

/// Validate a record received in a catalog snapshot.
pub fn validate_record(record: &VideoRecord) -> Result<(), ValidationError> {
    if record.uuid.is_nil() {
        return Err(ValidationError::NilUuid);
    }
    if record.content_id.is_empty() {
        return Err(ValidationError::MissingContentId);
    }
    validate_name(&record.name)?;
    validate_description(&record.description)?;
    validate_tags(&record.tags)
}

/// Validate a snapshot entry: the record, then each view event it carries.
///
/// Carried events must be `ViewsIncremented` events for the same video.
pub fn validate_snapshot_record(entry: &SnapshotRecord) -> Result<(), ValidationError> {
    validate_record(&entry.record)?;
    for event in &entry.views {
        if event.event_type != EventType::ViewsIncremented {
            return Err(ValidationError::PayloadMismatch(event.event_type));
        }
        if event.video_uuid != entry.record.uuid {
            return Err(ValidationError::StructuralError(format!(
                "view event for {} in snapshot of {}",
                event.video_uuid, entry.record.uuid
            )));
        }
        validate_event(event)?;
    }
    Ok(())
}

/// Validate the fields of a new video, as uploaded or as received.
pub fn validate_added(payload: &VideoAddedPayload) -> Result<(), ValidationError> {
    validate_name(&payload.name)?;
    validate_description(&payload.description)?;
    validate_tags(&payload.tags)?;
    if payload.author.chars().count() > limits::MAX_AUTHOR_LEN {
        return Err(ValidationError::TooLong {
            field: "author",
            max: limits::MAX_AUTHOR_LEN,
        });
    }
    if payload.content_id.is_empty() {
        return Err(ValidationError::MissingContentId);
    }
    Ok(())
}

/// Validate the fields an update carries.
pub fn validate_updated(payload: &VideoUpdatedPayload) -> Result<(), ValidationError> {
    if payload.is_empty() {
        return Err(ValidationError::StructuralError(
            "update carries no fields".into(),
        ));
    }
    if let Some(name) = &payload.name {
        validate_name(name)?;
    }
    if let Some(description) = &payload.description {
        validate_description(description)?;
    }
    if let Some(tags) = &payload.tags {
        validate_tags(tags)?;
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.chars().count() > limits::MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "name",
            max: limits::MAX_NAME_LEN,
        });
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), ValidationError> {
    if description.chars().count() > limits::MAX_DESCRIPTION_LEN {
        return Err(ValidationError::TooLong {
            field: "description",
            max: limits::MAX_DESCRIPTION_LEN,
        });
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    if tags.len() > limits::MAX_TAGS {
        return Err(ValidationError::TooManyTags {
            count: tags.len(),
            max: limits::MAX_TAGS,
        });
    }
    if tags.iter().any(|t| t.chars().count() > limits::MAX_TAG_LEN) {
        return Err(ValidationError::TooLong {
            field: "tag",
            max: limits::MAX_TAG_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::types::{ContentId, LogicalTimestamp, PodHost, VideoUuid};
    use proptest::prelude::*;

    fn added() -> VideoAddedPayload {
        VideoAddedPayload {
            name: "clip".into(),
            description: String::new(),
            tags: vec![],
            duration: 5,
            author: "root".into(),
            content_id: ContentId::from_content(b"clip"),
            thumbnail_path: String::new(),
            created_at: 1,
        }
    }

    fn event(payload: EventPayload) -> PropagationEvent {
        PropagationEvent::new(
            VideoUuid::new_v4(),
            PodHost::new("localhost:9001").unwrap(),
            LogicalTimestamp(7),
            payload,
        )
    }

    #[test]
    fn test_valid_events_pass() {
        validate_event(&event(EventPayload::Added(added()))).unwrap();
        validate_event(&event(EventPayload::Removed)).unwrap();
        validate_event(&event(EventPayload::ViewsIncremented { delta: 1 })).unwrap();
        validate_event(&event(EventPayload::Updated(VideoUpdatedPayload {
            tags: Some(vec!["x".into()]),
            ..Default::default()
        })))
        .unwrap();
    }

    #[test]
    fn test_identity_rules() {
        let mut e = event(EventPayload::Removed);
        e.video_uuid = VideoUuid::from_bytes([0u8; 16]);
        assert_eq!(validate_event(&e), Err(ValidationError::NilUuid));

        let mut e = event(EventPayload::Removed);
        e.timestamp = LogicalTimestamp::ZERO;
        assert_eq!(validate_event(&e), Err(ValidationError::ZeroTimestamp));

        let mut e = event(EventPayload::Removed);
        e.event_type = EventType::VideoAdded;
        assert_eq!(
            validate_event(&e),
            Err(ValidationError::PayloadMismatch(EventType::VideoAdded))
        );
    }

    #[test]
    fn test_zero_delta_rejected() {
        assert_eq!(
            validate_event(&event(EventPayload::ViewsIncremented { delta: 0 })),
            Err(ValidationError::ZeroViewDelta)
        );
    }

    #[test]
    fn test_empty_update_rejected() {
        assert!(validate_event(&event(EventPayload::Updated(Default::default()))).is_err());
    }

    #[test]
    fn test_limits() {
        let mut p = added();
        p.tags = (0..=limits::MAX_TAGS).map(|i| i.to_string()).collect();
        assert!(matches!(
            validate_added(&p),
            Err(ValidationError::TooManyTags { .. })
        ));

        let mut p = added();
        p.name = "   ".into();
        assert_eq!(validate_added(&p), Err(ValidationError::EmptyName));

        let mut p = added();
        p.tags = vec!["t".repeat(limits::MAX_TAG_LEN + 1)];
        assert!(matches!(
            validate_added(&p),
            Err(ValidationError::TooLong { field: "tag", .. })
        ));
    }

    #[test]
    fn test_snapshot_views_must_belong_to_the_record() {
        let origin = PodHost::new("localhost:9001").unwrap();
        let record = VideoRecord::from_added(
            VideoUuid::new_v4(),
            origin.clone(),
            &added(),
            &crate::types::Stamp::new(LogicalTimestamp(1), origin.clone()),
        );
        let view = |uuid, payload| PropagationEvent::new(uuid, origin.clone(), LogicalTimestamp(9), payload);

        let ok = SnapshotRecord::new(
            record.clone(),
            vec![view(record.uuid, EventPayload::ViewsIncremented { delta: 2 })],
        );
        validate_snapshot_record(&ok).unwrap();

        let foreign = SnapshotRecord::new(
            record.clone(),
            vec![view(VideoUuid::new_v4(), EventPayload::ViewsIncremented { delta: 2 })],
        );
        assert!(matches!(
            validate_snapshot_record(&foreign),
            Err(ValidationError::StructuralError(_))
        ));

        let removal = SnapshotRecord::new(record.clone(), vec![view(record.uuid, EventPayload::Removed)]);
        assert_eq!(
            validate_snapshot_record(&removal),
            Err(ValidationError::PayloadMismatch(EventType::VideoRemoved))
        );
    }

    proptest! {
        #[test]
        fn test_name_length_boundary(len in 1usize..300) {
            let mut p = added();
            p.name = "n".repeat(len);
            prop_assert_eq!(validate_added(&p).is_ok(), len <= limits::MAX_NAME_LEN);
        }
    }
}
