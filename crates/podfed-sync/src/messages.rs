//! Federation wire messages.
//!
//! Every exchange between pods is one [`PodMessage`] answered by one
//! [`PodReply`]. Both are plain serde types; the HTTP transport carries them
//! as JSON.

use serde::{Deserialize, Serialize};

use podfed_core::{FriendRequest, PodHost, PropagationEvent, SnapshotRecord};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message size limits.
pub mod limits {
    /// Max records in one snapshot message.
    pub const MAX_SNAPSHOT_RECORDS: usize = 50;
}

/// Messages a pod sends to another pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodMessage {
    /// Phase 1 of the handshake: "let us be friends".
    FriendRequest(FriendRequest),

    /// Phase 3: the requester saw the acceptance and is now a friend.
    FriendConfirm(FriendRequest),

    /// A catalog mutation. `sender` is the immediate hop, which differs from
    /// the event's origin when the event is gossiped.
    Event {
        sender: PodHost,
        event: PropagationEvent,
    },

    /// One batch of a catalog snapshot for a new friend.
    Snapshot {
        sender: PodHost,
        records: Vec<SnapshotRecord>,
    },
}

impl PodMessage {
    /// The pod that sent this message.
    pub fn sender(&self) -> &PodHost {
        match self {
            PodMessage::FriendRequest(req) | PodMessage::FriendConfirm(req) => &req.from_host,
            PodMessage::Event { sender, .. } | PodMessage::Snapshot { sender, .. } => sender,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PodMessage::FriendRequest(_) => "friend_request",
            PodMessage::FriendConfirm(_) => "friend_confirm",
            PodMessage::Event { .. } => "event",
            PodMessage::Snapshot { .. } => "snapshot",
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        if let PodMessage::Snapshot { records, .. } = self {
            if records.len() > limits::MAX_SNAPSHOT_RECORDS {
                return Err("too many snapshot records");
            }
        }
        Ok(())
    }
}

/// A pod's answer to a [`PodMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodReply {
    /// Message received and handled (including duplicates and no-ops).
    Ack,

    /// Friend request accepted; carries the accepter's signed answer.
    Accepted(FriendRequest),

    /// Refused for now. Delivery of events may be retried; friend requests
    /// are reverted.
    Rejected { reason: String },

    /// The message itself is invalid. Never retried.
    Invalid { reason: String },
}

impl PodReply {
    pub fn kind(&self) -> &'static str {
        match self {
            PodReply::Ack => "ack",
            PodReply::Accepted(_) => "accepted",
            PodReply::Rejected { .. } => "rejected",
            PodReply::Invalid { .. } => "invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podfed_core::{Keypair, VideoUuid};

    fn host(s: &str) -> PodHost {
        PodHost::new(s).unwrap()
    }

    #[test]
    fn test_sender() {
        let req = FriendRequest::new_signed(
            &Keypair::from_seed(&[1u8; 32]),
            host("a.example"),
            host("b.example"),
            1,
        );
        assert_eq!(PodMessage::FriendRequest(req).sender(), &host("a.example"));

        let msg = PodMessage::Snapshot {
            sender: host("c.example"),
            records: vec![],
        };
        assert_eq!(msg.sender(), &host("c.example"));
    }

    #[test]
    fn test_message_json_roundtrip() {
        let msg = PodMessage::Event {
            sender: host("b.example"),
            event: podfed_core::PropagationEvent::new(
                VideoUuid::new_v4(),
                host("a.example"),
                podfed_core::LogicalTimestamp(9),
                podfed_core::EventPayload::ViewsIncremented { delta: 2 },
            ),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with("{\"event\":"));
        let back: PodMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);

        let reply: PodReply = serde_json::from_str("\"ack\"").unwrap();
        assert_eq!(reply, PodReply::Ack);
    }

    #[test]
    fn test_message_limits_exceeded() {
        let ok = PodMessage::Snapshot {
            sender: host("a.example"),
            records: vec![],
        };
        assert!(ok.validate_limits().is_ok());
    }
}
