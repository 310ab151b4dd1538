//! Pods and the friendship handshake.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::friend_request_signing_bytes;
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{CoreError, ValidationError};
use crate::types::PodHost;

/// Score every pod starts with.
pub const INITIAL_SCORE: i32 = 100;
/// Ceiling for a pod's score.
pub const MAX_SCORE: i32 = 1000;
/// Added after each successful delivery.
pub const SCORE_BONUS: i32 = 10;
/// Subtracted after a delivery exhausts its retries.
pub const SCORE_MALUS: i32 = 10;
/// A friend whose score drops to this value or below is demoted.
pub const DEMOTION_THRESHOLD: i32 = 0;

/// Relationship between the local pod and a remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipState {
    Unknown,
    /// We asked them; waiting for their answer.
    PendingOutbound,
    /// They asked us and we accepted; waiting for their confirmation.
    PendingInbound,
    Friend,
    /// Explicitly removed by an admin. Requests from this pod are refused.
    Removed,
}

impl RelationshipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipState::Unknown => "unknown",
            RelationshipState::PendingOutbound => "pending_outbound",
            RelationshipState::PendingInbound => "pending_inbound",
            RelationshipState::Friend => "friend",
            RelationshipState::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "unknown" => Ok(RelationshipState::Unknown),
            "pending_outbound" => Ok(RelationshipState::PendingOutbound),
            "pending_inbound" => Ok(RelationshipState::PendingInbound),
            "friend" => Ok(RelationshipState::Friend),
            "removed" => Ok(RelationshipState::Removed),
            other => Err(CoreError::UnknownState(other.to_string())),
        }
    }

    /// True once a handshake is in flight in either direction.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RelationshipState::PendingOutbound | RelationshipState::PendingInbound
        )
    }
}

impl fmt::Display for RelationshipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote pod as known to the local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub host: PodHost,
    /// Learned from the first signed friend request or answer.
    pub public_key_fingerprint: Option<String>,
    pub state: RelationshipState,
    /// Unix milliseconds of the last message received from this pod.
    pub last_seen_at: i64,
    pub score: i32,
}

impl Pod {
    /// A pod we have only just heard of.
    pub fn new(host: PodHost) -> Self {
        Self {
            host,
            public_key_fingerprint: None,
            state: RelationshipState::Unknown,
            last_seen_at: 0,
            score: INITIAL_SCORE,
        }
    }

    pub fn is_friend(&self) -> bool {
        self.state == RelationshipState::Friend
    }

    /// Record a successful delivery.
    pub fn reward(&mut self) {
        self.score = (self.score + SCORE_BONUS).min(MAX_SCORE);
    }

    /// Record an exhausted delivery. Returns true if the pod should be demoted.
    pub fn penalize(&mut self) -> bool {
        self.score -= SCORE_MALUS;
        self.score <= DEMOTION_THRESHOLD
    }
}

/// Outcome of a friend request as seen by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestState {
    Pending,
    Accepted,
    Rejected,
}

/// A signed proposal (or confirmation) of friendship from one pod to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub from_host: PodHost,
    pub to_host: PodHost,
    pub state: FriendRequestState,
    /// Unix milliseconds.
    pub requested_at: i64,
    pub public_key: Ed25519PublicKey,
    pub signature: Ed25519Signature,
}

impl FriendRequest {
    /// Create and sign a request.
    pub fn new_signed(
        keypair: &Keypair,
        from_host: PodHost,
        to_host: PodHost,
        requested_at: i64,
    ) -> Self {
        let public_key = keypair.public_key();
        let message = friend_request_signing_bytes(&from_host, &to_host, requested_at, &public_key);
        Self {
            signature: keypair.sign(&message),
            from_host,
            to_host,
            state: FriendRequestState::Pending,
            requested_at,
            public_key,
        }
    }

    /// Copy of this request carrying a new state. The signature is unaffected.
    pub fn with_state(mut self, state: FriendRequestState) -> Self {
        self.state = state;
        self
    }

    /// Check the request is addressed to `expected_to` and its signature holds.
    pub fn verify(&self, expected_to: &PodHost) -> Result<(), ValidationError> {
        if &self.to_host != expected_to {
            return Err(ValidationError::WrongRecipient {
                expected: expected_to.to_string(),
                got: self.to_host.to_string(),
            });
        }
        let message = friend_request_signing_bytes(
            &self.from_host,
            &self.to_host,
            self.requested_at,
            &self.public_key,
        );
        self.public_key.verify(&message, &self.signature)?;
        Ok(())
    }

    /// Fingerprint of the signing key.
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(s: &str) -> PodHost {
        PodHost::new(s).unwrap()
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            RelationshipState::Unknown,
            RelationshipState::PendingOutbound,
            RelationshipState::PendingInbound,
            RelationshipState::Friend,
            RelationshipState::Removed,
        ] {
            assert_eq!(RelationshipState::parse(state.as_str()).unwrap(), state);
        }
        assert!(RelationshipState::parse("enemy").is_err());
    }

    #[test]
    fn test_score_bounds() {
        let mut pod = Pod::new(host("a.example"));
        for _ in 0..200 {
            pod.reward();
        }
        assert_eq!(pod.score, MAX_SCORE);

        let mut pod = Pod::new(host("a.example"));
        let mut demoted = false;
        for _ in 0..10 {
            demoted = pod.penalize();
        }
        assert!(demoted);
        assert_eq!(pod.score, 0);
    }

    #[test]
    fn test_friend_request_verifies() {
        let kp = Keypair::from_seed(&[9u8; 32]);
        let req = FriendRequest::new_signed(&kp, host("a.example"), host("b.example"), 1234);
        req.verify(&host("b.example")).unwrap();
        assert_eq!(req.fingerprint(), kp.public_key().fingerprint());

        // State changes do not invalidate the signature.
        let accepted = req.clone().with_state(FriendRequestState::Accepted);
        accepted.verify(&host("b.example")).unwrap();
    }

    #[test]
    fn test_friend_request_tampering_detected() {
        let kp = Keypair::from_seed(&[9u8; 32]);
        let req = FriendRequest::new_signed(&kp, host("a.example"), host("b.example"), 1234);

        assert!(matches!(
            req.verify(&host("c.example")),
            Err(ValidationError::WrongRecipient { .. })
        ));

        let mut forged = req.clone();
        forged.from_host = host("evil.example");
        assert_eq!(
            forged.verify(&host("b.example")),
            Err(ValidationError::SignatureFailed)
        );

        let mut forged = req;
        forged.requested_at += 1;
        assert_eq!(
            forged.verify(&host("b.example")),
            Err(ValidationError::SignatureFailed)
        );
    }
}
