//! The friendship handshake and removal between live pods.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use podfed::core::RelationshipState;
use podfed::sync::{MessageHandler, PodMessage, PodReply, SyncError};
use podfed::PodError;
use podfed_testkit::{Cluster, TestPod};

async fn state_of(cluster: &Cluster, at: usize, of: usize) -> RelationshipState {
    cluster
        .pod(at)
        .list_pods()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.host == cluster.host(of))
        .map(|p| p.state)
        .unwrap_or(RelationshipState::Unknown)
}

/// Stands in front of a pod and loses its first few confirmations.
struct LossyConfirms {
    inner: Arc<TestPod>,
    to_lose: AtomicUsize,
}

#[async_trait]
impl MessageHandler for LossyConfirms {
    async fn handle_message(&self, message: PodMessage) -> PodReply {
        if matches!(message, PodMessage::FriendConfirm(_))
            && self
                .to_lose
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return PodReply::Rejected {
                reason: "confirmation lost".into(),
            };
        }
        self.inner.handle_message(message).await
    }
}

async fn lose_confirms(cluster: &Cluster, index: usize, count: usize) -> Arc<LossyConfirms> {
    let lossy = Arc::new(LossyConfirms {
        inner: Arc::clone(cluster.pod(index)),
        to_lose: AtomicUsize::new(count),
    });
    let handler: Weak<dyn MessageHandler> = Arc::downgrade(&lossy) as _;
    cluster.network.register(cluster.host(index), handler).await;
    lossy
}

#[tokio::test]
async fn test_handshake_makes_both_sides_friends() {
    let cluster = Cluster::new(2).await.unwrap();

    let state = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap();
    assert_eq!(state, RelationshipState::Friend);
    assert_eq!(state_of(&cluster, 0, 1).await, RelationshipState::Friend);
    assert_eq!(state_of(&cluster, 1, 0).await, RelationshipState::Friend);

    let pods = cluster.pod(1).list_pods().await.unwrap();
    assert_eq!(
        pods[0].public_key_fingerprint.as_deref(),
        Some(cluster.pod(0).fingerprint().as_str())
    );
}

#[tokio::test]
async fn test_second_request_is_already_friend() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();

    let err = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PodError::AlreadyFriend(_)));
}

#[tokio::test]
async fn test_self_request_is_refused() {
    let cluster = Cluster::new(1).await.unwrap();
    let err = cluster
        .pod(0)
        .request_friendship(&cluster.host(0))
        .await
        .unwrap_err();
    assert!(matches!(err, PodError::Sync(SyncError::Rejected { .. })));
    assert!(cluster.pod(0).list_pods().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_target_reverts_state() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.set_reachable(1, false).await;

    let err = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PodError::Sync(SyncError::Delivery { .. })));
    assert_eq!(state_of(&cluster, 0, 1).await, RelationshipState::Unknown);

    cluster.set_reachable(1, true).await;
    let state = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap();
    assert_eq!(state, RelationshipState::Friend);
}

#[tokio::test]
async fn test_crossing_requests_converge_on_friendship() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.upload(0, "from pod 1").await.unwrap();
    cluster.upload(1, "from pod 2").await.unwrap();

    let host0 = cluster.host(0);
    let host1 = cluster.host(1);
    let (a, b) = tokio::join!(
        cluster.pod(0).request_friendship(&host1),
        cluster.pod(1).request_friendship(&host0),
    );
    for result in [a, b] {
        match result {
            Ok(state) => assert_eq!(state, RelationshipState::Friend),
            Err(e) => assert!(matches!(e, PodError::AlreadyFriend(_)), "{e}"),
        }
    }
    assert_eq!(state_of(&cluster, 0, 1).await, RelationshipState::Friend);
    assert_eq!(state_of(&cluster, 1, 0).await, RelationshipState::Friend);

    cluster.settle().await.unwrap();
    assert_eq!(cluster.pod(0).list().await.unwrap().len(), 2);
    assert_eq!(cluster.pod(1).list().await.unwrap().len(), 2);
    assert!(cluster.converged().await.unwrap());
}

#[tokio::test]
async fn test_removed_friend_stops_receiving() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();
    cluster.settle().await.unwrap();

    let previous = cluster.pod(0).remove_friend(&cluster.host(1)).await.unwrap();
    assert_eq!(previous, RelationshipState::Friend);
    assert_eq!(state_of(&cluster, 0, 1).await, RelationshipState::Removed);

    let video = cluster.upload(0, "private now").await.unwrap();
    assert_eq!(cluster.pod(0).outbound_pending().await.unwrap(), 0);
    cluster.settle().await.unwrap();
    assert!(cluster.pod(1).get(&video.uuid()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_removal_drops_queued_items() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();
    cluster.settle().await.unwrap();

    cluster.upload(0, "queued 1").await.unwrap();
    cluster.upload(0, "queued 2").await.unwrap();
    assert_eq!(cluster.pod(0).outbound_pending().await.unwrap(), 2);

    cluster.pod(0).remove_friend(&cluster.host(1)).await.unwrap();
    assert_eq!(cluster.pod(0).outbound_pending().await.unwrap(), 0);
    cluster.settle().await.unwrap();
    assert!(cluster.pod(1).list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_removed_pod_cannot_ask_again() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();

    cluster.pod(0).remove_friend(&cluster.host(1)).await.unwrap();
    cluster.pod(1).remove_friend(&cluster.host(0)).await.unwrap();

    let err = cluster
        .pod(1)
        .request_friendship(&cluster.host(0))
        .await
        .unwrap_err();
    assert!(matches!(err, PodError::Sync(SyncError::Rejected { .. })));
    assert_eq!(state_of(&cluster, 1, 0).await, RelationshipState::Removed);
    assert_eq!(state_of(&cluster, 0, 1).await, RelationshipState::Removed);
}

#[tokio::test]
async fn test_remover_can_befriend_again() {
    let cluster = Cluster::new(2).await.unwrap();
    cluster.pod(0).request_friendship(&cluster.host(1)).await.unwrap();
    cluster.pod(0).remove_friend(&cluster.host(1)).await.unwrap();

    let video = cluster.upload(0, "while apart").await.unwrap();
    let state = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap();
    assert_eq!(state, RelationshipState::Friend);

    cluster.settle().await.unwrap();
    assert!(cluster.pod(1).get(&video.uuid()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lost_confirmation_leaves_no_lone_friend() {
    let cluster = Cluster::new(2).await.unwrap();
    let _lossy = lose_confirms(&cluster, 1, 1).await;

    let err = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PodError::Sync(SyncError::Rejected { .. })));
    assert_eq!(state_of(&cluster, 0, 1).await, RelationshipState::Unknown);
    assert_eq!(state_of(&cluster, 1, 0).await, RelationshipState::PendingInbound);

    // Nothing is pushed at a pod that never finished the handshake.
    let early = cluster.upload(0, "before the retry").await.unwrap();
    assert_eq!(cluster.pod(0).outbound_pending().await.unwrap(), 0);

    let state = cluster
        .pod(0)
        .request_friendship(&cluster.host(1))
        .await
        .unwrap();
    assert_eq!(state, RelationshipState::Friend);
    assert_eq!(state_of(&cluster, 1, 0).await, RelationshipState::Friend);

    let late = cluster.upload(0, "after the retry").await.unwrap();
    cluster.settle().await.unwrap();
    assert!(cluster.pod(1).get(&early.uuid()).await.unwrap().is_some());
    assert!(cluster.pod(1).get(&late.uuid()).await.unwrap().is_some());
    assert!(cluster.converged().await.unwrap());
}
