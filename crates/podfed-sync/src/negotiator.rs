//! Friendship negotiator.
//!
//! The handshake has three legs:
//!
//! 1. The requester moves the target to `PendingOutbound` and sends a signed
//!    [`FriendRequest`].
//! 2. The target moves the requester to `PendingInbound` (or straight to
//!    `Friend` if it had a request of its own in flight) and answers with a
//!    signed acceptance.
//! 3. The requester sees the acceptance and sends a confirmation. The target
//!    becomes a friend on receipt and acknowledges; the requester becomes a
//!    friend only once that acknowledgment arrives, and reverts otherwise.
//!
//! Each side queues one catalog snapshot for the other when it turns the
//! relationship into `Friend`.

use std::sync::Arc;

use podfed_core::{
    now_millis, FriendRequest, FriendRequestState, Keypair, Pod, PodHost, RelationshipState,
    SnapshotRecord,
};
use podfed_store::Store;
use tracing::{debug, info, warn};

use crate::directory::PodDirectory;
use crate::error::{Result, SyncError};
use crate::messages::{PodMessage, PodReply};
use crate::propagator::Propagator;
use crate::transport::Transport;

pub struct Negotiator<S, T> {
    local: PodHost,
    keypair: Keypair,
    store: Arc<S>,
    transport: Arc<T>,
    directory: Arc<PodDirectory<S>>,
    propagator: Arc<Propagator<S, T>>,
}

impl<S: Store, T: Transport> Negotiator<S, T> {
    pub fn new(
        keypair: Keypair,
        store: Arc<S>,
        transport: Arc<T>,
        directory: Arc<PodDirectory<S>>,
        propagator: Arc<Propagator<S, T>>,
    ) -> Self {
        Self {
            local: transport.local_host().clone(),
            keypair,
            store,
            transport,
            directory,
            propagator,
        }
    }

    /// Fingerprint of this pod's signing key.
    pub fn fingerprint(&self) -> String {
        self.keypair.public_key().fingerprint()
    }

    /// Ask `target` to become a friend.
    ///
    /// Returns the resulting local state. On any failure the local state is
    /// put back to what it was before the call.
    pub async fn request_friendship(&self, target: &PodHost) -> Result<RelationshipState> {
        if *target == self.local {
            return Err(SyncError::Rejected {
                host: target.to_string(),
                reason: "a pod cannot befriend itself".into(),
            });
        }

        let previous = self
            .directory
            .update(target, |p| {
                let previous = p.state;
                if previous != RelationshipState::Friend {
                    p.state = RelationshipState::PendingOutbound;
                }
                previous
            })
            .await?;
        if previous == RelationshipState::Friend {
            return Err(SyncError::AlreadyFriend(target.to_string()));
        }

        let request = FriendRequest::new_signed(
            &self.keypair,
            self.local.clone(),
            target.clone(),
            now_millis(),
        );
        info!(%target, ?previous, "sending friend request");

        let outcome = match self
            .transport
            .send(target, PodMessage::FriendRequest(request))
            .await
        {
            Ok(PodReply::Accepted(answer)) => self.accept_answer(target, &answer).await,
            Ok(PodReply::Rejected { reason }) => Err(SyncError::Rejected {
                host: target.to_string(),
                reason,
            }),
            Ok(other) => Err(SyncError::UnexpectedReply {
                host: target.to_string(),
                reply: other.kind().to_string(),
            }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(%target, error = %e, "friend request failed; reverting");
                self.directory
                    .update(target, |p| {
                        if p.state == RelationshipState::PendingOutbound {
                            p.state = previous;
                        }
                    })
                    .await?;
                Err(e)
            }
        }
    }

    /// Request friendship with each host in turn.
    ///
    /// Failures are reported per host and do not stop the batch.
    pub async fn make_friends(
        &self,
        hosts: &[PodHost],
    ) -> Vec<(PodHost, Result<RelationshipState>)> {
        let mut results = Vec::with_capacity(hosts.len());
        for host in hosts {
            let result = self.request_friendship(host).await;
            results.push((host.clone(), result));
        }
        results
    }

    /// Mark `host` as removed and discard anything still queued for it.
    pub async fn remove_friend(&self, host: &PodHost) -> Result<RelationshipState> {
        let previous = self
            .directory
            .update(host, |p| {
                let previous = p.state;
                p.state = RelationshipState::Removed;
                previous
            })
            .await?;
        let dropped = self.propagator.drop_queue(host).await?;
        info!(%host, ?previous, dropped, "removed friend");
        Ok(previous)
    }

    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.directory.list().await
    }

    /// Whether catalog traffic from `host` should be applied.
    ///
    /// Pending pods may already have snapshots in flight, and events a removed
    /// pod sent before the removal are still applied once.
    pub async fn accepts_events_from(&self, host: &PodHost) -> Result<bool> {
        Ok(matches!(
            self.directory.state_of(host).await?,
            RelationshipState::Friend
                | RelationshipState::PendingOutbound
                | RelationshipState::PendingInbound
                | RelationshipState::Removed
        ))
    }

    /// Handle leg 1 of the handshake on the receiving side.
    pub async fn handle_friend_request(&self, request: FriendRequest) -> PodReply {
        if let Err(e) = request.verify(&self.local) {
            warn!(from = %request.from_host, error = %e, "invalid friend request");
            return PodReply::Invalid {
                reason: e.to_string(),
            };
        }

        let from = request.from_host.clone();
        let fingerprint = request.fingerprint();
        let previous = self
            .directory
            .update(&from, |p| {
                let previous = p.state;
                match previous {
                    RelationshipState::Removed | RelationshipState::Friend => {}
                    RelationshipState::PendingOutbound => p.state = RelationshipState::Friend,
                    RelationshipState::Unknown | RelationshipState::PendingInbound => {
                        p.state = RelationshipState::PendingInbound
                    }
                }
                if previous != RelationshipState::Removed {
                    p.public_key_fingerprint = Some(fingerprint);
                    p.last_seen_at = now_millis();
                }
                previous
            })
            .await;

        let previous = match previous {
            Ok(previous) => previous,
            Err(e) => {
                warn!(%from, error = %e, "could not record friend request");
                return PodReply::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        match previous {
            RelationshipState::Removed => {
                info!(%from, "refusing friend request from removed pod");
                return PodReply::Rejected {
                    reason: "friendship was removed".into(),
                };
            }
            RelationshipState::PendingOutbound => {
                let initiator = std::cmp::min(&self.local, &from);
                info!(%from, %initiator, "crossing friend requests; now friends");
                if let Err(e) = self.send_snapshot(&from).await {
                    warn!(%from, error = %e, "could not queue snapshot");
                }
            }
            state => debug!(%from, ?state, "accepting friend request"),
        }

        PodReply::Accepted(self.signed_answer(&from))
    }

    /// Handle leg 3 of the handshake on the receiving side.
    pub async fn handle_friend_confirm(&self, confirm: FriendRequest) -> PodReply {
        if let Err(e) = confirm.verify(&self.local) {
            warn!(from = %confirm.from_host, error = %e, "invalid friend confirmation");
            return PodReply::Invalid {
                reason: e.to_string(),
            };
        }

        let from = confirm.from_host.clone();
        let previous = self
            .directory
            .update(&from, |p| {
                let previous = p.state;
                if previous.is_pending() {
                    p.state = RelationshipState::Friend;
                    p.public_key_fingerprint = Some(confirm.fingerprint());
                    p.last_seen_at = now_millis();
                }
                previous
            })
            .await;

        match previous {
            Ok(state) if state.is_pending() => {
                info!(%from, "friendship confirmed");
                if let Err(e) = self.send_snapshot(&from).await {
                    warn!(%from, error = %e, "could not queue snapshot");
                }
                PodReply::Ack
            }
            Ok(RelationshipState::Friend) => PodReply::Ack,
            Ok(state) => PodReply::Rejected {
                reason: format!("no pending friendship (state {state})"),
            },
            Err(e) => PodReply::Rejected {
                reason: e.to_string(),
            },
        }
    }

    /// Leg 3 on the requester side.
    async fn accept_answer(
        &self,
        target: &PodHost,
        answer: &FriendRequest,
    ) -> Result<RelationshipState> {
        answer.verify(&self.local)?;
        if answer.from_host != *target || answer.state != FriendRequestState::Accepted {
            return Err(SyncError::UnexpectedReply {
                host: target.to_string(),
                reply: format!("acceptance from {}", answer.from_host),
            });
        }

        let fingerprint = answer.fingerprint();
        let previous = self
            .directory
            .update(target, |p| {
                if p.state != RelationshipState::Removed {
                    p.public_key_fingerprint = Some(fingerprint);
                    p.last_seen_at = now_millis();
                }
                p.state
            })
            .await?;

        match previous {
            RelationshipState::Friend => {
                // The crossing request already completed the handshake.
                debug!(%target, "already friends on acceptance");
                return Ok(RelationshipState::Friend);
            }
            RelationshipState::Removed => {
                info!(%target, "removed during handshake; ignoring acceptance");
                return Ok(RelationshipState::Removed);
            }
            _ => info!(%target, "friend request accepted; confirming"),
        }

        // Still pending here; only an acknowledged confirmation makes a friend.
        let confirm = PodMessage::FriendConfirm(self.signed_answer(target));
        match self.transport.send(target, confirm).await? {
            PodReply::Ack => {}
            PodReply::Rejected { reason } => {
                return Err(SyncError::Rejected {
                    host: target.to_string(),
                    reason,
                })
            }
            other => {
                return Err(SyncError::UnexpectedReply {
                    host: target.to_string(),
                    reply: other.kind().to_string(),
                })
            }
        }

        let promoted = self
            .directory
            .update(target, |p| {
                let promote = p.state.is_pending() || p.state == RelationshipState::Unknown;
                if promote {
                    p.state = RelationshipState::Friend;
                }
                promote
            })
            .await?;
        if promoted {
            info!(%target, "friendship confirmed by target");
            self.send_snapshot(target).await?;
        }
        self.directory.state_of(target).await
    }

    fn signed_answer(&self, to: &PodHost) -> FriendRequest {
        FriendRequest::new_signed(&self.keypair, self.local.clone(), to.clone(), now_millis())
            .with_state(FriendRequestState::Accepted)
    }

    /// Queue the whole catalog, tombstones included, for a new friend.
    async fn send_snapshot(&self, to: &PodHost) -> Result<usize> {
        let videos = self.store.list_videos(true).await?;
        let mut records = Vec::with_capacity(videos.len());
        for video in videos {
            let views = self.store.applied_views(&video.record.uuid).await?;
            records.push(SnapshotRecord::new(video.record, views));
        }
        self.propagator.send_snapshot(to, records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagator::PropagatorConfig;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::MessageHandler;
    use async_trait::async_trait;
    use podfed_core::{
        ContentId, LogicalTimestamp, OutboundItem, Stamp, VideoAddedPayload, VideoRecord,
        VideoUuid,
    };
    use podfed_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    fn host(s: &str) -> PodHost {
        PodHost::new(s).unwrap()
    }

    struct Node {
        store: Arc<MemoryStore>,
        negotiator: Negotiator<MemoryStore, MemoryTransport>,
        /// Confirmations still to be answered with a rejection.
        refuse_confirms: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Node {
        async fn handle_message(&self, message: PodMessage) -> PodReply {
            match message {
                PodMessage::FriendRequest(r) => self.negotiator.handle_friend_request(r).await,
                PodMessage::FriendConfirm(_)
                    if self
                        .refuse_confirms
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok() =>
                {
                    PodReply::Rejected {
                        reason: "confirmation lost".into(),
                    }
                }
                PodMessage::FriendConfirm(r) => self.negotiator.handle_friend_confirm(r).await,
                _ => PodReply::Ack,
            }
        }
    }

    async fn node(network: &Arc<MemoryNetwork>, name: &str, seed: u8) -> Arc<Node> {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(network.transport(host(name)));
        let directory = Arc::new(PodDirectory::new(Arc::clone(&store)));
        let propagator = Arc::new(Propagator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&directory),
            PropagatorConfig::default(),
        ));
        let negotiator = Negotiator::new(
            Keypair::from_seed(&[seed; 32]),
            Arc::clone(&store),
            transport,
            directory,
            propagator,
        );
        let node = Arc::new(Node {
            store,
            negotiator,
            refuse_confirms: AtomicUsize::new(0),
        });
        let weak: Weak<dyn MessageHandler> = Arc::downgrade(&node) as _;
        network.register(host(name), weak).await;

        // One video so snapshots are observable.
        let origin = host(name);
        let payload = VideoAddedPayload {
            name: format!("video of {name}"),
            description: String::new(),
            tags: vec![],
            duration: 1,
            author: "root".into(),
            content_id: ContentId::from_content(name.as_bytes()),
            thumbnail_path: String::new(),
            created_at: 1,
        };
        let stamp = Stamp::new(LogicalTimestamp(1), origin.clone());
        let record = VideoRecord::from_added(VideoUuid::new_v4(), origin, &payload, &stamp);
        node.store.upsert_video(&record, true).await.unwrap();
        node
    }

    async fn state(n: &Node, of: &str) -> RelationshipState {
        n.negotiator.directory.state_of(&host(of)).await.unwrap()
    }

    async fn queued(n: &Node, to: &str) -> usize {
        n.store.outbound_len(Some(&host(to))).await.unwrap()
    }

    #[tokio::test]
    async fn test_request_and_accept() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let b = node(&network, "b.example", 2).await;

        let result = a.negotiator.request_friendship(&host("b.example")).await;
        assert_eq!(result.unwrap(), RelationshipState::Friend);
        assert_eq!(state(&a, "b.example").await, RelationshipState::Friend);
        assert_eq!(state(&b, "a.example").await, RelationshipState::Friend);

        // Exactly one snapshot each way.
        assert_eq!(queued(&a, "b.example").await, 1);
        assert_eq!(queued(&b, "a.example").await, 1);

        let pod = a.negotiator.directory.get(&host("b.example")).await.unwrap().unwrap();
        assert_eq!(pod.public_key_fingerprint, Some(b.negotiator.fingerprint()));
    }

    #[tokio::test]
    async fn test_already_friend() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let _b = node(&network, "b.example", 2).await;

        a.negotiator.request_friendship(&host("b.example")).await.unwrap();
        let err = a
            .negotiator
            .request_friendship(&host("b.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyFriend(_)));
    }

    #[tokio::test]
    async fn test_crossing_requests_converge() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let b = node(&network, "b.example", 2).await;

        // b's own request is in flight when a's arrives.
        b.negotiator
            .directory
            .update(&host("a.example"), |p| {
                p.state = RelationshipState::PendingOutbound
            })
            .await
            .unwrap();

        a.negotiator.request_friendship(&host("b.example")).await.unwrap();
        assert_eq!(state(&a, "b.example").await, RelationshipState::Friend);
        assert_eq!(state(&b, "a.example").await, RelationshipState::Friend);
        assert_eq!(queued(&a, "b.example").await, 1);
        assert_eq!(queued(&b, "a.example").await, 1);
    }

    #[tokio::test]
    async fn test_lost_confirmation_reverts_requester() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let b = node(&network, "b.example", 2).await;
        b.refuse_confirms.store(1, Ordering::SeqCst);

        let err = a
            .negotiator
            .request_friendship(&host("b.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));

        // Neither side believes in a friendship the other never completed.
        assert_eq!(state(&a, "b.example").await, RelationshipState::Unknown);
        assert_eq!(state(&b, "a.example").await, RelationshipState::PendingInbound);
        assert_eq!(queued(&a, "b.example").await, 0);
        assert_eq!(queued(&b, "a.example").await, 0);

        // Asking again resends the confirmation and completes the handshake.
        let state_after = a.negotiator.request_friendship(&host("b.example")).await;
        assert_eq!(state_after.unwrap(), RelationshipState::Friend);
        assert_eq!(state(&b, "a.example").await, RelationshipState::Friend);
        assert_eq!(queued(&a, "b.example").await, 1);
        assert_eq!(queued(&b, "a.example").await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_carries_applied_views() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let _b = node(&network, "b.example", 2).await;

        let video = a.store.list_videos(true).await.unwrap().remove(0);
        let view = podfed_core::PropagationEvent::new(
            video.record.uuid,
            host("c.example"),
            LogicalTimestamp(7),
            podfed_core::EventPayload::ViewsIncremented { delta: 3 },
        );
        let mut record = video.record.clone();
        record.views = 3;
        assert!(a
            .store
            .commit_event(&view, Some((&record, true)), 1)
            .await
            .unwrap());

        a.negotiator.request_friendship(&host("b.example")).await.unwrap();
        let queued = a.store.peek_outbound(&host("b.example")).await.unwrap().unwrap();
        let entries = match &queued.item {
            OutboundItem::Snapshot(entries) => entries,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].views, vec![view]);
        assert_eq!(entries[0].view_total(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_reverts() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let _b = node(&network, "b.example", 2).await;
        network.set_reachable(&host("b.example"), false).await;

        let err = a
            .negotiator
            .request_friendship(&host("b.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Delivery { .. }));
        assert_eq!(state(&a, "b.example").await, RelationshipState::Unknown);
    }

    #[tokio::test]
    async fn test_removed_pod_is_refused() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let b = node(&network, "b.example", 2).await;

        a.negotiator.request_friendship(&host("b.example")).await.unwrap();
        b.negotiator.remove_friend(&host("a.example")).await.unwrap();
        assert_eq!(queued(&b, "a.example").await, 0);
        assert!(b.negotiator.accepts_events_from(&host("a.example")).await.unwrap());

        a.negotiator.remove_friend(&host("b.example")).await.unwrap();
        let err = a
            .negotiator
            .request_friendship(&host("b.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));
        assert_eq!(state(&a, "b.example").await, RelationshipState::Removed);
    }

    #[tokio::test]
    async fn test_make_friends_reports_each_host() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a.example", 1).await;
        let _b = node(&network, "b.example", 2).await;
        let _c = node(&network, "c.example", 3).await;

        a.negotiator.request_friendship(&host("b.example")).await.unwrap();
        let results = a
            .negotiator
            .make_friends(&[host("b.example"), host("c.example"), host("a.example")])
            .await;
        assert!(matches!(results[0].1, Err(SyncError::AlreadyFriend(_))));
        assert_eq!(*results[1].1.as_ref().unwrap(), RelationshipState::Friend);
        assert!(results[2].1.is_err());
    }

    #[tokio::test]
    async fn test_forged_request_is_invalid() {
        let network = MemoryNetwork::new();
        let _a = node(&network, "a.example", 1).await;
        let b = node(&network, "b.example", 2).await;

        let mut forged = FriendRequest::new_signed(
            &Keypair::from_seed(&[9; 32]),
            host("a.example"),
            host("b.example"),
            1,
        );
        forged.requested_at = 2;
        let reply = b.negotiator.handle_friend_request(forged).await;
        assert!(matches!(reply, PodReply::Invalid { .. }));
        assert_eq!(state(&b, "a.example").await, RelationshipState::Unknown);
        assert!(!b.negotiator.accepts_events_from(&host("a.example")).await.unwrap());
    }
}
