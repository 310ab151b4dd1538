//! The Pod: one federated video node.
//!
//! A pod ties its store, its transport and its swarm client to the
//! federation engine. Local actions mutate the catalog through the same
//! applier that merges remote events, then queue the resulting event for
//! every friend; none of them waits on the network.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use podfed_core::{
    now_millis, Blake3Hash, ContentId, EventPayload, Keypair, LogicalClock, PodHost,
    PropagationEvent, RelationshipState, SnapshotRecord, VideoAddedPayload, VideoUpdatedPayload,
    VideoUuid, Video,
};
use podfed_store::Store;
use podfed_sync::{
    catalog_digest, Applier, ApplyOutcome, ApplyReport, DrainReport, MessageHandler, Negotiator,
    PodDirectory, PodMessage, PodReply, Propagator, SyncError, Transport, ViewCounter,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PodConfig;
use crate::error::{PodError, Result};
use crate::swarm::{SwarmClient, SwarmReferenceManager};

/// A local upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Seconds.
    pub duration: u32,
    pub author: String,
    /// The uploaded file, already on local disk.
    pub file: PathBuf,
}

pub struct Pod<S, T> {
    config: PodConfig,
    store: Arc<S>,
    clock: LogicalClock,
    directory: Arc<PodDirectory<S>>,
    propagator: Arc<Propagator<S, T>>,
    negotiator: Negotiator<S, T>,
    applier: Applier<S>,
    views: ViewCounter,
    swarm: SwarmReferenceManager<S>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Store, T: Transport> Pod<S, T> {
    /// Assemble a pod. Background work only starts with [`Pod::start`].
    pub fn new(
        config: PodConfig,
        keypair: Keypair,
        store: Arc<S>,
        transport: Arc<T>,
        swarm: Arc<dyn SwarmClient>,
    ) -> Self {
        let directory = Arc::new(PodDirectory::new(Arc::clone(&store)));
        let propagator = Arc::new(Propagator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&directory),
            config.propagator.clone(),
        ));
        let negotiator = Negotiator::new(
            keypair,
            Arc::clone(&store),
            transport,
            Arc::clone(&directory),
            Arc::clone(&propagator),
        );
        let applier = Applier::new(
            config.host.clone(),
            Arc::clone(&store),
            config.applier.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            swarm: SwarmReferenceManager::new(swarm, Arc::clone(&store)),
            clock: LogicalClock::new(),
            views: ViewCounter::new(),
            tasks: Mutex::new(Vec::new()),
            config,
            store,
            directory,
            propagator,
            negotiator,
            applier,
            shutdown,
        }
    }

    pub fn host(&self) -> &PodHost {
        &self.config.host
    }

    /// Fingerprint of this pod's signing key.
    pub fn fingerprint(&self) -> String {
        self.negotiator.fingerprint()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Register the file with the swarm, create the video and propagate it.
    pub async fn upload(&self, request: UploadRequest) -> Result<Video> {
        let content_id = self.swarm.register_file(&request.file).await?;
        let uuid = VideoUuid::new_v4();
        let payload = VideoAddedPayload {
            name: request.name,
            description: request.description,
            tags: request.tags,
            duration: request.duration,
            author: request.author,
            content_id,
            thumbnail_path: format!("/static/thumbnails/{uuid}.jpg"),
            created_at: now_millis(),
        };

        self.commit(uuid, EventPayload::Added(payload)).await?;
        let video = self.get(&uuid).await?.ok_or(PodError::VideoNotFound(uuid))?;
        info!(%uuid, name = %video.record.name, "uploaded video");
        Ok(video)
    }

    /// Change a local video's name, description or tags.
    pub async fn update(&self, uuid: &VideoUuid, changes: VideoUpdatedPayload) -> Result<Video> {
        let video = self.local_video(uuid).await?;
        if changes.is_empty() {
            return Ok(video);
        }
        self.commit(*uuid, EventPayload::Updated(changes)).await?;
        self.get(uuid).await?.ok_or(PodError::VideoNotFound(*uuid))
    }

    /// Tombstone a local video.
    pub async fn delete(&self, uuid: &VideoUuid) -> Result<()> {
        self.local_video(uuid).await?;
        self.commit(*uuid, EventPayload::Removed).await?;
        info!(%uuid, "removed video");
        Ok(())
    }

    /// Fetch a video and count one view of it.
    pub async fn view(&self, uuid: &VideoUuid) -> Result<Video> {
        let video = self.get(uuid).await?.ok_or(PodError::VideoNotFound(*uuid))?;
        self.views.record(*uuid);
        Ok(video)
    }

    /// A video that is not tombstoned.
    pub async fn get(&self, uuid: &VideoUuid) -> Result<Option<Video>> {
        Ok(self
            .store
            .get_video(uuid)
            .await?
            .filter(|v| !v.is_tombstoned()))
    }

    /// Every visible video, oldest first.
    pub async fn list(&self) -> Result<Vec<Video>> {
        Ok(self.store.list_videos(false).await?)
    }

    /// Local path of the file behind a content identifier.
    pub async fn resolve(&self, content_id: &ContentId) -> Result<PathBuf> {
        self.swarm.resolve(content_id).await
    }

    /// Views recorded here but not yet flushed.
    pub fn pending_views(&self, uuid: &VideoUuid) -> u64 {
        self.views.pending(uuid)
    }

    /// Digest of the replicable catalog, for convergence checks.
    pub async fn catalog_digest(&self) -> Result<Blake3Hash> {
        Ok(catalog_digest(self.store.as_ref()).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Friendship Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn request_friendship(&self, host: &PodHost) -> Result<RelationshipState> {
        Ok(self.negotiator.request_friendship(host).await?)
    }

    /// Befriend several pods; one result per host.
    pub async fn make_friends(
        &self,
        hosts: &[PodHost],
    ) -> Vec<(PodHost, Result<RelationshipState>)> {
        self.negotiator
            .make_friends(hosts)
            .await
            .into_iter()
            .map(|(host, result)| (host, result.map_err(PodError::from)))
            .collect()
    }

    pub async fn remove_friend(&self, host: &PodHost) -> Result<RelationshipState> {
        Ok(self.negotiator.remove_friend(host).await?)
    }

    pub async fn list_pods(&self) -> Result<Vec<podfed_core::Pod>> {
        Ok(self.negotiator.list_pods().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Propagation
    // ─────────────────────────────────────────────────────────────────────────

    /// Turn accumulated views into one `ViewsIncremented` event per video.
    ///
    /// Returns the number of events emitted. Deltas that fail to apply are
    /// kept for the next flush.
    pub async fn flush_views(&self) -> Result<usize> {
        let mut emitted = 0;
        for (uuid, delta) in self.views.drain() {
            match self
                .commit(uuid, EventPayload::ViewsIncremented { delta })
                .await
            {
                Ok(_) => emitted += 1,
                Err(e @ (PodError::Store(_) | PodError::Sync(_))) => {
                    warn!(%uuid, delta, error = %e, "view flush failed; keeping delta");
                    self.views.restore(uuid, delta);
                }
                Err(e) => warn!(%uuid, delta, error = %e, "dropping views"),
            }
        }
        if emitted > 0 {
            debug!(emitted, "flushed views");
        }
        Ok(emitted)
    }

    /// Deliver everything queued, now, in the calling task.
    pub async fn propagate_pending(&self) -> Result<DrainReport> {
        Ok(self.propagator.drain_all().await?)
    }

    /// Items still waiting for delivery.
    pub async fn outbound_pending(&self) -> Result<usize> {
        Ok(self.propagator.pending().await?)
    }

    /// Discard pending events whose video never arrived.
    pub fn sweep_pending(&self) -> usize {
        self.applier.sweep_pending()
    }

    /// Apply a local mutation and queue it for every friend.
    async fn commit(&self, uuid: VideoUuid, payload: EventPayload) -> Result<ApplyOutcome> {
        let event = PropagationEvent::new(uuid, self.config.host.clone(), self.clock.tick(), payload);
        let report = self.applier.apply(event.clone(), None).await?;
        let outcome = report.outcome;
        self.fan_out(&event, None, report).await;
        Ok(outcome)
    }

    /// Queue an applied event (and anything it released) for our friends.
    ///
    /// Remote events are only passed on when gossip is enabled, never back to
    /// their origin or to the pod that handed them to us.
    async fn fan_out(&self, event: &PropagationEvent, sender: Option<&PodHost>, report: ApplyReport) {
        if report.outcome == ApplyOutcome::Applied {
            self.forward(event, sender).await;
        }
        for replayed in report.replayed {
            self.forward(&replayed.event, replayed.sender.as_ref()).await;
        }
    }

    async fn forward(&self, event: &PropagationEvent, sender: Option<&PodHost>) {
        if sender.is_some() && !self.config.gossip {
            return;
        }
        let mut exclude = vec![&event.origin];
        exclude.extend(sender);
        if let Err(e) = self.propagator.broadcast(event, &exclude).await {
            warn!(uuid = %event.video_uuid, error = %e, "could not queue event for friends");
        }
    }

    async fn local_video(&self, uuid: &VideoUuid) -> Result<Video> {
        let video = self.get(uuid).await?.ok_or(PodError::VideoNotFound(*uuid))?;
        if !video.is_local {
            return Err(PodError::NotLocal(*uuid));
        }
        Ok(video)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    async fn receive_event(&self, sender: PodHost, event: PropagationEvent) -> PodReply {
        if let Some(reply) = self.refuse_unknown(&sender).await {
            return reply;
        }
        self.clock.observe(event.timestamp);

        match self.applier.apply(event.clone(), Some(sender.clone())).await {
            Ok(report) => {
                self.fan_out(&event, Some(&sender), report).await;
                PodReply::Ack
            }
            Err(SyncError::Validation(e)) => PodReply::Invalid {
                reason: e.to_string(),
            },
            Err(e) => {
                warn!(%sender, error = %e, "could not apply event");
                PodReply::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn receive_snapshot(&self, sender: PodHost, records: Vec<SnapshotRecord>) -> PodReply {
        if let Some(reply) = self.refuse_unknown(&sender).await {
            return reply;
        }

        let (mut merged, mut invalid) = (0, 0);
        for entry in records {
            let uuid = entry.record.uuid;
            let stamps = &entry.record.stamps;
            for stamp in [&stamps.name, &stamps.description, &stamps.tags, &stamps.metadata] {
                self.clock.observe(stamp.timestamp);
            }
            for view in &entry.views {
                self.clock.observe(view.timestamp);
            }
            match self.applier.merge_record(entry).await {
                Ok(report) => {
                    if report.outcome == ApplyOutcome::Applied {
                        merged += 1;
                    }
                    for replayed in report.replayed {
                        self.forward(&replayed.event, replayed.sender.as_ref()).await;
                    }
                }
                Err(SyncError::Validation(e)) => {
                    warn!(%sender, %uuid, error = %e, "skipping invalid snapshot record");
                    invalid += 1;
                }
                Err(e) => {
                    warn!(%sender, error = %e, "could not merge snapshot");
                    return PodReply::Rejected {
                        reason: e.to_string(),
                    };
                }
            }
        }
        info!(%sender, merged, invalid, "merged catalog snapshot");
        PodReply::Ack
    }

    /// Catalog traffic is only taken from pods we have a relationship with.
    async fn refuse_unknown(&self, sender: &PodHost) -> Option<PodReply> {
        match self.negotiator.accepts_events_from(sender).await {
            Ok(true) => {
                if let Err(e) = self.directory.touch(sender).await {
                    warn!(%sender, error = %e, "could not refresh last seen");
                }
                None
            }
            Ok(false) => {
                warn!(%sender, "catalog traffic from unknown pod");
                Some(PodReply::Invalid {
                    reason: format!("{sender} is not a friend"),
                })
            }
            Err(e) => Some(PodReply::Rejected {
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl<S: Store, T: Transport> MessageHandler for Pod<S, T> {
    async fn handle_message(&self, message: PodMessage) -> PodReply {
        if let Err(reason) = message.validate_limits() {
            return PodReply::Invalid {
                reason: reason.to_string(),
            };
        }
        debug!(from = %message.sender(), kind = message.kind(), "inbound message");

        match message {
            PodMessage::FriendRequest(request) => {
                self.negotiator.handle_friend_request(request).await
            }
            PodMessage::FriendConfirm(confirm) => {
                self.negotiator.handle_friend_confirm(confirm).await
            }
            PodMessage::Event { sender, event } => self.receive_event(sender, event).await,
            PodMessage::Snapshot { sender, records } => {
                self.receive_snapshot(sender, records).await
            }
        }
    }
}

impl<S, T> Pod<S, T>
where
    S: Store + 'static,
    T: Transport + 'static,
{
    /// Spawn the background work: propagation, view flushes and the
    /// pending-event sweep.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(
            Arc::clone(&self.propagator).run(self.shutdown.subscribe()),
        ));
        tasks.push(spawn_ticker(
            Arc::downgrade(self),
            self.config.view_flush_interval,
            self.shutdown.subscribe(),
            |pod| async move {
                if let Err(e) = pod.flush_views().await {
                    warn!(error = %e, "view flush failed");
                }
            },
        ));
        tasks.push(spawn_ticker(
            Arc::downgrade(self),
            self.config.sweep_interval,
            self.shutdown.subscribe(),
            |pod| async move {
                pod.sweep_pending();
            },
        ));
        info!(host = %self.config.host, "pod started");
    }

    /// Stop background work, flush outstanding views once and close the swarm.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.flush_views().await?;
        self.swarm.close().await?;
        info!(host = %self.config.host, "pod stopped");
        Ok(())
    }
}

/// Run `tick` on `pod` every `period` until shutdown or until the pod is dropped.
fn spawn_ticker<P, F, Fut>(
    pod: Weak<P>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    P: Send + Sync + 'static,
    F: Fn(Arc<P>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(pod) = pod.upgrade() else { break };
                    tick(pod).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
