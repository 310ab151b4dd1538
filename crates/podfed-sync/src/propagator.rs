//! Event propagator: at-least-once delivery of outbound items to friends.
//!
//! Items wait in the store's durable per-destination queue. Each destination
//! is drained head-first by at most one task at a time; the head item is
//! retried with exponential backoff before anything behind it is attempted,
//! which keeps per-destination order. An item that exhausts its retries is
//! dropped and costs the destination score; a destination whose score falls
//! to the threshold is demoted and its queue discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use podfed_core::{now_millis, OutboundItem, PodHost, PropagationEvent, RelationshipState, SnapshotRecord};
use podfed_store::Store;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::PodDirectory;
use crate::error::Result;
use crate::keyed_lock::KeyedLocks;
use crate::messages::{limits, PodMessage, PodReply};
use crate::transport::Transport;

/// Retry policy for a single outbound item.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay (before jitter).
    pub max_delay: Duration,
    /// Add up to 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max_delay`, plus jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if !self.jitter {
            return base;
        }
        let jitter_ms = (base.as_millis() as f64 * 0.5 * rand::thread_rng().gen::<f64>()) as u64;
        base + Duration::from_millis(jitter_ms)
    }
}

/// Configuration for the propagator.
#[derive(Debug, Clone)]
pub struct PropagatorConfig {
    pub retry: RetryPolicy,
    /// Records per snapshot message.
    pub snapshot_batch_size: usize,
    /// How often the background loop rescans queues without being woken.
    pub poll_interval: Duration,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            snapshot_batch_size: limits::MAX_SNAPSHOT_RECORDS,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// What happened during one or more queue drains.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// Items dropped after exhausting their retries.
    pub exhausted: usize,
    /// Items discarded without delivery (invalid, demoted or removed destination).
    pub dropped: usize,
    /// Destinations demoted during the drain.
    pub demoted: Vec<PodHost>,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.exhausted += other.exhausted;
        self.dropped += other.dropped;
        self.demoted.extend(other.demoted);
    }

    /// True if nothing moved.
    pub fn is_idle(&self) -> bool {
        self.delivered == 0 && self.exhausted == 0 && self.dropped == 0
    }
}

enum Delivery {
    Delivered,
    Invalid(String),
    Exhausted,
    /// The destination stopped being a friend mid-retry.
    Abandoned,
}

pub struct Propagator<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    directory: Arc<PodDirectory<S>>,
    config: PropagatorConfig,
    wake: Notify,
    drains: KeyedLocks<PodHost>,
}

impl<S: Store, T: Transport> Propagator<S, T> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        directory: Arc<PodDirectory<S>>,
        config: PropagatorConfig,
    ) -> Self {
        Self {
            store,
            transport,
            directory,
            config,
            wake: Notify::new(),
            drains: KeyedLocks::new(),
        }
    }

    /// Queue an item for one destination.
    pub async fn enqueue(&self, destination: &PodHost, item: OutboundItem) -> Result<u64> {
        let seq = self.store.enqueue_outbound(destination, &item).await?;
        debug!(%destination, seq, kind = item.kind(), "queued outbound item");
        self.wake.notify_one();
        Ok(seq)
    }

    /// Queue an event for every friend except the excluded hosts.
    ///
    /// Returns the number of destinations.
    pub async fn broadcast(&self, event: &PropagationEvent, exclude: &[&PodHost]) -> Result<usize> {
        let mut count = 0;
        for friend in self.directory.friends().await? {
            if exclude.contains(&&friend) {
                continue;
            }
            self.enqueue(&friend, OutboundItem::Event(event.clone())).await?;
            count += 1;
        }
        debug!(
            uuid = %event.video_uuid,
            event_type = %event.event_type,
            destinations = count,
            "broadcast event"
        );
        Ok(count)
    }

    /// Queue a catalog snapshot for a new friend, in batches.
    ///
    /// Returns the number of batches queued.
    pub async fn send_snapshot(
        &self,
        destination: &PodHost,
        records: Vec<SnapshotRecord>,
    ) -> Result<usize> {
        let batch_size = self.config.snapshot_batch_size.max(1);
        let mut batches = 0;
        for chunk in records.chunks(batch_size) {
            self.enqueue(destination, OutboundItem::Snapshot(chunk.to_vec()))
                .await?;
            batches += 1;
        }
        info!(%destination, records = records.len(), batches, "queued catalog snapshot");
        Ok(batches)
    }

    /// Discard everything queued for a destination.
    pub async fn drop_queue(&self, destination: &PodHost) -> Result<usize> {
        let dropped = self.store.drop_outbound(destination).await?;
        if dropped > 0 {
            info!(%destination, dropped, "dropped outbound queue");
        }
        Ok(dropped)
    }

    /// Deliver everything queued for one destination, head first.
    pub async fn drain_destination(&self, destination: &PodHost) -> Result<DrainReport> {
        let _guard = self.drains.lock(destination).await;
        let mut report = DrainReport::default();

        while let Some(head) = self.store.peek_outbound(destination).await? {
            if self.directory.state_of(destination).await? != RelationshipState::Friend {
                report.dropped += self.drop_queue(destination).await?;
                break;
            }

            let message = self.message_for(head.item);
            match self.deliver(destination, &message).await? {
                Delivery::Delivered => {
                    self.store.ack_outbound(destination, head.seq).await?;
                    self.directory
                        .update(destination, |p| {
                            p.reward();
                            p.last_seen_at = now_millis();
                        })
                        .await?;
                    report.delivered += 1;
                }
                Delivery::Invalid(reason) => {
                    warn!(%destination, seq = head.seq, %reason, "destination rejected item as invalid; dropping");
                    self.store.ack_outbound(destination, head.seq).await?;
                    report.dropped += 1;
                }
                Delivery::Abandoned => {
                    report.dropped += self.drop_queue(destination).await?;
                    break;
                }
                Delivery::Exhausted => {
                    self.store.ack_outbound(destination, head.seq).await?;
                    report.exhausted += 1;

                    let (score, demoted) = self
                        .directory
                        .update(destination, |p| {
                            let low = p.penalize();
                            let demote = low && p.state == RelationshipState::Friend;
                            if demote {
                                p.state = RelationshipState::Unknown;
                            }
                            (p.score, demote)
                        })
                        .await?;
                    warn!(%destination, seq = head.seq, score, "delivery exhausted retries; item dropped");

                    if demoted {
                        warn!(%destination, score, "pod unreachable; demoted from friend");
                        report.dropped += self.drop_queue(destination).await?;
                        report.demoted.push(destination.clone());
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Drain every destination with queued items, one after another.
    pub async fn drain_all(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        for destination in self.store.outbound_destinations().await? {
            report.merge(self.drain_destination(&destination).await?);
        }
        Ok(report)
    }

    /// Total items waiting across all destinations.
    pub async fn pending(&self) -> Result<usize> {
        Ok(self.store.outbound_len(None).await?)
    }

    fn message_for(&self, item: OutboundItem) -> PodMessage {
        let sender = self.transport.local_host().clone();
        match item {
            OutboundItem::Event(event) => PodMessage::Event { sender, event },
            OutboundItem::Snapshot(records) => PodMessage::Snapshot { sender, records },
        }
    }

    async fn deliver(&self, destination: &PodHost, message: &PodMessage) -> Result<Delivery> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if self.directory.state_of(destination).await? != RelationshipState::Friend {
                return Ok(Delivery::Abandoned);
            }

            let failure = match self.transport.send(destination, message.clone()).await {
                Ok(PodReply::Ack) | Ok(PodReply::Accepted(_)) => return Ok(Delivery::Delivered),
                Ok(PodReply::Invalid { reason }) => return Ok(Delivery::Invalid(reason)),
                Ok(PodReply::Rejected { reason }) => reason,
                Err(e) => e.to_string(),
            };

            attempt += 1;
            if attempt >= max_attempts {
                return Ok(Delivery::Exhausted);
            }

            let delay = self.config.retry.calculate_delay(attempt - 1);
            debug!(
                %destination,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %failure,
                "delivery failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl<S, T> Propagator<S, T>
where
    S: Store + 'static,
    T: Transport + 'static,
{
    /// Background loop: one drain task per destination with queued items.
    ///
    /// Runs until `shutdown` flips to true. Drains already running finish
    /// their current attempt on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut drains: HashMap<PodHost, JoinHandle<()>> = HashMap::new();
        info!("propagation loop started");

        loop {
            drains.retain(|_, handle| !handle.is_finished());

            match self.store.outbound_destinations().await {
                Ok(destinations) => {
                    for destination in destinations {
                        if drains.contains_key(&destination) {
                            continue;
                        }
                        let this = Arc::clone(&self);
                        let host = destination.clone();
                        let handle = tokio::spawn(async move {
                            if let Err(e) = this.drain_destination(&host).await {
                                warn!(destination = %host, error = %e, "drain failed");
                            }
                        });
                        drains.insert(destination, handle);
                    }
                }
                Err(e) => warn!(error = %e, "failed to list outbound destinations"),
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(running = drains.len(), "propagation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::MessageHandler;
    use async_trait::async_trait;
    use podfed_core::pod::{INITIAL_SCORE, SCORE_MALUS};
    use podfed_core::{EventPayload, LogicalTimestamp, Pod, VideoRecord, VideoUuid};
    use podfed_store::MemoryStore;
    use std::sync::Mutex;

    /// Records every message and answers with a fixed reply.
    struct Recorder {
        reply: PodReply,
        seen: Mutex<Vec<PodMessage>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, message: PodMessage) -> PodReply {
            self.seen.lock().unwrap().push(message);
            self.reply.clone()
        }
    }

    fn host(s: &str) -> PodHost {
        PodHost::new(s).unwrap()
    }

    fn event(ts: u64) -> PropagationEvent {
        PropagationEvent::new(
            VideoUuid::from_bytes([4u8; 16]),
            host("a.example"),
            LogicalTimestamp(ts),
            EventPayload::ViewsIncremented { delta: 1 },
        )
    }

    struct Setup {
        network: Arc<MemoryNetwork>,
        store: Arc<MemoryStore>,
        directory: Arc<PodDirectory<MemoryStore>>,
        propagator: Propagator<MemoryStore, crate::transport::memory::MemoryTransport>,
    }

    fn fast_config() -> PropagatorConfig {
        PropagatorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
            snapshot_batch_size: 2,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn setup() -> Setup {
        let network = MemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(PodDirectory::new(Arc::clone(&store)));
        let transport = Arc::new(network.transport(host("a.example")));
        let propagator = Propagator::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&directory),
            fast_config(),
        );
        Setup {
            network,
            store,
            directory,
            propagator,
        }
    }

    async fn add_peer(setup: &Setup, name: &str, state: RelationshipState, reply: PodReply) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let weak: std::sync::Weak<dyn MessageHandler> = Arc::downgrade(&recorder) as _;
        setup.network.register(host(name), weak).await;
        setup
            .directory
            .update(&host(name), |p| p.state = state)
            .await
            .unwrap();
        recorder
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: false,
        };
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(800));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(1000));
        assert_eq!(policy.calculate_delay(40), Duration::from_millis(1000));

        let jittered = RetryPolicy { jitter: true, ..policy };
        for attempt in 0..6 {
            let d = jittered.calculate_delay(attempt);
            let base = Duration::from_millis((100u64 << attempt).min(1000));
            assert!(d >= base && d <= base + base / 2);
        }
    }

    #[tokio::test]
    async fn test_broadcast_only_to_friends() {
        let s = setup();
        add_peer(&s, "b.example", RelationshipState::Friend, PodReply::Ack).await;
        add_peer(&s, "c.example", RelationshipState::Friend, PodReply::Ack).await;
        add_peer(&s, "d.example", RelationshipState::PendingOutbound, PodReply::Ack).await;

        let excluded = host("c.example");
        let n = s.propagator.broadcast(&event(1), &[&excluded]).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(s.store.outbound_destinations().await.unwrap(), vec![host("b.example")]);
    }

    #[tokio::test]
    async fn test_drain_delivers_in_order_and_rewards() {
        let s = setup();
        let b = add_peer(&s, "b.example", RelationshipState::Friend, PodReply::Ack).await;
        for ts in 1..=3 {
            s.propagator.broadcast(&event(ts), &[]).await.unwrap();
        }

        let report = s.propagator.drain_all().await.unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(s.propagator.pending().await.unwrap(), 0);

        let timestamps: Vec<u64> = b
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                PodMessage::Event { sender, event } => {
                    assert_eq!(sender, &host("a.example"));
                    event.timestamp.as_u64()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(timestamps, vec![1, 2, 3]);

        let pod = s.directory.get(&host("b.example")).await.unwrap().unwrap();
        assert_eq!(pod.score, INITIAL_SCORE + 30);
        assert!(pod.last_seen_at > 0);
    }

    #[tokio::test]
    async fn test_exhaustion_penalizes_then_demotes() {
        let s = setup();
        add_peer(&s, "b.example", RelationshipState::Friend, PodReply::Ack).await;
        s.network.set_reachable(&host("b.example"), false).await;

        s.propagator.broadcast(&event(1), &[]).await.unwrap();
        let report = s.propagator.drain_all().await.unwrap();
        assert_eq!(report.exhausted, 1);
        let pod = s.directory.get(&host("b.example")).await.unwrap().unwrap();
        assert_eq!(pod.score, INITIAL_SCORE - SCORE_MALUS);
        assert_eq!(pod.state, RelationshipState::Friend);

        // Bring the score to the edge, then queue two more items.
        s.directory
            .update(&host("b.example"), |p: &mut Pod| p.score = SCORE_MALUS)
            .await
            .unwrap();
        s.propagator.broadcast(&event(2), &[]).await.unwrap();
        s.propagator.broadcast(&event(3), &[]).await.unwrap();

        let report = s.propagator.drain_all().await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.demoted, vec![host("b.example")]);
        assert_eq!(
            s.directory.state_of(&host("b.example")).await.unwrap(),
            RelationshipState::Unknown
        );
        assert_eq!(s.propagator.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_reply_drops_without_malus() {
        let s = setup();
        add_peer(
            &s,
            "b.example",
            RelationshipState::Friend,
            PodReply::Invalid {
                reason: "bad".into(),
            },
        )
        .await;
        s.propagator.broadcast(&event(1), &[]).await.unwrap();

        let report = s.propagator.drain_all().await.unwrap();
        assert_eq!(report.dropped, 1);
        let pod = s.directory.get(&host("b.example")).await.unwrap().unwrap();
        assert_eq!(pod.score, INITIAL_SCORE);
    }

    #[tokio::test]
    async fn test_removed_destination_queue_is_dropped() {
        let s = setup();
        let b = add_peer(&s, "b.example", RelationshipState::Friend, PodReply::Ack).await;
        s.propagator.broadcast(&event(1), &[]).await.unwrap();
        s.directory
            .update(&host("b.example"), |p| p.state = RelationshipState::Removed)
            .await
            .unwrap();

        let report = s.propagator.drain_all().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(b.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_batched() {
        let s = setup();
        let b = add_peer(&s, "b.example", RelationshipState::Friend, PodReply::Ack).await;
        let records: Vec<SnapshotRecord> = (0..5)
            .map(|i| {
                let origin = host("a.example");
                let record = VideoRecord::from_added(
                    VideoUuid::new_v4(),
                    origin.clone(),
                    &podfed_core::VideoAddedPayload {
                        name: format!("v{i}"),
                        description: String::new(),
                        tags: vec![],
                        duration: 1,
                        author: "root".into(),
                        content_id: podfed_core::ContentId::from_content(&[i]),
                        thumbnail_path: String::new(),
                        created_at: i as i64,
                    },
                    &podfed_core::Stamp::new(LogicalTimestamp(1), origin),
                );
                SnapshotRecord::new(record, vec![])
            })
            .collect();

        let batches = s
            .propagator
            .send_snapshot(&host("b.example"), records)
            .await
            .unwrap();
        assert_eq!(batches, 3);
        s.propagator.drain_all().await.unwrap();

        let sizes: Vec<usize> = b
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                PodMessage::Snapshot { records, .. } => records.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_run_loop_drains_and_stops() {
        let s = setup();
        let b = add_peer(&s, "b.example", RelationshipState::Friend, PodReply::Ack).await;
        let propagator = Arc::new(s.propagator);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&propagator).run(rx));

        propagator.broadcast(&event(1), &[]).await.unwrap();
        for _ in 0..100 {
            if !b.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(b.seen.lock().unwrap().len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
