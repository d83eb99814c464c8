//! Subscriber: durable pull consumers on every connected log, feeding a
//! bounded channel of inbound events.
//!
//! Each peer connection cycles `attached -> polling -> (delivered | timeout |
//! faulted) -> attached`. Fatal fetch errors back off exponentially; a peer
//! that faults `max_consecutive_errors` times in a row is evicted. A full
//! inbound channel naks the message so the log redelivers it later.

use crate::config::SubscriberConfig;
use crate::error::SyncError;
use crate::event::Event;
use crate::publisher::SELF_KEY;
use crate::transport::{attach_consumer, consumer_name, TransportSettings};
use basesync_log::{current_time_ms, LogClient, LogError, Message};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// One attached log.
#[derive(Clone)]
struct PeerConsumer {
    key: String,
    epoch: u64,
    client: LogClient,
    consumer: String,
    consecutive_errors: Arc<AtomicU32>,
    last_error_log_ms: Arc<AtomicU64>,
    last_acked: Arc<AtomicU64>,
}

/// Result of one poll of one peer.
#[derive(Debug)]
enum PollOutcome {
    Delivered,
    Timeout,
    Fatal { consecutive: u32, error: LogError },
    Transient,
    ChannelClosed,
}

/// In-flight polls, one per peer key. A poll task that panics or is aborted
/// still releases its key.
#[derive(Default)]
struct PollSet {
    tasks: JoinSet<(u64, PollOutcome)>,
    keys: HashMap<task::Id, String>,
    polling: HashSet<String>,
}

impl PollSet {
    fn contains(&self, key: &str) -> bool {
        self.polling.contains(key)
    }

    fn spawn<F>(&mut self, key: String, poll: F)
    where
        F: Future<Output = (u64, PollOutcome)> + Send + 'static,
    {
        let id = self.tasks.spawn(poll).id();
        self.polling.insert(key.clone());
        self.keys.insert(id, key);
    }

    /// Next finished poll. The outcome is `None` when the task did not
    /// complete normally.
    async fn join_next(&mut self) -> Option<(String, Option<(u64, PollOutcome)>)> {
        let (id, result) = match self.tasks.join_next_with_id().await? {
            Ok((id, result)) => (id, Some(result)),
            Err(e) => (e.id(), None),
        };
        let key = self.keys.remove(&id).unwrap_or_default();
        self.polling.remove(&key);
        Some((key, result))
    }

    fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}

#[derive(Debug, Default)]
struct SubscriberStatsInner {
    received: AtomicU64,
    self_filtered: AtomicU64,
    delivered: AtomicU64,
    backpressure_naks: AtomicU64,
    malformed: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of subscriber counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Messages fetched from any log.
    pub received: u64,
    /// Self-originated events acked and dropped.
    pub self_filtered: u64,
    /// Events forwarded to the inbound channel.
    pub delivered: u64,
    /// Messages nak'd because the inbound channel was full.
    pub backpressure_naks: u64,
    /// Undecodable messages nak'd.
    pub malformed: u64,
    /// Peers evicted after repeated fatal errors.
    pub evictions: u64,
}

struct SubscriberInner {
    local_id: String,
    settings: TransportSettings,
    config: SubscriberConfig,
    peers: RwLock<BTreeMap<String, PeerConsumer>>,
    peers_changed: Notify,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    stats: SubscriberStatsInner,
}

/// Pulls events from every attached log. Clones share state.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("local_id", &self.inner.local_id)
            .field("stream", &self.inner.settings.stream)
            .finish()
    }
}

impl Subscriber {
    /// Create a subscriber with no peers. The inbound channel holds
    /// `config.channel_capacity` events.
    pub fn new(
        local_id: impl Into<String>,
        settings: TransportSettings,
        config: SubscriberConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(SubscriberInner {
                local_id: local_id.into(),
                settings,
                config,
                peers: RwLock::new(BTreeMap::new()),
                peers_changed: Notify::new(),
                tx,
                rx: Mutex::new(Some(rx)),
                stats: SubscriberStatsInner::default(),
            }),
        }
    }

    /// Take the inbound event receiver. Returns `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.inner
            .rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    fn key_for<'a>(&self, instance_id: &'a str) -> &'a str {
        if instance_id == self.inner.local_id {
            SELF_KEY
        } else {
            instance_id
        }
    }

    /// Attach to a log and start consuming it.
    ///
    /// `start_sequence > 0` skips everything up to and including that
    /// sequence (covered by a snapshot). Re-adding a peer replaces its entry.
    pub async fn add_peer_connection(
        &self,
        client: LogClient,
        instance_id: &str,
        start_sequence: u64,
    ) -> Result<(), SyncError> {
        let key = self.key_for(instance_id).to_string();
        let info = attach_consumer(
            &client,
            &self.inner.settings,
            &self.inner.local_id,
            start_sequence,
        )?;
        let peer = PeerConsumer {
            key: key.clone(),
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            client,
            consumer: info.config.durable_name.clone(),
            consecutive_errors: Arc::new(AtomicU32::new(0)),
            last_error_log_ms: Arc::new(AtomicU64::new(0)),
            last_acked: Arc::new(AtomicU64::new(info.ack_floor)),
        };
        self.inner
            .peers
            .write()
            .await
            .insert(key.clone(), peer.clone());
        self.inner.peers_changed.notify_one();
        info!(
            local = %self.inner.local_id,
            peer = %key,
            consumer = %peer.consumer,
            start_sequence,
            num_pending = info.num_pending,
            "peer attached"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.probe(peer).await;
        });
        Ok(())
    }

    /// Stop consuming a peer log. Idempotent; the connection itself is left
    /// open. Returns true if the peer was attached.
    pub async fn remove_peer_connection(&self, instance_id: &str) -> bool {
        let key = self.key_for(instance_id);
        let removed = self.inner.peers.write().await.remove(key).is_some();
        if removed {
            self.inner.peers_changed.notify_one();
            info!(local = %self.inner.local_id, peer = %key, "peer detached");
        }
        removed
    }

    /// Attached peer keys (empty string for self).
    pub async fn peer_ids(&self) -> Vec<String> {
        self.inner.peers.read().await.keys().cloned().collect()
    }

    /// Highest acknowledged stream sequence per attached log.
    pub async fn last_acked_sequences(&self) -> BTreeMap<String, u64> {
        self.inner
            .peers
            .read()
            .await
            .iter()
            .map(|(k, p)| (k.clone(), p.last_acked.load(Ordering::Acquire)))
            .collect()
    }

    /// Wait until every peer consumer (self excluded) has nothing pending or
    /// awaiting acknowledgement. Returns false on timeout.
    pub async fn wait_for_catch_up(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(self.inner.config.catch_up_poll_ms.max(1));
        loop {
            let peers: Vec<PeerConsumer> = {
                let peers = self.inner.peers.read().await;
                peers
                    .values()
                    .filter(|p| p.key != SELF_KEY)
                    .cloned()
                    .collect()
            };
            let caught_up = peers.iter().all(|p| {
                match p
                    .client
                    .consumer_info(&self.inner.settings.stream, &p.consumer)
                {
                    Ok(info) => info.num_pending == 0 && info.num_ack_pending == 0,
                    Err(_) => false,
                }
            });
            if caught_up {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SubscriberStats {
        let s = &self.inner.stats;
        SubscriberStats {
            received: s.received.load(Ordering::Relaxed),
            self_filtered: s.self_filtered.load(Ordering::Relaxed),
            delivered: s.delivered.load(Ordering::Relaxed),
            backpressure_naks: s.backpressure_naks.load(Ordering::Relaxed),
            malformed: s.malformed.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
        }
    }

    /// Spawn the fetch loop.
    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let subscriber = self.clone();
        tokio::spawn(async move { subscriber.run(cancel).await })
    }

    /// Fetch loop. Polls every attached log concurrently until `cancel` fires
    /// or the inbound channel closes.
    pub async fn run(&self, cancel: CancellationToken) {
        let inner = &self.inner;
        let mut polls = PollSet::default();
        info!(local = %inner.local_id, "subscriber started");

        loop {
            let idle: Vec<PeerConsumer> = {
                let peers = inner.peers.read().await;
                peers
                    .values()
                    .filter(|p| !polls.contains(&p.key))
                    .cloned()
                    .collect()
            };
            for peer in idle {
                let inner = inner.clone();
                polls.spawn(peer.key.clone(), async move {
                    let outcome = inner.poll(&peer).await;
                    (peer.epoch, outcome)
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.peers_changed.notified() => {}
                Some((key, finished)) = polls.join_next() => {
                    let Some((epoch, outcome)) = finished else {
                        warn!(local = %inner.local_id, peer = %key, "poll task failed, retrying");
                        continue;
                    };
                    match outcome {
                        PollOutcome::ChannelClosed => {
                            warn!(local = %inner.local_id, "inbound channel closed, stopping subscriber");
                            break;
                        }
                        PollOutcome::Fatal { consecutive, error }
                            if consecutive >= inner.config.max_consecutive_errors =>
                        {
                            inner.evict(&key, epoch, consecutive, &error).await;
                        }
                        _ => {}
                    }
                }
            }
        }

        polls.abort_all();
        info!(local = %inner.local_id, "subscriber stopped");
    }
}

impl SubscriberInner {
    async fn poll(&self, peer: &PeerConsumer) -> PollOutcome {
        if self.tx.capacity() == 0 {
            match self.tx.reserve().await {
                Ok(permit) => drop(permit),
                Err(_) => return PollOutcome::ChannelClosed,
            }
        }
        // Never take more than the channel can hold right now.
        let batch = self.config.fetch_batch.min(self.tx.capacity()).max(1);
        let wait = Duration::from_millis(self.config.fetch_wait_ms);
        let fetched = peer
            .client
            .fetch(&self.settings.stream, &peer.consumer, batch, wait)
            .await;
        match fetched {
            Ok(messages) => {
                peer.consecutive_errors.store(0, Ordering::Relaxed);
                self.handle_messages(peer, messages).await
            }
            Err(e) if e.is_timeout() => {
                peer.consecutive_errors.store(0, Ordering::Relaxed);
                PollOutcome::Timeout
            }
            Err(e) if e.is_fatal() => {
                let consecutive = peer.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    local = %self.local_id,
                    peer = %peer.key,
                    consecutive,
                    error = %e,
                    "fatal fetch error"
                );
                if consecutive < self.config.max_consecutive_errors {
                    tokio::time::sleep(self.config.backoff(consecutive)).await;
                }
                PollOutcome::Fatal {
                    consecutive,
                    error: e,
                }
            }
            Err(e) => {
                let now = current_time_ms();
                let last = peer.last_error_log_ms.load(Ordering::Relaxed);
                if now.saturating_sub(last) >= self.config.error_log_interval_ms {
                    peer.last_error_log_ms.store(now, Ordering::Relaxed);
                    warn!(
                        local = %self.local_id,
                        peer = %peer.key,
                        error = %e,
                        "fetch error"
                    );
                }
                tokio::time::sleep(self.config.backoff(1)).await;
                PollOutcome::Transient
            }
        }
    }

    /// Decode, filter and forward fetched messages.
    async fn handle_messages(&self, peer: &PeerConsumer, messages: Vec<Message>) -> PollOutcome {
        let mut full = false;
        for msg in messages {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            if full {
                self.nak(peer, &msg);
                self.stats.backpressure_naks.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let mut event = match Event::decode(msg.payload()) {
                Ok(event) => event,
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        local = %self.local_id,
                        peer = %peer.key,
                        seq = msg.seq(),
                        deliveries = msg.deliveries(),
                        error = %e,
                        "malformed event"
                    );
                    self.nak(peer, &msg);
                    continue;
                }
            };

            if event.instance_id() == self.local_id {
                self.stats.self_filtered.fetch_add(1, Ordering::Relaxed);
                self.ack(peer, &msg);
                continue;
            }

            event.mark_remote();
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    self.ack(peer, &msg);
                }
                Err(TrySendError::Full(_)) => {
                    self.stats.backpressure_naks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        local = %self.local_id,
                        peer = %peer.key,
                        seq = msg.seq(),
                        "inbound channel full, nak"
                    );
                    self.nak(peer, &msg);
                    full = true;
                }
                Err(TrySendError::Closed(_)) => {
                    self.nak(peer, &msg);
                    return PollOutcome::ChannelClosed;
                }
            }
        }

        PollOutcome::Delivered
    }

    fn ack(&self, peer: &PeerConsumer, msg: &Message) {
        match msg.ack() {
            Ok(()) => {
                peer.last_acked.fetch_max(msg.seq(), Ordering::AcqRel);
            }
            Err(e) => warn!(
                local = %self.local_id,
                peer = %peer.key,
                seq = msg.seq(),
                error = %e,
                "ack failed"
            ),
        }
    }

    fn nak(&self, peer: &PeerConsumer, msg: &Message) {
        if let Err(e) = msg.nak() {
            debug!(
                local = %self.local_id,
                peer = %peer.key,
                seq = msg.seq(),
                error = %e,
                "nak failed"
            );
        }
    }

    /// Best-effort single-message fetch right after attaching.
    async fn probe(&self, peer: PeerConsumer) {
        let wait = Duration::from_millis(self.config.probe_wait_ms);
        match peer
            .client
            .fetch(&self.settings.stream, &peer.consumer, 1, wait)
            .await
        {
            Ok(messages) => {
                self.handle_messages(&peer, messages).await;
            }
            Err(e) => debug!(
                local = %self.local_id,
                peer = %peer.key,
                error = %e,
                "activation probe returned nothing"
            ),
        }
    }

    async fn evict(&self, key: &str, epoch: u64, consecutive: u32, error: &LogError) {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(key) {
                Some(p) if p.epoch == epoch => peers.remove(key),
                _ => None,
            }
        };
        let Some(peer) = removed else {
            return;
        };
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        warn!(
            local = %self.local_id,
            peer = %key,
            consecutive,
            error = %error,
            "evicting peer after repeated fatal errors"
        );
        if let Err(e) = peer
            .client
            .delete_consumer(&self.settings.stream, &consumer_name(&self.local_id))
        {
            debug!(peer = %key, error = %e, "consumer cleanup after eviction failed");
        }
    }
}
