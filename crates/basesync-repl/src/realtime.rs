//! Realtime lease manager: single-owner routing of live subscriptions.
//!
//! Every resource with live subscribers is owned by exactly one instance,
//! recorded as a time-bounded [`SubscriptionLease`]. The owner extends the
//! lease by heartbeat; an instance that stops heartbeating loses the lease
//! once it expires, and any instance may then claim it. Ownership changes are
//! replicated as realtime events so every peer keeps an eventually consistent
//! registry.
//!
//! When two instances claim the same resource concurrently, the claim from
//! the lexically smaller instance ID is kept everywhere.

use crate::config::LeaseConfig;
use crate::error::SyncError;
use crate::event::{Event, EventType};
use crate::heartbeat::HeartbeatSchedule;
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ownership record for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionLease {
    /// Subscribed resource.
    pub resource_id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Live connections on the owner.
    pub active_connections: u32,
    /// Expiry unless refreshed.
    pub lease_expires: DateTime<Utc>,
    /// Last subscribe, unsubscribe or heartbeat.
    pub last_activity: DateTime<Utc>,
}

impl SubscriptionLease {
    /// Whether the lease has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires <= now
    }

    fn to_payload(&self) -> Result<Map<String, Value>, SyncError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(SyncError::malformed("lease did not serialize to an object")),
        }
    }

    fn from_payload(payload: &Map<String, Value>) -> Result<Self, SyncError> {
        Ok(serde_json::from_value(Value::Object(payload.clone()))?)
    }
}

/// Result of mirroring a remote realtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLeaseOutcome {
    /// Self-originated, nothing to do.
    Ignored,
    /// Registry entry created or refreshed.
    Recorded,
    /// Registry entry removed.
    Released,
    /// Rejected: another unexpired owner wins.
    Rejected {
        /// The instance that keeps the lease.
        owner: String,
    },
    /// This instance lost a concurrent claim and dropped its own lease.
    Yielded,
    /// Older than what is already known from the same origin, or carrying a
    /// lease that has already expired. Dropped.
    Stale,
}

/// Tracks subscription leases and drives heartbeats for the ones owned here.
pub struct LeaseManager {
    local_id: String,
    config: LeaseConfig,
    leases: RwLock<HashMap<String, SubscriptionLease>>,
    /// (resource, origin) -> timestamp of the newest remote event applied.
    /// Outlives released leases so late copies of older events are dropped.
    marks: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    schedule: Mutex<HeartbeatSchedule>,
    schedule_changed: Notify,
    publisher: Publisher,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("local_id", &self.local_id)
            .field("config", &self.config)
            .finish()
    }
}

impl LeaseManager {
    /// Create a manager publishing through `publisher`.
    pub fn new(local_id: impl Into<String>, config: LeaseConfig, publisher: Publisher) -> Self {
        Self {
            local_id: local_id.into(),
            config,
            leases: RwLock::new(HashMap::new()),
            marks: Mutex::new(HashMap::new()),
            schedule: Mutex::new(HeartbeatSchedule::new()),
            schedule_changed: Notify::new(),
            publisher,
        }
    }

    fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.lease_duration_ms as i64)
    }

    fn marks(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), DateTime<Utc>>> {
        self.marks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn schedule(&self) -> std::sync::MutexGuard<'_, HeartbeatSchedule> {
        self.schedule.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn schedule_heartbeat(&self, resource_id: &str) {
        let at = Instant::now() + self.config.heartbeat_interval();
        self.schedule().schedule(resource_id, at);
        self.schedule_changed.notify_one();
    }

    fn cancel_heartbeat(&self, resource_id: &str) {
        if self.schedule().cancel(resource_id) {
            debug!(resource_id, "heartbeat cancelled");
        }
    }

    async fn broadcast(&self, event_type: EventType, lease: &SubscriptionLease) {
        let event = match lease
            .to_payload()
            .and_then(|p| Event::realtime(event_type, &self.local_id, &lease.resource_id, p))
        {
            Ok(event) => event,
            Err(e) => {
                warn!(resource_id = %lease.resource_id, error = %e, "cannot build realtime event");
                return;
            }
        };
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(
                local = %self.local_id,
                resource_id = %lease.resource_id,
                event_type = ?event_type,
                error = %e,
                "realtime event not published"
            );
        }
    }

    /// A local client subscribed to `resource_id`.
    ///
    /// Claims the resource when it is unowned or its lease expired, or adds a
    /// connection to the lease this instance already holds. Fails with
    /// [`SyncError::OwnedElsewhere`] while another instance holds an
    /// unexpired lease.
    pub async fn handle_subscribe(&self, resource_id: &str) -> Result<SubscriptionLease, SyncError> {
        let now = Utc::now();
        let (lease, claimed) = {
            let mut leases = self.leases.write().await;
            match leases.get_mut(resource_id) {
                Some(lease) if lease.instance_id == self.local_id => {
                    lease.active_connections += 1;
                    lease.lease_expires = now + self.lease_duration();
                    lease.last_activity = now;
                    (lease.clone(), false)
                }
                Some(lease) if !lease.is_expired(now) => {
                    return Err(SyncError::OwnedElsewhere {
                        resource_id: resource_id.to_string(),
                        owner: lease.instance_id.clone(),
                    });
                }
                existing => {
                    if let Some(expired) = existing {
                        info!(
                            resource_id,
                            previous_owner = %expired.instance_id,
                            "taking over expired lease"
                        );
                    }
                    let lease = SubscriptionLease {
                        resource_id: resource_id.to_string(),
                        instance_id: self.local_id.clone(),
                        active_connections: 1,
                        lease_expires: now + self.lease_duration(),
                        last_activity: now,
                    };
                    leases.insert(resource_id.to_string(), lease.clone());
                    (lease, true)
                }
            }
        };

        if claimed || !self.schedule().contains(resource_id) {
            self.schedule_heartbeat(resource_id);
        }
        if claimed {
            info!(local = %self.local_id, resource_id, "lease acquired");
        }
        self.broadcast(EventType::RealtimeSubscribe, &lease).await;
        Ok(lease)
    }

    /// A local client unsubscribed from `resource_id`.
    ///
    /// Returns the remaining connection count, or `None` when the resource is
    /// unknown or owned by another instance (no-op). At zero the lease is
    /// released and peers are told.
    pub async fn handle_unsubscribe(&self, resource_id: &str) -> Option<u32> {
        let now = Utc::now();
        let (remaining, released) = {
            let mut leases = self.leases.write().await;
            let lease = leases.get_mut(resource_id)?;
            if lease.instance_id != self.local_id {
                return None;
            }
            lease.active_connections = lease.active_connections.saturating_sub(1);
            lease.last_activity = now;
            if lease.active_connections == 0 {
                (0, leases.remove(resource_id))
            } else {
                (lease.active_connections, None)
            }
        };

        if let Some(lease) = released {
            self.cancel_heartbeat(resource_id);
            info!(local = %self.local_id, resource_id, "lease released");
            self.broadcast(EventType::RealtimeUnsubscribe, &lease).await;
        }
        Some(remaining)
    }

    /// Mirror a realtime event from a peer into the registry. Never schedules
    /// heartbeats.
    pub async fn process_realtime_event(&self, event: &Event) -> Result<RemoteLeaseOutcome, SyncError> {
        if !event.event_type().is_realtime() {
            return Err(SyncError::malformed(format!(
                "{:?} is not a realtime event",
                event.event_type()
            )));
        }
        let origin = event.instance_id();
        if origin == self.local_id {
            return Ok(RemoteLeaseOutcome::Ignored);
        }
        let payload = event
            .realtime_data()
            .ok_or_else(|| SyncError::malformed("realtime event without realtimeData"))?;
        let mut incoming = SubscriptionLease::from_payload(payload)?;
        incoming.instance_id = origin.to_string();
        incoming.resource_id = event.record_id().to_string();
        let resource_id = incoming.resource_id.clone();
        let now = Utc::now();

        let version = event.timestamp();

        let outcome = {
            let mut leases = self.leases.write().await;
            let mut marks = self.marks();
            let mark_key = (resource_id.clone(), origin.to_string());
            let outcome = if marks.get(&mark_key).is_some_and(|seen| version < *seen) {
                RemoteLeaseOutcome::Stale
            } else {
                match event.event_type() {
                    EventType::RealtimeUnsubscribe => match leases.get(&resource_id) {
                        Some(lease) if lease.instance_id == origin => {
                            if lease.last_activity > incoming.last_activity {
                                RemoteLeaseOutcome::Stale
                            } else {
                                leases.remove(&resource_id);
                                RemoteLeaseOutcome::Released
                            }
                        }
                        Some(lease) => RemoteLeaseOutcome::Rejected {
                            owner: lease.instance_id.clone(),
                        },
                        None => RemoteLeaseOutcome::Released,
                    },
                    _ if incoming.is_expired(now) => RemoteLeaseOutcome::Stale,
                    _ => match leases.get(&resource_id) {
                        Some(lease) if lease.instance_id == origin => {
                            if lease.last_activity > incoming.last_activity {
                                RemoteLeaseOutcome::Stale
                            } else {
                                leases.insert(resource_id.clone(), incoming);
                                RemoteLeaseOutcome::Recorded
                            }
                        }
                        // Both claims are unexpired here.
                        Some(lease) if !lease.is_expired(now) => {
                            if lease.instance_id.as_str() < origin {
                                RemoteLeaseOutcome::Rejected {
                                    owner: lease.instance_id.clone(),
                                }
                            } else if lease.instance_id == self.local_id {
                                leases.insert(resource_id.clone(), incoming);
                                RemoteLeaseOutcome::Yielded
                            } else {
                                leases.insert(resource_id.clone(), incoming);
                                RemoteLeaseOutcome::Recorded
                            }
                        }
                        _ => {
                            leases.insert(resource_id.clone(), incoming);
                            RemoteLeaseOutcome::Recorded
                        }
                    },
                }
            };
            if outcome != RemoteLeaseOutcome::Stale {
                let seen = marks.entry(mark_key).or_insert(version);
                if version > *seen {
                    *seen = version;
                }
            }
            outcome
        };

        match &outcome {
            RemoteLeaseOutcome::Yielded => {
                self.cancel_heartbeat(&resource_id);
                warn!(
                    local = %self.local_id,
                    resource_id = %resource_id,
                    owner = origin,
                    "concurrent claim, yielding lease"
                );
            }
            RemoteLeaseOutcome::Stale => debug!(
                resource_id = %resource_id,
                origin,
                event_type = ?event.event_type(),
                "stale realtime event dropped"
            ),
            RemoteLeaseOutcome::Rejected { owner } => debug!(
                resource_id = %resource_id,
                origin,
                owner = %owner,
                "remote lease claim rejected"
            ),
            _ => debug!(
                resource_id = %resource_id,
                origin,
                event_type = ?event.event_type(),
                "remote lease mirrored"
            ),
        }
        Ok(outcome)
    }

    /// Refresh one owned lease. Returns false if it is no longer ours.
    async fn heartbeat(&self, resource_id: &str) -> bool {
        let now = Utc::now();
        let lease = {
            let mut leases = self.leases.write().await;
            match leases.get_mut(resource_id) {
                Some(lease) if lease.instance_id == self.local_id => {
                    lease.lease_expires = now + self.lease_duration();
                    lease.last_activity = now;
                    Some(lease.clone())
                }
                _ => None,
            }
        };
        match lease {
            Some(lease) => {
                self.schedule_heartbeat(resource_id);
                self.broadcast(EventType::RealtimeHeartbeat, &lease).await;
                true
            }
            None => {
                debug!(resource_id, "lease no longer owned, heartbeat dropped");
                false
            }
        }
    }

    /// Delete every expired lease, whoever owns it. Returns the removed
    /// resource IDs.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<SubscriptionLease> = {
            let mut leases = self.leases.write().await;
            let ids: Vec<String> = leases
                .values()
                .filter(|l| l.is_expired(now))
                .map(|l| l.resource_id.clone())
                .collect();
            ids.iter().filter_map(|id| leases.remove(id)).collect()
        };
        // A claim older than one lease duration is already expired on arrival,
        // so its mark is no longer needed.
        let horizon = now - self.lease_duration();
        self.marks().retain(|_, seen| *seen > horizon);
        for lease in &expired {
            if lease.instance_id == self.local_id {
                self.cancel_heartbeat(&lease.resource_id);
            }
            info!(
                resource_id = %lease.resource_id,
                owner = %lease.instance_id,
                "expired lease removed"
            );
        }
        expired.into_iter().map(|l| l.resource_id).collect()
    }

    /// Release every lease held here and tell peers.
    pub async fn release_all(&self) -> usize {
        let owned: Vec<SubscriptionLease> = {
            let mut leases = self.leases.write().await;
            let ids: Vec<String> = leases
                .values()
                .filter(|l| l.instance_id == self.local_id)
                .map(|l| l.resource_id.clone())
                .collect();
            ids.iter().filter_map(|id| leases.remove(id)).collect()
        };
        for lease in &owned {
            self.cancel_heartbeat(&lease.resource_id);
            self.broadcast(EventType::RealtimeUnsubscribe, lease).await;
        }
        owned.len()
    }

    /// Current unexpired owner of `resource_id`.
    pub async fn owner_of(&self, resource_id: &str) -> Option<String> {
        let now = Utc::now();
        self.leases
            .read()
            .await
            .get(resource_id)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.instance_id.clone())
    }

    /// Whether this instance holds an unexpired lease on `resource_id`.
    pub async fn is_owner(&self, resource_id: &str) -> bool {
        self.owner_of(resource_id).await.as_deref() == Some(self.local_id.as_str())
    }

    /// The registry entry for `resource_id`, expired or not.
    pub async fn lease(&self, resource_id: &str) -> Option<SubscriptionLease> {
        self.leases.read().await.get(resource_id).cloned()
    }

    /// Snapshot of the registry, sorted by resource ID.
    pub async fn leases(&self) -> Vec<SubscriptionLease> {
        let mut all: Vec<SubscriptionLease> = self.leases.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        all
    }

    /// Number of heartbeats scheduled.
    pub fn scheduled_heartbeats(&self) -> usize {
        self.schedule().len()
    }

    /// Heartbeat loop: fires due heartbeats until `cancel`.
    pub async fn run_heartbeats(&self, cancel: CancellationToken) {
        loop {
            let next = self.schedule().next_deadline();
            let wake_at = next.unwrap_or_else(|| Instant::now() + self.config.lease_duration());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.schedule_changed.notified() => continue,
                _ = tokio::time::sleep_until(wake_at) => {}
            }
            let due = self.schedule().pop_due(Instant::now());
            for resource_id in due {
                self.heartbeat(&resource_id).await;
            }
        }
        debug!(local = %self.local_id, "heartbeat loop stopped");
    }

    /// Cleanup loop: sweeps expired leases every `sweep_interval` until `cancel`.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired().await;
                }
            }
        }
        debug!(local = %self.local_id, "lease sweeper stopped");
    }

    /// Spawn the heartbeat and cleanup loops.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let heartbeats = {
            let manager = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run_heartbeats(cancel).await })
        };
        let sweeper = {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_sweeper(cancel).await })
        };
        vec![heartbeats, sweeper]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::{ensure_stream, TransportSettings};
    use basesync_log::LogServer;
    use std::time::Duration;

    fn fast_leases() -> LeaseConfig {
        LeaseConfig {
            lease_duration_ms: 300,
            heartbeat_interval_ms: 100,
            sweep_interval_ms: 50,
        }
    }

    async fn manager(id: &str, config: LeaseConfig) -> (Arc<LeaseManager>, LogServer) {
        let log = LogServer::in_memory(id);
        let settings = TransportSettings::from_config(&SyncConfig::for_instance(id));
        ensure_stream(&log.connect(), &settings).unwrap();
        let publisher = Publisher::new(id, "basesync");
        publisher.add_connection("", log.connect()).await;
        (Arc::new(LeaseManager::new(id, config, publisher)), log)
    }

    fn remote(event_type: EventType, origin: &str, resource: &str, expires_in_ms: i64) -> Event {
        remote_at(event_type, origin, resource, Utc::now(), expires_in_ms)
    }

    fn remote_at(
        event_type: EventType,
        origin: &str,
        resource: &str,
        at: DateTime<Utc>,
        expires_in_ms: i64,
    ) -> Event {
        let lease = SubscriptionLease {
            resource_id: resource.to_string(),
            instance_id: origin.to_string(),
            active_connections: 1,
            lease_expires: at + chrono::Duration::milliseconds(expires_in_ms),
            last_activity: at,
        };
        Event::realtime(event_type, origin, resource, lease.to_payload().unwrap())
            .unwrap()
            .with_timestamp(at)
    }

    #[tokio::test]
    async fn test_subscribe_claims_and_counts() {
        let (m, log) = manager("a", fast_leases()).await;
        let lease = m.handle_subscribe("posts").await.unwrap();
        assert_eq!(lease.instance_id, "a");
        assert_eq!(lease.active_connections, 1);
        assert_eq!(m.scheduled_heartbeats(), 1);

        let lease = m.handle_subscribe("posts").await.unwrap();
        assert_eq!(lease.active_connections, 2);
        assert_eq!(m.owner_of("posts").await.as_deref(), Some("a"));
        assert_eq!(log.connect().stream_info("BASESYNC").unwrap().messages, 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_at_zero() {
        let (m, _log) = manager("a", fast_leases()).await;
        m.handle_subscribe("posts").await.unwrap();
        m.handle_subscribe("posts").await.unwrap();
        assert_eq!(m.handle_unsubscribe("posts").await, Some(1));
        assert_eq!(m.handle_unsubscribe("posts").await, Some(0));
        assert!(m.lease("posts").await.is_none());
        assert_eq!(m.scheduled_heartbeats(), 0);
        assert_eq!(m.handle_unsubscribe("posts").await, None);
    }

    #[tokio::test]
    async fn test_owned_elsewhere_until_expiry() {
        let (m, _log) = manager("b", fast_leases()).await;
        let claim = remote(EventType::RealtimeSubscribe, "a", "posts", 150);
        assert_eq!(
            m.process_realtime_event(&claim).await.unwrap(),
            RemoteLeaseOutcome::Recorded
        );
        let err = m.handle_subscribe("posts").await.unwrap_err();
        assert!(matches!(err, SyncError::OwnedElsewhere { ref owner, .. } if owner == "a"));
        assert_eq!(m.handle_unsubscribe("posts").await, None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let lease = m.handle_subscribe("posts").await.unwrap();
        assert_eq!(lease.instance_id, "b");
    }

    #[tokio::test]
    async fn test_remote_cannot_override_unexpired_owner() {
        let (m, _log) = manager("z", fast_leases()).await;
        m.process_realtime_event(&remote(EventType::RealtimeSubscribe, "a", "posts", 10_000))
            .await
            .unwrap();
        let outcome = m
            .process_realtime_event(&remote(EventType::RealtimeHeartbeat, "b", "posts", 10_000))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RemoteLeaseOutcome::Rejected {
                owner: "a".to_string()
            }
        );
        let outcome = m
            .process_realtime_event(&remote(EventType::RealtimeUnsubscribe, "b", "posts", 0))
            .await
            .unwrap();
        assert!(matches!(outcome, RemoteLeaseOutcome::Rejected { .. }));
        assert_eq!(m.owner_of("posts").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_concurrent_claim_smaller_id_wins() {
        let (m, _log) = manager("b", fast_leases()).await;
        m.handle_subscribe("posts").await.unwrap();
        let outcome = m
            .process_realtime_event(&remote(EventType::RealtimeSubscribe, "a", "posts", 10_000))
            .await
            .unwrap();
        assert_eq!(outcome, RemoteLeaseOutcome::Yielded);
        assert_eq!(m.owner_of("posts").await.as_deref(), Some("a"));
        assert_eq!(m.scheduled_heartbeats(), 0);

        let (m, _log) = manager("a", fast_leases()).await;
        m.handle_subscribe("posts").await.unwrap();
        let outcome = m
            .process_realtime_event(&remote(EventType::RealtimeSubscribe, "b", "posts", 10_000))
            .await
            .unwrap();
        assert!(matches!(outcome, RemoteLeaseOutcome::Rejected { .. }));
        assert!(m.is_owner("posts").await);
    }

    mod ordering {
        use super::*;

        #[tokio::test]
        async fn test_expired_claim_never_displaces_live_owner() {
            let (m, _log) = manager("b", fast_leases()).await;
            m.handle_subscribe("chat").await.unwrap();
            let replayed = remote(EventType::RealtimeHeartbeat, "a", "chat", -60_000);
            assert_eq!(
                m.process_realtime_event(&replayed).await.unwrap(),
                RemoteLeaseOutcome::Stale
            );
            assert!(m.is_owner("chat").await);
            assert_eq!(m.scheduled_heartbeats(), 1);
        }

        #[tokio::test]
        async fn test_expired_claim_not_recorded() {
            let (m, _log) = manager("b", fast_leases()).await;
            let replayed = remote(EventType::RealtimeSubscribe, "a", "chat", -1);
            assert_eq!(
                m.process_realtime_event(&replayed).await.unwrap(),
                RemoteLeaseOutcome::Stale
            );
            assert!(m.lease("chat").await.is_none());
        }

        #[tokio::test]
        async fn test_late_copy_after_release_is_dropped() {
            let (m, _log) = manager("b", fast_leases()).await;
            let t0 = Utc::now();
            let subscribe = remote_at(EventType::RealtimeSubscribe, "a", "chat", t0, 30_000);
            let unsubscribe = remote_at(
                EventType::RealtimeUnsubscribe,
                "a",
                "chat",
                t0 + chrono::Duration::milliseconds(10),
                30_000,
            );
            assert_eq!(
                m.process_realtime_event(&subscribe).await.unwrap(),
                RemoteLeaseOutcome::Recorded
            );
            assert_eq!(
                m.process_realtime_event(&unsubscribe).await.unwrap(),
                RemoteLeaseOutcome::Released
            );

            // Second copy of the subscribe, from the other log.
            assert_eq!(
                m.process_realtime_event(&subscribe).await.unwrap(),
                RemoteLeaseOutcome::Stale
            );
            assert!(m.owner_of("chat").await.is_none());

            let lease = m.handle_subscribe("chat").await.unwrap();
            assert_eq!(lease.instance_id, "b");
            assert_eq!(
                m.process_realtime_event(&subscribe).await.unwrap(),
                RemoteLeaseOutcome::Stale
            );
            assert!(m.is_owner("chat").await);
            assert_eq!(m.scheduled_heartbeats(), 1);
        }

        #[tokio::test]
        async fn test_older_heartbeat_does_not_rewind_expiry() {
            let (m, _log) = manager("b", fast_leases()).await;
            let t0 = Utc::now();
            let first = remote_at(EventType::RealtimeHeartbeat, "a", "chat", t0, 10_000);
            let second = remote_at(
                EventType::RealtimeHeartbeat,
                "a",
                "chat",
                t0 + chrono::Duration::milliseconds(100),
                10_000,
            );
            m.process_realtime_event(&second).await.unwrap();
            assert_eq!(
                m.process_realtime_event(&first).await.unwrap(),
                RemoteLeaseOutcome::Stale
            );
            let lease = m.lease("chat").await.unwrap();
            assert_eq!(lease.last_activity, t0 + chrono::Duration::milliseconds(100));
        }

        #[tokio::test]
        async fn test_duplicate_heartbeat_is_recorded_again() {
            let (m, _log) = manager("b", fast_leases()).await;
            let hb = remote(EventType::RealtimeHeartbeat, "a", "chat", 10_000);
            for _ in 0..2 {
                assert_eq!(
                    m.process_realtime_event(&hb).await.unwrap(),
                    RemoteLeaseOutcome::Recorded
                );
            }
        }

        #[tokio::test]
        async fn test_old_unsubscribe_keeps_newer_lease() {
            let (m, _log) = manager("b", fast_leases()).await;
            let t0 = Utc::now();
            let unsubscribe = remote_at(EventType::RealtimeUnsubscribe, "a", "chat", t0, 10_000);
            let subscribe = remote_at(
                EventType::RealtimeSubscribe,
                "a",
                "chat",
                t0 + chrono::Duration::milliseconds(50),
                10_000,
            );
            m.process_realtime_event(&subscribe).await.unwrap();
            assert_eq!(
                m.process_realtime_event(&unsubscribe).await.unwrap(),
                RemoteLeaseOutcome::Stale
            );
            assert_eq!(m.owner_of("chat").await.as_deref(), Some("a"));
        }
    }

    #[tokio::test]
    async fn test_self_origin_ignored() {
        let (m, _log) = manager("a", fast_leases()).await;
        let outcome = m
            .process_realtime_event(&remote(EventType::RealtimeSubscribe, "a", "posts", 1_000))
            .await
            .unwrap();
        assert_eq!(outcome, RemoteLeaseOutcome::Ignored);
        assert!(m.lease("posts").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_keep_lease_alive() {
        let (m, log) = manager("a", fast_leases()).await;
        let cancel = CancellationToken::new();
        let handles = m.spawn(cancel.clone());
        let first = m.handle_subscribe("posts").await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        let lease = m.lease("posts").await.unwrap();
        assert!(lease.lease_expires > first.lease_expires);
        assert!(m.is_owner("posts").await);
        assert!(log.connect().stream_info("BASESYNC").unwrap().messages >= 3);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_remote_leases() {
        let (m, _log) = manager("b", fast_leases()).await;
        m.process_realtime_event(&remote(EventType::RealtimeSubscribe, "a", "posts", 50))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let handles = m.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(m.lease("posts").await.is_none());
        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_release_all() {
        let (m, _log) = manager("a", fast_leases()).await;
        m.handle_subscribe("posts").await.unwrap();
        m.handle_subscribe("tags").await.unwrap();
        assert_eq!(m.release_all().await, 2);
        assert!(m.leases().await.is_empty());
        assert_eq!(m.scheduled_heartbeats(), 0);
    }

    #[test]
    fn test_payload_wire_names() {
        let now = Utc::now();
        let lease = SubscriptionLease {
            resource_id: "posts".to_string(),
            instance_id: "a".to_string(),
            active_connections: 2,
            lease_expires: now,
            last_activity: now,
        };
        let payload = lease.to_payload().unwrap();
        assert_eq!(payload["resourceId"], "posts");
        assert_eq!(payload["activeConnections"], 2);
        assert!(payload.contains_key("leaseExpires"));
        assert!(payload.contains_key("lastActivity"));
        assert_eq!(SubscriptionLease::from_payload(&payload).unwrap(), lease);
    }
}
