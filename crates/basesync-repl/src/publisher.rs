//! Publisher: broadcast of local events to the instance's own log and every
//! connected peer log.

use crate::error::SyncError;
use crate::event::Event;
use basesync_log::LogClient;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Peer map key for the instance's own log.
pub const SELF_KEY: &str = "";

/// Result of publishing to one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Peer instance ID (empty for self).
    pub instance_id: String,
    /// Stream sequence assigned on success.
    pub seq: Option<u64>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl PublishResult {
    /// Whether this target accepted the event.
    pub fn succeeded(&self) -> bool {
        self.seq.is_some()
    }
}

/// Summary of one broadcast.
#[derive(Debug, Clone)]
pub struct PublishSummary {
    /// Subject the event was published on.
    pub subject: String,
    /// Per-target results, self first then peers by ID.
    pub results: Vec<PublishResult>,
}

impl PublishSummary {
    /// Number of targets attempted.
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    /// Number of targets that accepted the event.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    /// IDs of targets that failed.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.instance_id.as_str())
            .collect()
    }
}

#[derive(Debug, Default)]
struct PublisherStatsInner {
    published: AtomicU64,
    failed: AtomicU64,
    target_failures: AtomicU64,
}

/// Snapshot of publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Events accepted by at least one log.
    pub published: u64,
    /// Events no log accepted.
    pub failed: u64,
    /// Individual target failures.
    pub target_failures: u64,
}

/// Serializes events and appends them to every registered log.
#[derive(Clone)]
pub struct Publisher {
    local_id: String,
    namespace: String,
    connections: Arc<RwLock<BTreeMap<String, LogClient>>>,
    stats: Arc<PublisherStatsInner>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("local_id", &self.local_id)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl Publisher {
    /// Create a publisher with no connections.
    pub fn new(local_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            namespace: namespace.into(),
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            stats: Arc::new(PublisherStatsInner::default()),
        }
    }

    fn key_for<'a>(&self, instance_id: &'a str) -> &'a str {
        if instance_id == self.local_id {
            SELF_KEY
        } else {
            instance_id
        }
    }

    /// Register a connection. The local instance ID and the empty string both
    /// address the instance's own log. Replaces any previous connection.
    pub async fn add_connection(&self, instance_id: &str, client: LogClient) {
        let key = self.key_for(instance_id).to_string();
        let mut connections = self.connections.write().await;
        if let Some(old) = connections.insert(key.clone(), client) {
            if key != SELF_KEY {
                old.close();
            }
        }
        info!(local = %self.local_id, peer = %key, "publisher connection added");
    }

    /// Evict and close a peer connection. Idempotent; the self connection is
    /// never removed. Returns true if a connection was removed.
    pub async fn remove_peer_connection(&self, instance_id: &str) -> bool {
        let key = self.key_for(instance_id);
        if key == SELF_KEY {
            debug!(local = %self.local_id, "refusing to remove self connection");
            return false;
        }
        let removed = self.connections.write().await.remove(key);
        match removed {
            Some(client) => {
                client.close();
                info!(local = %self.local_id, peer = %key, "publisher connection removed");
                true
            }
            None => false,
        }
    }

    /// Registered connection keys (empty string for self).
    pub async fn connection_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Serialize `event` and append it to every registered log.
    ///
    /// Succeeds when at least one log accepted the event.
    pub async fn publish(&self, event: &Event) -> Result<PublishSummary, SyncError> {
        let payload = Bytes::from(event.encode()?);
        let subject = event.subject(&self.namespace);

        let targets: Vec<(String, LogClient)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(id, c)| (id.clone(), c.clone()))
                .collect()
        };
        if targets.is_empty() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::NoConnections);
        }

        let mut results = Vec::with_capacity(targets.len());
        let mut last_error = String::new();
        for (instance_id, client) in targets {
            match client.publish(&subject, payload.clone()) {
                Ok(ack) => results.push(PublishResult {
                    instance_id,
                    seq: Some(ack.seq),
                    error: None,
                }),
                Err(e) => {
                    self.stats.target_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        local = %self.local_id,
                        peer = %instance_id,
                        subject = %subject,
                        error = %e,
                        "publish to peer log failed"
                    );
                    last_error = e.to_string();
                    results.push(PublishResult {
                        instance_id,
                        seq: None,
                        error: Some(last_error.clone()),
                    });
                }
            }
        }

        let summary = PublishSummary { subject, results };
        if summary.succeeded() == 0 {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::PublishFailed {
                attempted: summary.attempted(),
                last_error,
            });
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            local = %self.local_id,
            subject = %summary.subject,
            targets = summary.attempted(),
            succeeded = summary.succeeded(),
            event_type = ?event.event_type(),
            "event published"
        );
        Ok(summary)
    }

    /// Publish in the background; failures are only logged.
    pub fn publish_async(&self, event: Event) -> tokio::task::JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&event).await {
                warn!(
                    local = %publisher.local_id,
                    record = %event.record_key(),
                    error = %e,
                    "background publish failed"
                );
            }
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.stats.published.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            target_failures: self.stats.target_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::{ensure_stream, TransportSettings};
    use basesync_log::LogServer;
    use serde_json::Map;

    fn log_with_stream(name: &str) -> LogServer {
        let server = LogServer::in_memory(name);
        let settings = TransportSettings::from_config(&SyncConfig::for_instance(name));
        ensure_stream(&server.connect(), &settings).unwrap();
        server
    }

    fn event() -> Event {
        Event::record_created("a", "posts", "r1", Map::new())
    }

    #[tokio::test]
    async fn test_no_connections_fails() {
        let publisher = Publisher::new("a", "basesync");
        let err = publisher.publish(&event()).await.unwrap_err();
        assert!(matches!(err, SyncError::NoConnections));
        assert_eq!(publisher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_log() {
        let own = log_with_stream("a");
        let peer = log_with_stream("b");
        let publisher = Publisher::new("a", "basesync");
        publisher.add_connection("a", own.connect()).await;
        publisher.add_connection("b", peer.connect()).await;
        assert_eq!(publisher.connection_ids().await, vec!["".to_string(), "b".to_string()]);

        let summary = publisher.publish(&event()).await.unwrap();
        assert_eq!(summary.subject, "basesync.sync.posts");
        assert_eq!(summary.attempted(), 2);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(peer.connect().stream_info("BASESYNC").unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_success() {
        let own = log_with_stream("a");
        let bare = LogServer::in_memory("b");
        let publisher = Publisher::new("a", "basesync");
        publisher.add_connection("", own.connect()).await;
        publisher.add_connection("b", bare.connect()).await;

        let summary = publisher.publish(&event()).await.unwrap();
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed_ids(), vec!["b"]);
        assert_eq!(publisher.stats().target_failures, 1);
        assert_eq!(publisher.stats().published, 1);
    }

    #[tokio::test]
    async fn test_sole_connection_failure_fails() {
        let bare = LogServer::in_memory("a");
        let publisher = Publisher::new("a", "basesync");
        publisher.add_connection("", bare.connect()).await;
        let err = publisher.publish(&event()).await.unwrap_err();
        assert!(matches!(err, SyncError::PublishFailed { attempted: 1, .. }));
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent_and_closes() {
        let own = log_with_stream("a");
        let peer = log_with_stream("b");
        let publisher = Publisher::new("a", "basesync");
        publisher.add_connection("", own.connect()).await;
        let client = peer.connect();
        publisher.add_connection("b", client.clone()).await;

        assert!(publisher.remove_peer_connection("b").await);
        assert!(client.is_closed());
        assert!(!publisher.remove_peer_connection("b").await);
        assert!(!publisher.remove_peer_connection("a").await);
        assert_eq!(publisher.connection_ids().await, vec!["".to_string()]);
    }

    #[tokio::test]
    async fn test_realtime_subject() {
        let own = log_with_stream("a");
        let publisher = Publisher::new("a", "basesync");
        publisher.add_connection("", own.connect()).await;
        let rt = Event::realtime(
            crate::event::EventType::RealtimeSubscribe,
            "a",
            "posts",
            Map::new(),
        )
        .unwrap();
        let summary = publisher.publish(&rt).await.unwrap();
        assert_eq!(summary.subject, "basesync.sync._realtime");
    }

    #[tokio::test]
    async fn test_publish_async_logs_only() {
        let publisher = Publisher::new("a", "basesync");
        publisher.publish_async(event()).await.unwrap();
        assert_eq!(publisher.stats().failed, 1);
    }
}
