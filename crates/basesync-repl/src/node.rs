//! Sync node: one instance's replication components wired together.
//!
//! A [`SyncNode`] owns the instance's log server, registers it as the self
//! connection, runs the fetch, dispatch and lease loops, and exposes the peer
//! membership API plus helpers that apply a local mutation and publish it.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event::Event;
use crate::processor::{EventProcessor, ProcessorStats};
use crate::publisher::{PublishSummary, Publisher, PublisherStats};
use crate::realtime::{LeaseManager, SubscriptionLease};
use crate::store::{Collection, LocalStore, Record};
use crate::subscriber::{Subscriber, SubscriberStats};
use crate::transport::{ensure_stream, TransportSettings};
use basesync_log::{LogClient, LogServer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters of every component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Publisher counters.
    pub publisher: PublisherStats,
    /// Subscriber counters.
    pub subscriber: SubscriberStats,
    /// Processor counters.
    pub processor: ProcessorStats,
}

/// One replicating instance.
pub struct SyncNode {
    config: SyncConfig,
    log: LogServer,
    store: Arc<dyn LocalStore>,
    publisher: Publisher,
    subscriber: Subscriber,
    processor: Arc<EventProcessor>,
    leases: Arc<LeaseManager>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("instance_id", &self.config.instance_id)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncNode {
    /// Build a node. Opens a file-backed log under `config.data_dir` when set,
    /// an in-memory log otherwise. Nothing runs until [`SyncNode::start`].
    pub fn new(config: SyncConfig, store: Arc<dyn LocalStore>) -> Result<Self, SyncError> {
        config.validate()?;
        let log = match &config.data_dir {
            Some(dir) => LogServer::open(config.instance_id.clone(), dir)?,
            None => LogServer::in_memory(config.instance_id.clone()),
        };
        Ok(Self::with_log(config, store, log))
    }

    /// Build a node around an existing log server.
    pub fn with_log(config: SyncConfig, store: Arc<dyn LocalStore>, log: LogServer) -> Self {
        let id = config.instance_id.clone();
        let settings = TransportSettings::from_config(&config);
        let publisher = Publisher::new(id.clone(), config.namespace.clone());
        let subscriber = Subscriber::new(id.clone(), settings, config.subscriber.clone());
        let processor = Arc::new(EventProcessor::new(
            id.clone(),
            store.clone(),
            config.processor.clone(),
        ));
        let leases = Arc::new(LeaseManager::new(
            id,
            config.lease.clone(),
            publisher.clone(),
        ));
        Self {
            config,
            log,
            store,
            publisher,
            subscriber,
            processor,
            leases,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This instance's ID.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Effective configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// A new connection to this instance's log, for peers to attach.
    pub fn connect(&self) -> LogClient {
        self.log.connect()
    }

    /// The local store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// The publisher.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// The subscriber.
    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    /// The event processor.
    pub fn processor(&self) -> &EventProcessor {
        &self.processor
    }

    /// The lease manager.
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    fn check_running(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Provision the stream, attach the self connection and spawn every loop.
    /// Idempotent.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.check_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let settings = TransportSettings::from_config(&self.config);
        let own = self.log.connect();
        if let Err(e) = ensure_stream(&own, &settings) {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.publisher.add_connection("", own.clone()).await;
        self.subscriber
            .add_peer_connection(own, &self.config.instance_id, 0)
            .await?;

        let Some(rx) = self.subscriber.take_receiver() else {
            return Err(SyncError::config("inbound receiver already taken"));
        };

        let mut handles = vec![self.subscriber.spawn(self.cancel.clone())];
        handles.push(tokio::spawn(dispatch(
            self.config.instance_id.clone(),
            rx,
            self.processor.clone(),
            self.leases.clone(),
            self.cancel.clone(),
        )));
        handles.extend(self.leases.spawn(self.cancel.clone()));
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);

        info!(
            instance_id = %self.config.instance_id,
            stream = %self.config.stream_name,
            namespace = %self.config.namespace,
            "sync node started"
        );
        Ok(())
    }

    /// Attach a peer log: consume it and publish to it.
    ///
    /// `start_sequence > 0` skips what a snapshot already covers.
    pub async fn add_peer_connection(
        &self,
        client: LogClient,
        instance_id: &str,
        start_sequence: u64,
    ) -> Result<(), SyncError> {
        self.check_running()?;
        self.subscriber
            .add_peer_connection(client.clone(), instance_id, start_sequence)
            .await?;
        self.publisher.add_connection(instance_id, client).await;
        Ok(())
    }

    /// Detach a peer log. Idempotent. Returns true if anything was removed.
    pub async fn remove_peer_connection(&self, instance_id: &str) -> bool {
        let consumed = self.subscriber.remove_peer_connection(instance_id).await;
        let published = self.publisher.remove_peer_connection(instance_id).await;
        consumed || published
    }

    async fn publish_local(&self, event: Event) -> Result<PublishSummary, SyncError> {
        self.processor.record_local(&event);
        self.publisher.publish(&event).await
    }

    /// Save a record locally and replicate it.
    pub async fn save_record(&self, record: Record) -> Result<Record, SyncError> {
        self.check_running()?;
        let existed = match self.store.find_record(&record.collection, &record.id) {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        let saved = self.store.save_record(record)?;
        let id = &self.config.instance_id;
        let event = if existed {
            Event::record_updated(id, &saved.collection, &saved.id, saved.data.clone())
        } else {
            Event::record_created(id, &saved.collection, &saved.id, saved.data.clone())
        };
        self.publish_local(event).await?;
        Ok(saved)
    }

    /// Delete a record locally and replicate the deletion.
    pub async fn delete_record(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        self.check_running()?;
        let name = self.store.find_collection(collection)?.name;
        self.store.delete_record(&name, id)?;
        let event = Event::record_deleted(&self.config.instance_id, &name, id);
        self.publish_local(event).await?;
        Ok(())
    }

    /// Save a collection locally and replicate its schema. The registry
    /// collection is saved but never replicated.
    pub async fn save_collection(&self, collection: Collection) -> Result<(), SyncError> {
        self.check_running()?;
        let existed = match self.store.find_collection(&collection.name) {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        let schema = match serde_json::to_value(&collection)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let name = collection.name.clone();
        self.store.save_collection(collection)?;
        if name == self.config.processor.registry_collection {
            debug!(collection = %name, "registry schema change not replicated");
            return Ok(());
        }
        let id = &self.config.instance_id;
        let event = if existed {
            Event::collection_updated(id, &name, schema)
        } else {
            Event::collection_created(id, &name, schema)
        };
        self.publish_local(event).await?;
        Ok(())
    }

    /// Delete a collection locally and replicate the deletion.
    pub async fn delete_collection(&self, name: &str) -> Result<(), SyncError> {
        self.check_running()?;
        let name = self.store.find_collection(name)?.name;
        self.store.delete_collection(&name)?;
        self.processor.conflicts().forget_collection(&name);
        if name == self.config.processor.registry_collection {
            return Ok(());
        }
        let event = Event::collection_deleted(&self.config.instance_id, &name);
        self.publish_local(event).await?;
        Ok(())
    }

    /// Re-broadcast a change, keeping its origin and timestamp.
    pub async fn republish(&self, event: &Event) -> Result<PublishSummary, SyncError> {
        self.check_running()?;
        self.publisher.publish(&event.republished()).await
    }

    /// A local client subscribed to a realtime resource.
    pub async fn subscribe_realtime(&self, resource_id: &str) -> Result<SubscriptionLease, SyncError> {
        self.check_running()?;
        self.leases.handle_subscribe(resource_id).await
    }

    /// A local client unsubscribed from a realtime resource.
    pub async fn unsubscribe_realtime(&self, resource_id: &str) -> Option<u32> {
        self.leases.handle_unsubscribe(resource_id).await
    }

    /// Current owner of a realtime resource.
    pub async fn owner_of(&self, resource_id: &str) -> Option<String> {
        self.leases.owner_of(resource_id).await
    }

    /// Wait until every peer consumer has drained.
    pub async fn wait_for_catch_up(&self, timeout: Duration) -> bool {
        self.subscriber.wait_for_catch_up(timeout).await
    }

    /// Highest acknowledged sequence per attached log.
    pub async fn last_acked_sequences(&self) -> BTreeMap<String, u64> {
        self.subscriber.last_acked_sequences().await
    }

    /// Component counters.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            publisher: self.publisher.stats(),
            subscriber: self.subscriber.stats(),
            processor: self.processor.stats(),
        }
    }

    /// Release owned leases, then stop every loop.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let released = self.leases.release_all().await;
        if released > 0 {
            info!(instance_id = %self.config.instance_id, released, "leases released");
        }
        self.stop().await;
    }

    /// Stop every loop without releasing leases. Peers take them over once
    /// they expire.
    pub async fn halt(&self) {
        self.stop().await;
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(instance_id = %self.config.instance_id, error = %e, "task ended abnormally");
            }
        }
        info!(instance_id = %self.config.instance_id, "sync node stopped");
    }
}

/// Route inbound events: realtime traffic to the lease manager, everything
/// else to the processor.
async fn dispatch(
    local_id: String,
    mut rx: mpsc::Receiver<Event>,
    processor: Arc<EventProcessor>,
    leases: Arc<LeaseManager>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if event.event_type().is_realtime() {
            if let Err(e) = leases.process_realtime_event(&event).await {
                warn!(local = %local_id, resource_id = event.record_id(), error = %e, "realtime event rejected");
            }
            continue;
        }
        // Failures are logged and counted by the processor.
        if let Ok(outcome) = processor.apply(&event) {
            debug!(
                local = %local_id,
                origin = event.instance_id(),
                record = %event.record_key(),
                ?outcome,
                "event applied"
            );
        }
    }
    debug!(local = %local_id, "dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::store::{Field, FieldKind};
    use serde_json::json;

    fn node(id: &str) -> SyncNode {
        let mut config = SyncConfig::for_instance(id);
        config.subscriber.fetch_wait_ms = 50;
        SyncNode::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = SyncNode::new(SyncConfig::default(), Arc::new(MemoryStore::new())).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_final() {
        let n = node("a");
        n.start().await.unwrap();
        n.start().await.unwrap();
        assert_eq!(n.publisher().connection_ids().await, vec!["".to_string()]);
        n.shutdown().await;
        let err = n
            .save_collection(Collection::new("posts"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Shutdown));
    }

    #[tokio::test]
    async fn test_local_save_publishes_to_own_log() {
        let n = node("a");
        n.start().await.unwrap();
        n.save_collection(Collection::new("posts").with_field(Field::new("title", FieldKind::Text)))
            .await
            .unwrap();
        let mut r = Record::new("posts", "r1");
        r.set("title", json!("x"));
        n.save_record(r.clone()).await.unwrap();
        r.set("title", json!("y"));
        n.save_record(r).await.unwrap();
        n.delete_record("posts", "r1").await.unwrap();

        let info = n.connect().stream_info("BASESYNC").unwrap();
        assert_eq!(info.messages, 4);
        assert_eq!(n.stats().publisher.published, 4);
        n.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_schema_stays_local() {
        let n = node("a");
        n.start().await.unwrap();
        let registry = n.store().find_collection("_superusers").unwrap();
        n.save_collection(registry).await.unwrap();
        assert_eq!(n.connect().stream_info("BASESYNC").unwrap().messages, 0);
        n.shutdown().await;
    }

    #[tokio::test]
    async fn test_file_backed_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::for_instance("a");
        config.data_dir = Some(dir.path().to_path_buf());
        let n = SyncNode::new(config.clone(), Arc::new(MemoryStore::new())).unwrap();
        n.start().await.unwrap();
        n.save_collection(Collection::new("posts")).await.unwrap();
        n.shutdown().await;
        drop(n);

        let reopened = SyncNode::new(config, Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(reopened.connect().stream_info("BASESYNC").unwrap().messages, 1);
    }
}
