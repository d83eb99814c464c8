//! Shared fixtures for multi-instance integration tests.

#![allow(dead_code)]

use basesync_repl::{
    Collection, Event, Field, FieldKind, LocalStore, MemoryStore, Record, SyncConfig, SyncNode,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// Fast timings so lease expiry and backoff fit in a test.
pub fn test_config(instance_id: &str) -> SyncConfig {
    let mut config = SyncConfig::for_instance(instance_id);
    config.subscriber.fetch_wait_ms = 50;
    config.subscriber.base_backoff_ms = 10;
    config.subscriber.max_backoff_ms = 40;
    config.subscriber.probe_wait_ms = 10;
    config.subscriber.catch_up_poll_ms = 10;
    config.lease.lease_duration_ms = 300;
    config.lease.heartbeat_interval_ms = 100;
    config.lease.sweep_interval_ms = 50;
    config
}

/// In-process cluster of started nodes, each with its own memory store.
pub struct TestCluster {
    pub nodes: Vec<SyncNode>,
}

impl TestCluster {
    /// Start nodes `a`, `b`, `c`... and connect them full-mesh.
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, |_| {}).await
    }

    /// Like [`TestCluster::new`], adjusting each config first.
    pub async fn with_config(size: usize, adjust: impl Fn(&mut SyncConfig)) -> Self {
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let id = ((b'a' + i as u8) as char).to_string();
            let mut config = test_config(&id);
            adjust(&mut config);
            let node = SyncNode::new(config, Arc::new(MemoryStore::new())).unwrap();
            node.start().await.unwrap();
            nodes.push(node);
        }
        let cluster = Self { nodes };
        for i in 0..size {
            for j in 0..size {
                if i != j {
                    cluster.connect(i, j).await;
                }
            }
        }
        cluster
    }

    /// Make node `from` consume and publish to node `to`'s log.
    pub async fn connect(&self, from: usize, to: usize) {
        let target = &self.nodes[to];
        self.nodes[from]
            .add_peer_connection(target.connect(), target.instance_id(), 0)
            .await
            .unwrap();
    }

    pub fn node(&self, i: usize) -> &SyncNode {
        &self.nodes[i]
    }

    /// Create `posts(title, body)` on node 0 and wait for it everywhere.
    pub async fn with_posts(self) -> Self {
        self.nodes[0].save_collection(posts()).await.unwrap();
        for node in &self.nodes {
            let store = node.store().clone();
            assert!(
                eventually(|| store.find_collection("posts").is_ok()).await,
                "posts missing on {}",
                node.instance_id()
            );
        }
        self
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

pub fn posts() -> Collection {
    Collection::new("posts")
        .with_field(Field::new("title", FieldKind::Text).required())
        .with_field(Field::new("body", FieldKind::Text))
}

pub fn post(id: &str, title: &str) -> Record {
    let mut record = Record::new("posts", id);
    record.set("title", Value::from(title));
    record
}

pub fn fields(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

/// Record data without the per-instance timestamps.
pub fn user_data(record: &Record) -> Map<String, Value> {
    let mut data = record.data.clone();
    data.remove("created");
    data.remove("updated");
    data
}

pub fn title_of(node: &SyncNode, id: &str) -> Option<String> {
    node.store()
        .find_record("posts", id)
        .ok()
        .and_then(|r| r.get("title").and_then(|v| v.as_str()).map(str::to_string))
}

/// Append an event to a node's log as if a peer had published it.
pub fn inject(node: &SyncNode, event: &Event) -> u64 {
    node.connect()
        .publish(&event.subject(&node.config().namespace), event.encode().unwrap())
        .unwrap()
        .seq
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `node` reports `expected` as the owner of `resource_id`.
pub async fn owner_becomes(node: &SyncNode, resource_id: &str, expected: Option<&str>) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if node.owner_of(resource_id).await.as_deref() == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
