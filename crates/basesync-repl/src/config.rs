//! Configuration for a sync node.
//!
//! Every section has defaults matching production timings; a config file only
//! needs to name what differs. Files may be TOML or JSON, chosen by extension.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identifier of this instance. Must be unique among peers.
    pub instance_id: String,
    /// Subject namespace; sync subjects are `<namespace>.sync.<collection>`.
    pub namespace: String,
    /// Name of the sync stream on every instance's log.
    pub stream_name: String,
    /// Directory for the file-backed log. `None` keeps the log in memory.
    pub data_dir: Option<PathBuf>,
    /// Stream retention and consumer delivery settings.
    pub transport: TransportConfig,
    /// Fetch loop settings.
    pub subscriber: SubscriberConfig,
    /// Realtime lease timings.
    pub lease: LeaseConfig,
    /// Apply rules.
    pub processor: ProcessorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            namespace: "basesync".to_string(),
            stream_name: "BASESYNC".to_string(),
            data_dir: None,
            transport: TransportConfig::default(),
            subscriber: SubscriberConfig::default(),
            lease: LeaseConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}

/// Stream retention and consumer delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Messages older than this are discarded. Snapshots must run more often.
    pub max_age_secs: u64,
    /// Maximum retained messages per stream (0 = unlimited).
    pub max_msgs: u64,
    /// Time a delivered message may stay unacknowledged (ms).
    pub ack_wait_ms: u64,
    /// Deliveries per message before the log drops it.
    pub max_deliver: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 24 * 60 * 60,
            max_msgs: 0,
            ack_wait_ms: 30_000,
            max_deliver: 5,
        }
    }
}

/// Fetch loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Messages pulled per connection per cycle.
    pub fetch_batch: usize,
    /// Maximum wait for a fetch (ms).
    pub fetch_wait_ms: u64,
    /// Capacity of the inbound event channel.
    pub channel_capacity: usize,
    /// Consecutive fatal fetch errors before a peer is evicted.
    pub max_consecutive_errors: u32,
    /// First backoff after a fatal error (ms); doubles per consecutive error.
    pub base_backoff_ms: u64,
    /// Backoff ceiling (ms).
    pub max_backoff_ms: u64,
    /// Minimum interval between non-fatal error logs per peer (ms).
    pub error_log_interval_ms: u64,
    /// Wait for the activation probe fetch on attach (ms).
    pub probe_wait_ms: u64,
    /// Poll interval of `wait_for_catch_up` (ms).
    pub catch_up_poll_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            fetch_batch: 10,
            fetch_wait_ms: 1_000,
            channel_capacity: 100,
            max_consecutive_errors: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 2_000,
            error_log_interval_ms: 30_000,
            probe_wait_ms: 250,
            catch_up_poll_ms: 100,
        }
    }
}

impl SubscriberConfig {
    /// Backoff before retrying after `consecutive` fatal errors.
    pub fn backoff(&self, consecutive: u32) -> Duration {
        let shift = consecutive.saturating_sub(1).min(16);
        let ms = self.base_backoff_ms.saturating_mul(1 << shift);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Realtime lease timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease lifetime without heartbeat (ms).
    pub lease_duration_ms: u64,
    /// Heartbeat period for owned leases (ms).
    pub heartbeat_interval_ms: u64,
    /// Expiry sweep period (ms).
    pub sweep_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl LeaseConfig {
    /// Lease lifetime.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Rules applied by the event processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Locally managed registry collection: records resolve by its unique key,
    /// and its schema is never replicated.
    pub registry_collection: String,
    /// Unique field of the registry collection.
    pub registry_unique_field: String,
    /// Fields that only make sense on the instance that wrote them.
    pub local_only_fields: Vec<String>,
    /// Derived system timestamp fields, never transported.
    pub system_fields: Vec<String>,
    /// Upper bound of per-record LWW marks kept in memory.
    pub conflict_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            registry_collection: "_superusers".to_string(),
            registry_unique_field: "email".to_string(),
            local_only_fields: vec!["tokenKey".to_string()],
            system_fields: vec!["created".to_string(), "updated".to_string()],
            conflict_capacity: 100_000,
        }
    }
}

impl SyncConfig {
    /// Default configuration for the given instance.
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Load a configuration file (`.toml` or `.json`).
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SyncError::config(e.to_string())),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(SyncError::config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, SyncError> {
        toml::to_string_pretty(self).map_err(|e| SyncError::config(e.to_string()))
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.instance_id.is_empty() {
            return Err(SyncError::config("instance_id must not be empty"));
        }
        if self.namespace.is_empty() || self.namespace.contains(['.', '*', '>', ' ']) {
            return Err(SyncError::config(format!(
                "namespace {:?} must be a single subject token",
                self.namespace
            )));
        }
        if self.stream_name.is_empty() || self.stream_name.contains(['.', '*', '>', ' ', '/']) {
            return Err(SyncError::config(format!(
                "stream_name {:?} is not a valid stream name",
                self.stream_name
            )));
        }
        if self.subscriber.fetch_batch == 0 || self.subscriber.channel_capacity == 0 {
            return Err(SyncError::config(
                "fetch_batch and channel_capacity must be positive",
            ));
        }
        if self.subscriber.max_consecutive_errors == 0 {
            return Err(SyncError::config("max_consecutive_errors must be positive"));
        }
        if self.lease.heartbeat_interval_ms == 0 || self.lease.sweep_interval_ms == 0 {
            return Err(SyncError::config("lease intervals must be positive"));
        }
        if self.lease.heartbeat_interval_ms >= self.lease.lease_duration_ms {
            return Err(SyncError::config(
                "heartbeat_interval_ms must be shorter than lease_duration_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.namespace, "basesync");
        assert_eq!(config.stream_name, "BASESYNC");
        assert!(config.data_dir.is_none());
        assert_eq!(config.subscriber.fetch_batch, 10);
        assert_eq!(config.subscriber.fetch_wait_ms, 1_000);
        assert_eq!(config.subscriber.channel_capacity, 100);
        assert_eq!(config.subscriber.max_consecutive_errors, 3);
        assert_eq!(config.lease.lease_duration_ms, 30_000);
        assert_eq!(config.lease.heartbeat_interval_ms, 10_000);
        assert_eq!(config.lease.sweep_interval_ms, 5_000);
        assert_eq!(config.processor.registry_collection, "_superusers");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SubscriberConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(250));
        assert_eq!(config.backoff(2), Duration::from_millis(500));
        assert_eq!(config.backoff(3), Duration::from_millis(1_000));
        assert_eq!(config.backoff(4), Duration::from_millis(2_000));
        assert_eq!(config.backoff(40), Duration::from_millis(2_000));
    }

    #[test]
    fn test_validate() {
        assert!(SyncConfig::default().validate().is_err());
        assert!(SyncConfig::for_instance("a").validate().is_ok());

        let mut bad = SyncConfig::for_instance("a");
        bad.namespace = "my.app".to_string();
        assert!(bad.validate().is_err());

        let mut bad = SyncConfig::for_instance("a");
        bad.lease.heartbeat_interval_ms = bad.lease.lease_duration_ms;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
instance_id = "node-a"
namespace = "app"

[subscriber]
fetch_batch = 25

[lease]
lease_duration_ms = 6000
heartbeat_interval_ms = 2000
"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.instance_id, "node-a");
        assert_eq!(config.namespace, "app");
        assert_eq!(config.subscriber.fetch_batch, 25);
        assert_eq!(config.subscriber.fetch_wait_ms, 1_000);
        assert_eq!(config.lease.lease_duration_ms, 6_000);
        assert_eq!(config.lease.sweep_interval_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"instance_id": "node-b", "transport": {{"max_deliver": 9}}}}"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.instance_id, "node-b");
        assert_eq!(config.transport.max_deliver, 9);
        assert_eq!(config.transport.ack_wait_ms, 30_000);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = SyncConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SyncConfig::for_instance("a");
        config.data_dir = Some(PathBuf::from("/var/lib/basesync"));
        let rendered = config.to_toml().unwrap();
        let parsed: SyncConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
