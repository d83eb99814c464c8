//! Stream and durable-consumer provisioning on instance logs.

use crate::config::SyncConfig;
use crate::error::SyncError;
use basesync_log::subject::sanitize_token;
use basesync_log::{
    ConsumerConfig, ConsumerInfo, DeliverPolicy, LogClient, LogError, RetentionPolicy,
    StreamConfig, StreamInfo,
};
use tracing::{debug, info, warn};

/// How sync streams and consumers are provisioned on every log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Stream name.
    pub stream: String,
    /// Subject namespace.
    pub namespace: String,
    /// Maximum message age (ms, 0 = unlimited).
    pub max_age_ms: u64,
    /// Maximum retained messages (0 = unlimited).
    pub max_msgs: u64,
    /// Consumer ack wait (ms).
    pub ack_wait_ms: u64,
    /// Consumer max deliveries per message.
    pub max_deliver: u32,
}

impl TransportSettings {
    /// Settings derived from the node configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            stream: config.stream_name.clone(),
            namespace: config.namespace.clone(),
            max_age_ms: config.transport.max_age_secs.saturating_mul(1000),
            max_msgs: config.transport.max_msgs,
            ack_wait_ms: config.transport.ack_wait_ms,
            max_deliver: config.transport.max_deliver,
        }
    }

    /// Subject filter captured by the sync stream.
    pub fn subject_filter(&self) -> String {
        format!("{}.sync.>", self.namespace)
    }

    /// The desired stream configuration.
    pub fn stream_config(&self) -> StreamConfig {
        let mut config = StreamConfig::new(self.stream.clone(), vec![self.subject_filter()]);
        config.max_age_ms = self.max_age_ms;
        config.max_msgs = self.max_msgs;
        config
    }

    /// The desired consumer configuration.
    pub fn consumer_config(&self, durable_name: &str, policy: DeliverPolicy) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: durable_name.to_string(),
            deliver_policy: policy,
            ack_wait_ms: self.ack_wait_ms,
            max_deliver: self.max_deliver,
            filter_subject: None,
        }
    }
}

/// Durable consumer name used by `instance_id` on every peer log.
pub fn consumer_name(instance_id: &str) -> String {
    format!("sync_{}", sanitize_token(instance_id))
}

/// Deliver policy for a consumer attached after a snapshot at `start_seq`.
pub fn deliver_policy(start_seq: u64) -> DeliverPolicy {
    if start_seq > 0 {
        DeliverPolicy::ByStartSequence(start_seq + 1)
    } else {
        DeliverPolicy::All
    }
}

/// Create the sync stream on `client`'s log if absent, or bring its subjects
/// and limits in line with `settings`.
///
/// An existing stream with a non-limits retention policy cannot be repaired
/// in place and is reported as [`SyncError::IncompatibleStream`].
pub fn ensure_stream(client: &LogClient, settings: &TransportSettings) -> Result<StreamInfo, SyncError> {
    let desired = settings.stream_config();
    match client.stream_info(&settings.stream) {
        Ok(info) => {
            if info.config.retention != desired.retention {
                return Err(SyncError::IncompatibleStream {
                    stream: settings.stream.clone(),
                    found: info.config.retention,
                    expected: RetentionPolicy::Limits,
                });
            }
            if info.config == desired {
                return Ok(info);
            }
            info!(
                stream = %settings.stream,
                server = client.server_name(),
                "updating sync stream configuration"
            );
            Ok(client.update_stream(desired)?)
        }
        Err(LogError::StreamNotFound { .. }) => match client.add_stream(desired) {
            Ok(info) => {
                info!(
                    stream = %settings.stream,
                    server = client.server_name(),
                    "created sync stream"
                );
                Ok(info)
            }
            Err(LogError::StreamExists { .. }) => ensure_stream(client, settings),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

/// Ensure the stream on a peer log and create or repair `local_id`'s durable
/// consumer on it.
///
/// With `start_seq > 0` the consumer delivers strictly after that sequence;
/// with `0` a new consumer delivers everything and an existing one keeps its
/// start point. A consumer whose configuration diverges, or that reports a
/// backlog without ever having delivered, is deleted and recreated.
pub fn attach_consumer(
    client: &LogClient,
    settings: &TransportSettings,
    local_id: &str,
    start_seq: u64,
) -> Result<ConsumerInfo, SyncError> {
    ensure_stream(client, settings)?;
    let name = consumer_name(local_id);

    let existing = match client.consumer_info(&settings.stream, &name) {
        Ok(info) => Some(info),
        Err(LogError::ConsumerNotFound { .. }) => None,
        Err(e) => return Err(e.into()),
    };

    let Some(info) = existing else {
        let config = settings.consumer_config(&name, deliver_policy(start_seq));
        debug!(
            consumer = %name,
            server = client.server_name(),
            policy = ?config.deliver_policy,
            "creating consumer"
        );
        return Ok(client.add_consumer(&settings.stream, config)?);
    };

    let policy = if start_seq > 0 {
        deliver_policy(start_seq)
    } else {
        info.config.deliver_policy
    };
    let desired = settings.consumer_config(&name, policy);
    let stuck = info.num_pending > 0 && info.delivered == 0 && info.num_ack_pending == 0;
    if info.config == desired && !stuck {
        return Ok(info);
    }

    warn!(
        consumer = %name,
        server = client.server_name(),
        stuck,
        "repairing durable consumer"
    );
    match client.delete_consumer(&settings.stream, &name) {
        Ok(()) | Err(LogError::ConsumerNotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(client.add_consumer(&settings.stream, desired)?)
}
