//! Error types for the replication subsystem.

use crate::store::StoreError;
use basesync_log::{LogError, RetentionPolicy};
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Log transport error.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The sync stream exists with a retention policy replication cannot use.
    /// The operator must delete the stream so it can be recreated.
    #[error("stream {stream} has incompatible retention {found:?}, expected {expected:?}; delete it so it can be recreated")]
    IncompatibleStream {
        /// Stream name.
        stream: String,
        /// Retention found on the existing stream.
        found: RetentionPolicy,
        /// Retention replication requires.
        expected: RetentionPolicy,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// Event payload is structurally invalid.
    #[error("malformed event: {msg}")]
    MalformedEvent {
        /// What is wrong with the event.
        msg: String,
    },

    /// A live subscription is owned by another instance.
    #[error("resource {resource_id} is owned by instance {owner}")]
    OwnedElsewhere {
        /// The subscribed resource.
        resource_id: String,
        /// Instance holding the unexpired lease.
        owner: String,
    },

    /// Publish was attempted with no registered connection.
    #[error("no connections registered")]
    NoConnections,

    /// Every publish target failed.
    #[error("publish failed on {attempted} connection(s): {last_error}")]
    PublishFailed {
        /// Number of targets attempted.
        attempted: usize,
        /// Error from the last failing target.
        last_error: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// Sync node was shut down.
    #[error("sync node shut down")]
    Shutdown,
}

impl SyncError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        SyncError::MalformedEvent { msg: msg.into() }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SyncError::Config { msg: msg.into() }
    }
}
