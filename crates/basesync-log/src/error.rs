//! Error types for the embedded log.

use thiserror::Error;

/// Errors returned by log servers and client connections.
#[derive(Debug, Error)]
pub enum LogError {
    /// The client connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream does not exist on this server.
    #[error("stream not found: {stream}")]
    StreamNotFound {
        /// Name of the missing stream.
        stream: String,
    },

    /// A stream with this name already exists.
    #[error("stream already exists: {stream}")]
    StreamExists {
        /// Name of the existing stream.
        stream: String,
    },

    /// A stream update tried to change an immutable setting.
    #[error("stream {stream} cannot be updated: {msg}")]
    StreamConfigMismatch {
        /// Name of the stream.
        stream: String,
        /// Which setting diverged.
        msg: String,
    },

    /// The durable consumer does not exist.
    #[error("consumer not found: {stream}/{consumer}")]
    ConsumerNotFound {
        /// Stream the consumer was looked up on.
        stream: String,
        /// Durable consumer name.
        consumer: String,
    },

    /// A durable consumer exists with a different configuration.
    #[error("consumer {stream}/{consumer} already exists with a different configuration")]
    ConsumerConfigMismatch {
        /// Stream name.
        stream: String,
        /// Durable consumer name.
        consumer: String,
    },

    /// No stream on the server captures the subject.
    #[error("no stream matches subject {subject}")]
    NoStreamForSubject {
        /// The published subject.
        subject: String,
    },

    /// Subject or filter is syntactically invalid.
    #[error("invalid subject: {subject}")]
    InvalidSubject {
        /// The offending subject.
        subject: String,
    },

    /// A pull fetch returned no messages within its wait window.
    #[error("fetch timed out")]
    Timeout,

    /// File storage I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// File storage encoding error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

impl LogError {
    /// Errors after which the connection or consumer is unusable until repaired.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::ConnectionClosed
                | LogError::StreamNotFound { .. }
                | LogError::ConsumerNotFound { .. }
        )
    }

    /// True for an empty fetch.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LogError::Timeout)
    }
}
