//! Client connections to a log server.
//!
//! A [`LogClient`] is the handle an instance holds for its own log and for
//! every peer log it is attached to. Closing a client invalidates it and every
//! message fetched through it; the server itself keeps running.

use crate::consumer::{ConsumerConfig, ConsumerInfo};
use crate::error::LogError;
use crate::message::Message;
use crate::server::{current_time_ms, ServerInner};
use crate::stream::{PublishAck, StreamConfig, StreamInfo};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A connection to a [`crate::LogServer`]. Clones share the connection.
#[derive(Clone)]
pub struct LogClient {
    server: Arc<ServerInner>,
    closed: Arc<AtomicBool>,
    id: u64,
}

impl std::fmt::Debug for LogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogClient")
            .field("server", &self.server.name())
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LogClient {
    pub(crate) fn new(server: Arc<ServerInner>) -> Self {
        Self {
            server,
            closed: Arc::new(AtomicBool::new(false)),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Name of the server this client is connected to.
    pub fn server_name(&self) -> &str {
        self.server.name()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.notify.notify_waiters();
        }
    }

    /// Returns true once [`LogClient::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), LogError> {
        if self.is_closed() {
            Err(LogError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Create a stream.
    pub fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo, LogError> {
        self.check_open()?;
        self.server.add_stream(config)
    }

    /// Update an existing stream's subjects and limits.
    pub fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, LogError> {
        self.check_open()?;
        self.server.update_stream(config)
    }

    /// Describe a stream.
    pub fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
        self.check_open()?;
        self.server.stream_info(stream)
    }

    /// Delete a stream with all its messages and consumers.
    pub fn delete_stream(&self, stream: &str) -> Result<(), LogError> {
        self.check_open()?;
        self.server.delete_stream(stream)
    }

    /// Append a message to whichever stream captures `subject`.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<PublishAck, LogError> {
        self.check_open()?;
        self.server.publish(subject, payload.into())
    }

    /// Create a durable consumer, or return the existing one if its config is identical.
    pub fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<ConsumerInfo, LogError> {
        self.check_open()?;
        self.server.add_consumer(stream, config)
    }

    /// Describe a durable consumer.
    pub fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo, LogError> {
        self.check_open()?;
        self.server.consumer_info(stream, consumer)
    }

    /// Delete a durable consumer.
    pub fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), LogError> {
        self.check_open()?;
        self.server.delete_consumer(stream, consumer)
    }

    /// Pull up to `batch` messages, waiting at most `wait` for the first one.
    ///
    /// Returns [`LogError::Timeout`] if nothing became available in time.
    pub async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, LogError> {
        let deadline = Instant::now() + wait;
        loop {
            self.check_open()?;
            let notified = self.server.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pull = self.server.pull(stream, consumer, batch.max(1))?;
            if !pull.deliveries.is_empty() {
                return Ok(pull
                    .deliveries
                    .into_iter()
                    .map(|d| Message::new(d, stream, consumer, self.clone()))
                    .collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LogError::Timeout);
            }
            let mut wake_at = deadline;
            if let Some(due_ms) = pull.next_due_ms {
                let until_due = Duration::from_millis(due_ms.saturating_sub(current_time_ms()));
                wake_at = wake_at.min(now + until_due);
            }
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    pub(crate) fn ack(&self, stream: &str, consumer: &str, seq: u64) -> Result<(), LogError> {
        self.check_open()?;
        self.server.ack(stream, consumer, seq)
    }

    pub(crate) fn nak(&self, stream: &str, consumer: &str, seq: u64) -> Result<(), LogError> {
        self.check_open()?;
        self.server.nak(stream, consumer, seq)
    }

    pub(crate) fn term(&self, stream: &str, consumer: &str, seq: u64) -> Result<(), LogError> {
        self.check_open()?;
        debug!(stream, consumer, seq, "message terminated");
        self.server.ack(stream, consumer, seq)
    }
}
