//! Streams: append-only, subject-addressed message sequences with bounded retention.

use crate::consumer::ConsumerState;
use crate::error::LogError;
use crate::subject::{subject_matches, validate_filter};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// When messages are removed from a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Kept until age or size limits are reached, independent of consumers.
    Limits,
    /// Removed once every consumer has acknowledged them.
    Interest,
    /// Removed as soon as any consumer acknowledges them.
    WorkQueue,
}

/// Stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject filters captured by this stream.
    pub subjects: Vec<String>,
    /// Retention policy.
    pub retention: RetentionPolicy,
    /// Maximum message age in milliseconds (0 = unlimited).
    pub max_age_ms: u64,
    /// Maximum number of retained messages (0 = unlimited).
    pub max_msgs: u64,
}

impl StreamConfig {
    /// Create a limits-retention stream with no age or size bound.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            max_age_ms: 0,
            max_msgs: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), LogError> {
        if self.name.is_empty() || self.name.contains(['.', '*', '>', ' ', '/']) {
            return Err(LogError::InvalidSubject {
                subject: self.name.clone(),
            });
        }
        for filter in &self.subjects {
            validate_filter(filter)?;
        }
        Ok(())
    }

    /// Returns true if the stream captures the subject.
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|f| subject_matches(f, subject))
    }
}

/// A message as stored in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Stream sequence number (starting at 1).
    pub seq: u64,
    /// Subject the message was published on.
    pub subject: String,
    /// Message body.
    pub payload: Bytes,
    /// Publish time (milliseconds since Unix epoch).
    pub published_at_ms: u64,
}

/// Point-in-time description of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Current configuration.
    pub config: StreamConfig,
    /// Number of retained messages.
    pub messages: u64,
    /// Lowest retained sequence (0 when empty).
    pub first_seq: u64,
    /// Highest sequence ever assigned.
    pub last_seq: u64,
    /// Number of durable consumers.
    pub consumer_count: usize,
}

/// Acknowledgement for a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream the message landed in.
    pub stream: String,
    /// Assigned sequence.
    pub seq: u64,
}

#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) config: StreamConfig,
    pub(crate) messages: BTreeMap<u64, StoredMessage>,
    pub(crate) last_seq: u64,
    pub(crate) consumers: HashMap<String, ConsumerState>,
    /// Records in file storage that no longer back a retained message.
    pub(crate) stale_records: usize,
}

impl StreamState {
    pub(crate) fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_seq: 0,
            consumers: HashMap::new(),
            stale_records: 0,
        }
    }

    pub(crate) fn first_seq(&self) -> u64 {
        self.messages.keys().next().copied().unwrap_or(0)
    }

    pub(crate) fn append(&mut self, subject: &str, payload: Bytes, now_ms: u64) -> StoredMessage {
        self.last_seq += 1;
        let msg = StoredMessage {
            seq: self.last_seq,
            subject: subject.to_string(),
            payload,
            published_at_ms: now_ms,
        };
        self.messages.insert(msg.seq, msg.clone());
        msg
    }

    /// Drop messages past the age or count limits. Returns how many were removed.
    pub(crate) fn trim(&mut self, now_ms: u64) -> usize {
        let mut removed = 0;
        if self.config.max_age_ms > 0 {
            let cutoff = now_ms.saturating_sub(self.config.max_age_ms);
            while let Some((&seq, msg)) = self.messages.iter().next() {
                if msg.published_at_ms >= cutoff {
                    break;
                }
                self.messages.remove(&seq);
                removed += 1;
            }
        }
        if self.config.max_msgs > 0 {
            while self.messages.len() as u64 > self.config.max_msgs {
                if self.messages.pop_first().is_none() {
                    break;
                }
                removed += 1;
            }
        }
        removed
    }

    /// Apply consumer-driven retention after `seq` was acknowledged.
    pub(crate) fn retire_acked(&mut self, seq: u64) {
        match self.config.retention {
            RetentionPolicy::Limits => {}
            RetentionPolicy::WorkQueue => {
                self.messages.remove(&seq);
            }
            RetentionPolicy::Interest => {
                let floor = self
                    .consumers
                    .values()
                    .map(|c| c.ack_floor())
                    .min()
                    .unwrap_or(0);
                let retired: Vec<u64> = self.messages.range(..=floor).map(|(s, _)| *s).collect();
                for s in retired {
                    self.messages.remove(&s);
                }
            }
        }
    }

    pub(crate) fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len() as u64,
            first_seq: self.first_seq(),
            last_seq: self.last_seq,
            consumer_count: self.consumers.len(),
        }
    }
}
