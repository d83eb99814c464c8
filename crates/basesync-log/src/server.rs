//! The embedded log server owned by one instance.

use crate::client::LogClient;
use crate::consumer::{ConsumerConfig, ConsumerInfo, ConsumerState, Delivery};
use crate::error::LogError;
use crate::persist::{FileStorage, COMPACT_THRESHOLD};
use crate::stream::{PublishAck, StreamConfig, StreamInfo, StreamState};
use crate::subject::{validate_filter, validate_subject};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Get current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Result of a single non-blocking pull.
pub(crate) struct Pull {
    pub(crate) deliveries: Vec<Delivery>,
    /// Earliest time an in-flight message becomes due again.
    pub(crate) next_due_ms: Option<u64>,
}

pub(crate) struct ServerInner {
    name: String,
    streams: Mutex<BTreeMap<String, StreamState>>,
    pub(crate) notify: Notify,
    storage: Option<FileStorage>,
}

/// An embedded durable log. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LogServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for LogServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogServer")
            .field("name", &self.inner.name)
            .field("persistent", &self.inner.storage.is_some())
            .finish()
    }
}

impl LogServer {
    /// Create a server that keeps everything in memory.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                streams: Mutex::new(BTreeMap::new()),
                notify: Notify::new(),
                storage: None,
            }),
        }
    }

    /// Open a file-backed server rooted at `dir`, reloading existing streams and consumers.
    pub fn open(name: impl Into<String>, dir: &Path) -> Result<Self, LogError> {
        let storage = FileStorage::open(dir)?;
        let mut streams = BTreeMap::new();
        for state in storage.load_all()? {
            info!(
                stream = %state.config.name,
                messages = state.messages.len(),
                consumers = state.consumers.len(),
                "restored stream"
            );
            streams.insert(state.config.name.clone(), state);
        }
        Ok(Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                streams: Mutex::new(streams),
                notify: Notify::new(),
                storage: Some(storage),
            }),
        })
    }

    /// Server name (used in logs).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a new client connection to this server.
    pub fn connect(&self) -> LogClient {
        LogClient::new(self.inner.clone())
    }
}

impl ServerInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist_state(&self, state: &StreamState) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_state(state) {
                warn!(stream = %state.config.name, error = %e, "failed to persist stream state");
            }
        }
    }

    pub(crate) fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo, LogError> {
        config.validate()?;
        let mut streams = self.lock();
        if streams.contains_key(&config.name) {
            return Err(LogError::StreamExists {
                stream: config.name,
            });
        }
        if let Some(storage) = &self.storage {
            storage.create_stream(&config)?;
        }
        let state = StreamState::new(config);
        let info = state.info();
        debug!(server = %self.name, stream = %info.config.name, "stream created");
        streams.insert(info.config.name.clone(), state);
        Ok(info)
    }

    /// Update subjects and limits. Retention cannot change on an existing stream.
    pub(crate) fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, LogError> {
        config.validate()?;
        let mut streams = self.lock();
        let state = streams
            .get_mut(&config.name)
            .ok_or_else(|| LogError::StreamNotFound {
                stream: config.name.clone(),
            })?;
        if state.config.retention != config.retention {
            return Err(LogError::StreamConfigMismatch {
                stream: config.name,
                msg: format!(
                    "retention {:?} cannot change to {:?}",
                    state.config.retention, config.retention
                ),
            });
        }
        if let Some(storage) = &self.storage {
            storage.create_stream(&config)?;
        }
        state.config = config;
        state.trim(current_time_ms());
        Ok(state.info())
    }

    pub(crate) fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
        let mut streams = self.lock();
        let state = get_stream(&mut streams, stream)?;
        state.trim(current_time_ms());
        Ok(state.info())
    }

    pub(crate) fn delete_stream(&self, stream: &str) -> Result<(), LogError> {
        let mut streams = self.lock();
        if streams.remove(stream).is_none() {
            return Err(LogError::StreamNotFound {
                stream: stream.to_string(),
            });
        }
        if let Some(storage) = &self.storage {
            storage.remove_stream(stream)?;
        }
        drop(streams);
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck, LogError> {
        validate_subject(subject)?;
        let now = current_time_ms();
        let ack = {
            let mut streams = self.lock();
            let state = streams
                .values_mut()
                .find(|s| s.config.captures(subject))
                .ok_or_else(|| LogError::NoStreamForSubject {
                    subject: subject.to_string(),
                })?;
            let msg = state.append(subject, payload, now);
            let trimmed = state.trim(now);
            if let Some(storage) = &self.storage {
                storage.append_message(&state.config.name, &msg)?;
                if trimmed > 0 {
                    state.stale_records += trimmed;
                    self.persist_state(state);
                }
                if state.stale_records >= COMPACT_THRESHOLD {
                    storage.compact(state)?;
                    state.stale_records = 0;
                }
            }
            PublishAck {
                stream: state.config.name.clone(),
                seq: msg.seq,
            }
        };
        self.notify.notify_waiters();
        Ok(ack)
    }

    pub(crate) fn add_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, LogError> {
        if let Some(filter) = &config.filter_subject {
            validate_filter(filter)?;
        }
        let mut streams = self.lock();
        let state = get_stream(&mut streams, stream)?;
        if let Some(existing) = state.consumers.get(&config.durable_name) {
            if existing.config != config {
                return Err(LogError::ConsumerConfigMismatch {
                    stream: stream.to_string(),
                    consumer: config.durable_name,
                });
            }
            return Ok(existing.info(stream, &state.messages));
        }
        let name = config.durable_name.clone();
        let consumer = ConsumerState::new(config);
        let info = consumer.info(stream, &state.messages);
        state.consumers.insert(name, consumer);
        self.persist_state(state);
        Ok(info)
    }

    pub(crate) fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo, LogError> {
        let mut streams = self.lock();
        let state = get_stream(&mut streams, stream)?;
        state.trim(current_time_ms());
        let c = get_consumer(&state.consumers, stream, consumer)?;
        Ok(c.info(stream, &state.messages))
    }

    pub(crate) fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), LogError> {
        let mut streams = self.lock();
        let state = get_stream(&mut streams, stream)?;
        if state.consumers.remove(consumer).is_none() {
            return Err(LogError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            });
        }
        self.persist_state(state);
        drop(streams);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Hand out up to `batch` messages without waiting.
    pub(crate) fn pull(&self, stream: &str, consumer: &str, batch: usize) -> Result<Pull, LogError> {
        let now = current_time_ms();
        let mut streams = self.lock();
        let state = get_stream(&mut streams, stream)?;
        state.trim(now);
        let StreamState {
            messages,
            consumers,
            config,
            ..
        } = state;
        let c = consumers
            .get_mut(consumer)
            .ok_or_else(|| LogError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })?;
        let (deliveries, dropped) = c.take(messages, batch, now);
        for seq in &dropped {
            warn!(
                stream = %config.name,
                consumer,
                seq,
                max_deliver = c.config.max_deliver,
                "message exceeded max deliveries, dropping"
            );
        }
        let next_due_ms = c.next_redelivery_ms();
        if !deliveries.is_empty() || !dropped.is_empty() {
            self.persist_state(state);
        }
        Ok(Pull {
            deliveries,
            next_due_ms,
        })
    }

    pub(crate) fn ack(&self, stream: &str, consumer: &str, seq: u64) -> Result<(), LogError> {
        let mut streams = self.lock();
        let state = get_stream(&mut streams, stream)?;
        let c = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| LogError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })?;
        if c.ack(seq) {
            state.retire_acked(seq);
            self.persist_state(state);
        }
        Ok(())
    }

    pub(crate) fn nak(&self, stream: &str, consumer: &str, seq: u64) -> Result<(), LogError> {
        {
            let mut streams = self.lock();
            let state = get_stream(&mut streams, stream)?;
            let c = state
                .consumers
                .get_mut(consumer)
                .ok_or_else(|| LogError::ConsumerNotFound {
                    stream: stream.to_string(),
                    consumer: consumer.to_string(),
                })?;
            if c.nak(seq) {
                self.persist_state(state);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

fn get_stream<'a>(
    streams: &'a mut BTreeMap<String, StreamState>,
    stream: &str,
) -> Result<&'a mut StreamState, LogError> {
    streams.get_mut(stream).ok_or_else(|| LogError::StreamNotFound {
        stream: stream.to_string(),
    })
}

fn get_consumer<'a>(
    consumers: &'a std::collections::HashMap<String, ConsumerState>,
    stream: &str,
    consumer: &str,
) -> Result<&'a ConsumerState, LogError> {
    consumers.get(consumer).ok_or_else(|| LogError::ConsumerNotFound {
        stream: stream.to_string(),
        consumer: consumer.to_string(),
    })
}
