//! Durable pull consumers: position tracking, in-flight deliveries and redelivery.

use crate::stream::StoredMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "seq", rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// Deliver every retained message.
    All,
    /// Deliver messages with sequence >= the given one.
    ByStartSequence(u64),
}

/// Durable consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Durable name; unique per stream.
    pub durable_name: String,
    /// Start position.
    pub deliver_policy: DeliverPolicy,
    /// Time a delivery may stay unacknowledged before redelivery (ms).
    pub ack_wait_ms: u64,
    /// Maximum deliveries per message (0 = unlimited).
    pub max_deliver: u32,
    /// Only deliver messages matching this filter.
    pub filter_subject: Option<String>,
}

impl ConsumerConfig {
    /// Durable consumer delivering all messages with a 30s ack wait.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: name.into(),
            deliver_policy: DeliverPolicy::All,
            ack_wait_ms: 30_000,
            max_deliver: 0,
            filter_subject: None,
        }
    }

    fn wants(&self, subject: &str) -> bool {
        self.filter_subject
            .as_deref()
            .map_or(true, |f| crate::subject::subject_matches(f, subject))
    }
}

/// Point-in-time description of a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    /// Stream the consumer reads.
    pub stream: String,
    /// Current configuration.
    pub config: ConsumerConfig,
    /// Matching messages not yet delivered.
    pub num_pending: u64,
    /// Deliveries awaiting acknowledgement.
    pub num_ack_pending: u64,
    /// Total deliveries performed, redeliveries included.
    pub delivered: u64,
    /// Every sequence at or below this one is acknowledged.
    pub ack_floor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InFlight {
    pub(crate) deliveries: u32,
    /// Earliest time the message may be handed out again (ms).
    pub(crate) redeliver_at_ms: u64,
}

/// A delivery chosen by [`ConsumerState::take`].
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub(crate) message: StoredMessage,
    pub(crate) deliveries: u32,
}

/// Consumer state, also the persisted snapshot format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ConsumerState {
    pub(crate) config: ConsumerConfig,
    pub(crate) next_seq: u64,
    pub(crate) delivered: u64,
    pub(crate) in_flight: BTreeMap<u64, InFlight>,
}

impl ConsumerState {
    pub(crate) fn new(config: ConsumerConfig) -> Self {
        let next_seq = match config.deliver_policy {
            DeliverPolicy::All => 1,
            DeliverPolicy::ByStartSequence(seq) => seq.max(1),
        };
        Self {
            config,
            next_seq,
            delivered: 0,
            in_flight: BTreeMap::new(),
        }
    }

    pub(crate) fn ack_floor(&self) -> u64 {
        match self.in_flight.keys().next() {
            Some(&lowest) => lowest - 1,
            None => self.next_seq.saturating_sub(1),
        }
    }

    /// Take up to `batch` deliveries: due redeliveries first, then new messages.
    /// Returns the deliveries and the sequences dropped for exceeding max deliver.
    pub(crate) fn take(
        &mut self,
        messages: &BTreeMap<u64, StoredMessage>,
        batch: usize,
        now_ms: u64,
    ) -> (Vec<Delivery>, Vec<u64>) {
        let mut out = Vec::new();
        let mut dropped = Vec::new();
        let ack_wait = self.config.ack_wait_ms;
        let max_deliver = self.config.max_deliver;

        let due: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.redeliver_at_ms <= now_ms)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in due {
            if out.len() >= batch {
                break;
            }
            let Some(message) = messages.get(&seq) else {
                self.in_flight.remove(&seq);
                continue;
            };
            let Some(flight) = self.in_flight.get_mut(&seq) else {
                continue;
            };
            if max_deliver > 0 && flight.deliveries >= max_deliver {
                self.in_flight.remove(&seq);
                dropped.push(seq);
                continue;
            }
            flight.deliveries += 1;
            flight.redeliver_at_ms = now_ms + ack_wait;
            self.delivered += 1;
            out.push(Delivery {
                message: message.clone(),
                deliveries: flight.deliveries,
            });
        }

        if out.len() < batch {
            let start = self.next_seq;
            for (seq, message) in messages.range(start..) {
                if out.len() >= batch {
                    break;
                }
                self.next_seq = seq + 1;
                if !self.config.wants(&message.subject) {
                    continue;
                }
                self.in_flight.insert(
                    *seq,
                    InFlight {
                        deliveries: 1,
                        redeliver_at_ms: now_ms + ack_wait,
                    },
                );
                self.delivered += 1;
                out.push(Delivery {
                    message: message.clone(),
                    deliveries: 1,
                });
            }
        }

        (out, dropped)
    }

    /// Earliest redelivery deadline among in-flight messages.
    pub(crate) fn next_redelivery_ms(&self) -> Option<u64> {
        self.in_flight.values().map(|f| f.redeliver_at_ms).min()
    }

    pub(crate) fn ack(&mut self, seq: u64) -> bool {
        self.in_flight.remove(&seq).is_some()
    }

    pub(crate) fn nak(&mut self, seq: u64) -> bool {
        match self.in_flight.get_mut(&seq) {
            Some(flight) => {
                flight.redeliver_at_ms = 0;
                true
            }
            None => false,
        }
    }

    pub(crate) fn num_pending(&self, messages: &BTreeMap<u64, StoredMessage>) -> u64 {
        messages
            .range(self.next_seq..)
            .filter(|(_, m)| self.config.wants(&m.subject))
            .count() as u64
    }

    pub(crate) fn info(&self, stream: &str, messages: &BTreeMap<u64, StoredMessage>) -> ConsumerInfo {
        ConsumerInfo {
            stream: stream.to_string(),
            config: self.config.clone(),
            num_pending: self.num_pending(messages),
            num_ack_pending: self.in_flight.len() as u64,
            delivered: self.delivered,
            ack_floor: self.ack_floor(),
        }
    }

    /// Make every in-flight delivery immediately due (used after a restart).
    pub(crate) fn reset_deadlines(&mut self) {
        for flight in self.in_flight.values_mut() {
            flight.redeliver_at_ms = 0;
        }
    }
}
