//! Messages handed out by pull fetches.

use crate::client::LogClient;
use crate::consumer::Delivery;
use crate::error::LogError;
use bytes::Bytes;

/// A delivered message. Must be acknowledged, otherwise it is redelivered
/// once the consumer's ack wait elapses.
#[derive(Debug, Clone)]
pub struct Message {
    subject: String,
    seq: u64,
    payload: Bytes,
    deliveries: u32,
    stream: String,
    consumer: String,
    client: LogClient,
}

impl Message {
    pub(crate) fn new(delivery: Delivery, stream: &str, consumer: &str, client: LogClient) -> Self {
        Self {
            subject: delivery.message.subject,
            seq: delivery.message.seq,
            payload: delivery.message.payload,
            deliveries: delivery.deliveries,
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            client,
        }
    }

    /// Subject the message was published on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stream sequence.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Message body.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// How many times this message has been delivered, this delivery included.
    pub fn deliveries(&self) -> u32 {
        self.deliveries
    }

    /// Acknowledge processing.
    pub fn ack(&self) -> Result<(), LogError> {
        self.client.ack(&self.stream, &self.consumer, self.seq)
    }

    /// Negative acknowledgement: make the message available for immediate redelivery.
    pub fn nak(&self) -> Result<(), LogError> {
        self.client.nak(&self.stream, &self.consumer, self.seq)
    }

    /// Stop redelivering this message without marking it processed.
    pub fn term(&self) -> Result<(), LogError> {
        self.client.term(&self.stream, &self.consumer, self.seq)
    }
}
