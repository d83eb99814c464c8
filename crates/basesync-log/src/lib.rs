#![warn(missing_docs)]

//! basesync log: an embedded, durable publish/subscribe log.
//!
//! Every instance runs one [`LogServer`]. Messages are published on
//! dot-separated subjects into streams; durable pull consumers read them back
//! with explicit acknowledgement, redelivery on `nak` or ack-wait expiry, and
//! a per-consumer delivery limit. Streams are bounded by age and count and can
//! be kept in memory or in files that survive restarts.

pub mod client;
pub mod consumer;
pub mod error;
pub mod message;
mod persist;
pub mod server;
pub mod stream;
pub mod subject;

pub use client::LogClient;
pub use consumer::{ConsumerConfig, ConsumerInfo, DeliverPolicy};
pub use error::LogError;
pub use message::Message;
pub use server::{current_time_ms, LogServer};
pub use stream::{PublishAck, RetentionPolicy, StreamConfig, StreamInfo};
