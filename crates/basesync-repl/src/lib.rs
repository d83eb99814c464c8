#![warn(missing_docs)]

//! basesync replication: keeps independent backend instances consistent by
//! propagating record, schema and realtime-ownership changes over durable logs

pub mod cli;
pub mod config;
pub mod conflict;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod memory_store;
pub mod node;
pub mod processor;
pub mod publisher;
pub mod realtime;
pub mod store;
pub mod subscriber;
pub mod transport;

pub use config::{LeaseConfig, ProcessorConfig, SubscriberConfig, SyncConfig, TransportConfig};
pub use conflict::{Admission, ConflictTable, Version};
pub use error::SyncError;
pub use event::{Event, EventSource, EventType, REALTIME_TOPIC};
pub use memory_store::MemoryStore;
pub use node::{NodeStats, SyncNode};
pub use processor::{ApplyOutcome, EventProcessor, ProcessorStats};
pub use publisher::{PublishResult, PublishSummary, Publisher, PublisherStats};
pub use realtime::{LeaseManager, RemoteLeaseOutcome, SubscriptionLease};
pub use store::{Collection, CollectionKind, Field, FieldKind, LocalStore, Record, StoreError};
pub use subscriber::{Subscriber, SubscriberStats};

