//! Message bus: durable publish/subscribe between agents and task producers.
//!
//! Messages travel as [`MessageContent`] envelopes over a pluggable
//! [`Transport`]. The bus adds subject naming, persistent streams,
//! request/response correlation, acknowledgement with bounded redelivery,
//! and heartbeat/cleanup loops.
//!
//! # Main types
//!
//! - [`MessageBus`]: Publish, subscribe, request/response and convenience senders.
//! - [`MessageContent`]: The wire envelope.
//! - [`Transport`]: Broker seam. [`NatsTransport`] talks to NATS JetStream
//!   (`nats://`), [`MemoryTransport`] is the in-process broker (`memory://`).
//! - [`Subjects`]: `{prefix}.{category}.{key}` subject builder.

/// The bus itself.
pub mod bus;
/// Bus settings and the stream set.
pub mod config;
/// Message handlers and subscription options.
pub mod handler;
/// In-process broker.
pub mod memory;
/// Envelope, message types and priorities.
pub mod message;
/// NATS JetStream transport.
pub mod nats;
/// Subject naming and wildcard matching.
pub mod subjects;
/// Transport trait, deliveries and stream definitions.
pub mod transport;

pub use bus::{BusHealth, BusStatistics, MessageBus, MessageCounters};
pub use config::BusConfig;
pub use handler::{handler_fn, FnHandler, MessageHandler, SubscribeOptions};
pub use memory::MemoryTransport;
pub use message::{into_payload, MessageContent, MessageType, Priority};
pub use nats::NatsTransport;
pub use subjects::{pattern_covers, reply_subject, subject_matches, SubjectCategory, Subjects};
pub use transport::{
    AckHandle, Acknowledger, ConnectOptions, Delivery, Headers, StorageType, StoredMessage,
    StreamConfig, StreamInfo, Transport, TransportSubscription,
};
