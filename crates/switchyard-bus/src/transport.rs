//! The seam between the bus and the message broker it runs on.

use crate::message::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use switchyard_core::SwitchyardResult;
use tokio::sync::mpsc;

/// Transport-level message headers.
pub type Headers = BTreeMap<String, String>;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub name: String,
}

/// Backing storage of a persistent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    File,
    Memory,
}

/// A named, bounded log of the messages published to a set of subject patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
    /// Oldest messages are discarded beyond this count.
    pub max_msgs: Option<usize>,
    /// Messages older than this are discarded.
    pub max_age: Option<Duration>,
}

impl StreamConfig {
    /// Memory-backed, unbounded stream.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            storage: StorageType::Memory,
            max_msgs: None,
            max_age: None,
        }
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_msgs(mut self, max_msgs: usize) -> Self {
        self.max_msgs = Some(max_msgs);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Snapshot of a provisioned stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub messages: usize,
    pub first_seq: Option<u64>,
    pub last_seq: u64,
}

/// One message as retained by a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq: u64,
    pub subject: String,
    #[serde(default)]
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Settles one delivery of a persistent message.
pub trait Acknowledger: Send + Sync {
    /// Mark the delivery processed.
    fn ack(&self);
    /// Reject the delivery and request redelivery.
    fn nak(&self);
}

/// Acknowledgement handle attached to deliveries of persistent messages.
pub struct AckHandle {
    acker: Box<dyn Acknowledger>,
    delivery_count: u32,
}

impl AckHandle {
    pub fn new(acker: impl Acknowledger + 'static, delivery_count: u32) -> Self {
        Self {
            acker: Box::new(acker),
            delivery_count,
        }
    }
}

/// A message handed to a subscriber.
pub struct Delivery {
    pub subject: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
    ack: Option<AckHandle>,
}

impl Delivery {
    pub fn new(subject: impl Into<String>, headers: Headers, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            headers,
            payload,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: AckHandle) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Whether this delivery can be acked/naked (persistent messages only).
    pub fn is_ackable(&self) -> bool {
        self.ack.is_some()
    }

    /// 1 for the first delivery, incremented on every redelivery.
    pub fn delivery_count(&self) -> u32 {
        self.ack.as_ref().map_or(1, |a| a.delivery_count)
    }

    pub fn ack(&self) {
        if let Some(handle) = &self.ack {
            handle.acker.ack();
        }
    }

    /// Request redelivery. Returns `false` when the delivery is not ackable.
    pub fn nak(&self) -> bool {
        match &self.ack {
            Some(handle) => {
                handle.acker.nak();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}

/// Receiving end of a transport subscription.
///
/// Dropping or closing it unsubscribes; deliveries already buffered remain
/// readable through [`TransportSubscription::next`] after `close`.
pub struct TransportSubscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportSubscription {
    pub fn new(
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivery; `None` once closed and drained.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Stop new deliveries. Buffered deliveries can still be read.
    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// A publish/subscribe broker connection with persistent streams.
///
/// Implementations must be safe to share across tasks; the bus holds one
/// `Arc<dyn Transport>` for all of its traffic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Called again on retry after a failure.
    async fn connect(&self, options: &ConnectOptions) -> SwitchyardResult<()>;

    fn is_connected(&self) -> bool;

    /// Best-effort delivery to current subscribers. Nothing is retained.
    async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>)
        -> SwitchyardResult<()>;

    /// Store the message in every stream bound to `subject`, then deliver it
    /// with acknowledgement handles. Returns the stream sequence number.
    ///
    /// Fails when no stream is bound to the subject.
    async fn publish_persistent(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> SwitchyardResult<u64>;

    /// Provision a stream. Fails with `StreamExists` if the name is taken.
    async fn add_stream(&self, config: StreamConfig) -> SwitchyardResult<StreamInfo>;

    async fn stream_info(&self, name: &str) -> SwitchyardResult<StreamInfo>;

    /// Subscribe to a subject pattern. Higher-priority subscribers receive
    /// each message first.
    async fn subscribe(
        &self,
        subject: &str,
        priority: Priority,
    ) -> SwitchyardResult<TransportSubscription>;

    /// Close every subscription and disconnect.
    async fn drain(&self) -> SwitchyardResult<()>;
}
