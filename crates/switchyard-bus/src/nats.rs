//! NATS JetStream implementation of [`Transport`].
//!
//! Core publishes and subscriptions go straight through the client.
//! Persistent publishes go through JetStream and wait for the stream ack.
//! A subscription whose pattern lies entirely inside a stream provisioned
//! through this transport is served by an ephemeral pull consumer, so its
//! deliveries carry ack handles and a nak triggers redelivery.
//!
//! The client reconnects on its own once connected; connection events are
//! logged and [`Transport::is_connected`] follows the live state.

use crate::message::Priority;
use crate::subjects::{is_concrete, is_valid, pattern_covers};
use crate::transport::{
    AckHandle, Acknowledger, ConnectOptions, Delivery, Headers, StorageType, StreamConfig,
    StreamInfo, Transport, TransportSubscription,
};
use async_nats::connection::State;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::{self, stream, AckKind};
use async_nats::{Client, Event, HeaderMap};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Schemes accepted by [`NatsTransport`].
pub const URL_SCHEMES: [&str; 2] = ["nats://", "tls://"];

/// Headers the bus stamps on persistent messages.
const BUS_HEADERS: [&str; 3] = ["message-type", "priority", "correlation-id"];

/// Ephemeral consumers are removed by the server after this much inactivity.
const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct Connection {
    client: Client,
    jetstream: jetstream::Context,
}

/// [`Transport`] over a NATS server with JetStream enabled.
pub struct NatsTransport {
    reconnect_wait: Duration,
    connection: Mutex<Option<Connection>>,
    /// Streams provisioned (or found) through this transport.
    streams: Mutex<Vec<StreamConfig>>,
}

impl NatsTransport {
    /// `reconnect_wait` caps the delay between reconnect attempts after a
    /// connection drops.
    pub fn new(reconnect_wait: Duration) -> Self {
        Self {
            reconnect_wait,
            connection: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn handles(url: &str) -> bool {
        URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
    }

    fn connection(&self) -> SwitchyardResult<Connection> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| SwitchyardError::Transport("not connected".into()))
    }

    fn remember_stream(&self, config: &StreamConfig) {
        let mut streams = self.streams.lock();
        if !streams.iter().any(|s| s.name == config.name) {
            streams.push(config.clone());
        }
    }

    /// The stream whose subjects include everything `pattern` can match.
    fn stream_covering(&self, pattern: &str) -> Option<String> {
        self.streams
            .lock()
            .iter()
            .find(|s| s.subjects.iter().any(|outer| pattern_covers(outer, pattern)))
            .map(|s| s.name.clone())
    }
}

fn transport_error(context: &str, e: impl std::fmt::Display) -> SwitchyardError {
    SwitchyardError::Transport(format!("{context}: {e}"))
}

fn stream_error(context: &str, e: impl std::fmt::Display) -> SwitchyardError {
    SwitchyardError::Stream(format!("{context}: {e}"))
}

fn to_nats_config(config: &StreamConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            StorageType::File => stream::StorageType::File,
            StorageType::Memory => stream::StorageType::Memory,
        },
        max_messages: config
            .max_msgs
            .and_then(|max| i64::try_from(max).ok())
            .unwrap_or(-1),
        max_age: config.max_age.unwrap_or_default(),
        ..Default::default()
    }
}

fn from_nats_info(info: &stream::Info) -> StreamInfo {
    let config = &info.config;
    StreamInfo {
        config: StreamConfig {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            storage: match config.storage {
                stream::StorageType::File => StorageType::File,
                stream::StorageType::Memory => StorageType::Memory,
            },
            max_msgs: usize::try_from(config.max_messages).ok().filter(|max| *max > 0),
            max_age: Some(config.max_age).filter(|age| !age.is_zero()),
        },
        messages: usize::try_from(info.state.messages).unwrap_or(usize::MAX),
        first_seq: Some(info.state.first_sequence).filter(|_| info.state.messages > 0),
        last_seq: info.state.last_sequence,
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn from_header_map(headers: Option<&HeaderMap>) -> Headers {
    let Some(headers) = headers else {
        return Headers::new();
    };
    BUS_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .map(|value| ((*name).to_string(), value.to_string()))
        })
        .collect()
}

/// Acks or naks one JetStream message, once.
struct JetStreamAck {
    message: Arc<jetstream::Message>,
    settled: AtomicBool,
}

impl JetStreamAck {
    fn settle(&self, kind: AckKind) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = Arc::clone(&self.message);
        tokio::spawn(async move {
            if let Err(e) = message.ack_with(kind).await {
                warn!(subject = %message.subject, error = %e, "Failed to settle JetStream message");
            }
        });
    }
}

impl Acknowledger for JetStreamAck {
    fn ack(&self) {
        self.settle(AckKind::Ack);
    }

    fn nak(&self) {
        self.settle(AckKind::Nak(None));
    }
}

async fn pump_core(mut subscriber: async_nats::Subscriber, sender: mpsc::UnboundedSender<Delivery>) {
    while let Some(message) = subscriber.next().await {
        let delivery = Delivery::new(
            message.subject.to_string(),
            from_header_map(message.headers.as_ref()),
            message.payload.to_vec(),
        );
        if sender.send(delivery).is_err() {
            break;
        }
    }
}

async fn pump_consumer(mut messages: pull::Stream, sender: mpsc::UnboundedSender<Delivery>) {
    while let Some(next) = messages.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "JetStream consumer error");
                continue;
            }
        };
        let delivery_count = message
            .info()
            .ok()
            .and_then(|info| u32::try_from(info.delivered).ok())
            .unwrap_or(1);
        let delivery = Delivery::new(
            message.subject.to_string(),
            from_header_map(message.headers.as_ref()),
            message.payload.to_vec(),
        );
        let ack = JetStreamAck {
            message: Arc::new(message),
            settled: AtomicBool::new(false),
        };
        if sender
            .send(delivery.with_ack(AckHandle::new(ack, delivery_count)))
            .is_err()
        {
            break;
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, options: &ConnectOptions) -> SwitchyardResult<()> {
        if !Self::handles(&options.url) {
            return Err(SwitchyardError::Transport(format!(
                "unsupported transport url '{}', expected nats://...",
                options.url
            )));
        }

        let max_wait = self.reconnect_wait.max(Duration::from_millis(100));
        let client = async_nats::ConnectOptions::new()
            .name(&options.name)
            .reconnect_delay_callback(move |attempts| {
                let factor = u32::try_from(attempts).unwrap_or(u32::MAX);
                Duration::from_millis(100).saturating_mul(factor).min(max_wait)
            })
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connection established"),
                    Event::Disconnected => warn!("NATS connection lost, reconnecting"),
                    Event::ServerError(e) => error!(error = %e, "NATS server error"),
                    Event::ClientError(e) => error!(error = %e, "NATS client error"),
                    other => debug!(event = %other, "NATS event"),
                }
            })
            .connect(options.url.as_str())
            .await
            .map_err(|e| transport_error(&format!("cannot connect to {}", options.url), e))?;

        let jetstream = jetstream::new(client.clone());
        *self.connection.lock() = Some(Connection { client, jetstream });
        info!(url = %options.url, name = %options.name, "Connected to NATS");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| matches!(c.client.connection_state(), State::Connected))
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> SwitchyardResult<()> {
        let connection = self.connection()?;
        if !is_concrete(subject) {
            return Err(SwitchyardError::Transport(format!(
                "cannot publish to '{subject}'"
            )));
        }
        connection
            .client
            .publish_with_headers(subject.to_string(), to_header_map(&headers), payload.into())
            .await
            .map_err(|e| transport_error("publish failed", e))
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> SwitchyardResult<u64> {
        let connection = self.connection()?;
        if !is_concrete(subject) {
            return Err(SwitchyardError::Transport(format!(
                "cannot publish to '{subject}'"
            )));
        }
        let ack = connection
            .jetstream
            .publish_with_headers(subject.to_string(), to_header_map(&headers), payload.into())
            .await
            .map_err(|e| stream_error(&format!("no stream accepted '{subject}'"), e))?
            .await
            .map_err(|e| stream_error(&format!("no stream ack for '{subject}'"), e))?;
        debug!(subject = %subject, stream = %ack.stream, seq = ack.sequence, "Published to stream");
        Ok(ack.sequence)
    }

    async fn add_stream(&self, config: StreamConfig) -> SwitchyardResult<StreamInfo> {
        let connection = self.connection()?;
        if connection.jetstream.get_stream(&config.name).await.is_ok() {
            self.remember_stream(&config);
            return Err(SwitchyardError::StreamExists(config.name));
        }

        let mut created = connection
            .jetstream
            .create_stream(to_nats_config(&config))
            .await
            .map_err(|e| stream_error(&format!("cannot create stream {}", config.name), e))?;
        let info = created
            .info()
            .await
            .map_err(|e| stream_error(&format!("cannot read stream {}", config.name), e))?;
        self.remember_stream(&config);
        info!(stream = %config.name, storage = ?config.storage, "Stream provisioned");
        Ok(from_nats_info(info))
    }

    async fn stream_info(&self, name: &str) -> SwitchyardResult<StreamInfo> {
        let connection = self.connection()?;
        let mut stream = connection
            .jetstream
            .get_stream(name)
            .await
            .map_err(|e| stream_error(&format!("stream not found: {name}"), e))?;
        let info = stream
            .info()
            .await
            .map_err(|e| stream_error(&format!("cannot read stream {name}"), e))?;
        Ok(from_nats_info(info))
    }

    /// NATS does not order subscribers, so `priority` is not applied.
    async fn subscribe(
        &self,
        subject: &str,
        priority: Priority,
    ) -> SwitchyardResult<TransportSubscription> {
        let connection = self.connection()?;
        if !is_valid(subject) {
            return Err(SwitchyardError::Subscription(format!(
                "invalid subject '{subject}'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let pump = match self.stream_covering(subject) {
            Some(stream_name) => {
                let stream = connection
                    .jetstream
                    .get_stream(&stream_name)
                    .await
                    .map_err(|e| SwitchyardError::Subscription(format!("stream {stream_name}: {e}")))?;
                let consumer = stream
                    .create_consumer(pull::Config {
                        filter_subject: subject.to_string(),
                        deliver_policy: DeliverPolicy::New,
                        ack_policy: AckPolicy::Explicit,
                        inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| SwitchyardError::Subscription(format!("consumer on {subject}: {e}")))?;
                let messages = consumer
                    .messages()
                    .await
                    .map_err(|e| SwitchyardError::Subscription(format!("consumer on {subject}: {e}")))?;
                debug!(subject = %subject, stream = %stream_name, priority = u8::from(priority), "Subscribed through JetStream consumer");
                tokio::spawn(pump_consumer(messages, sender))
            }
            None => {
                let subscriber = connection
                    .client
                    .subscribe(subject.to_string())
                    .await
                    .map_err(|e| SwitchyardError::Subscription(format!("{subject}: {e}")))?;
                debug!(subject = %subject, priority = u8::from(priority), "Subscribed");
                tokio::spawn(pump_core(subscriber, sender))
            }
        };

        Ok(TransportSubscription::new(subject, receiver, move || {
            pump.abort();
        }))
    }

    async fn drain(&self) -> SwitchyardResult<()> {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection
                .client
                .flush()
                .await
                .map_err(|e| transport_error("flush failed", e))?;
            info!("NATS connection drained");
        }
        Ok(())
    }
}
