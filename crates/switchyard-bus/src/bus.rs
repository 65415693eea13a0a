use crate::config::BusConfig;
use crate::handler::{MessageHandler, SubscribeOptions};
use crate::memory::MemoryTransport;
use crate::message::{MessageContent, MessageType, Priority};
use crate::subjects::{reply_subject, Subjects};
use crate::transport::{ConnectOptions, Delivery, Headers, Transport, TransportSubscription};
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchyard_core::{HealthState, SwitchyardError, SwitchyardResult};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sender id stamped on messages the bus originates itself.
const BUS_SENDER: &str = "message-bus";

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MessageCounters {
        MessageCounters {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Running message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounters {
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Result of [`MessageBus::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusHealth {
    pub status: HealthState,
    pub connected: bool,
    pub persistence_enabled: bool,
    pub active_handlers: usize,
    pub active_subscriptions: usize,
    pub pending_requests: usize,
    pub counters: MessageCounters,
    /// `"passed"` or `"failed"`; absent when not connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_test: Option<String>,
}

/// Result of [`MessageBus::get_message_statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatistics {
    pub counters: MessageCounters,
    pub active_handlers: usize,
    pub active_subscriptions: usize,
    pub pending_requests: usize,
    pub subject_patterns: BTreeMap<String, String>,
}

struct PendingRequest {
    reply: oneshot::Sender<MessageContent>,
    deadline: Instant,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Removes the pending entry and the reply subscription however `request` exits.
struct RequestGuard {
    pending: PendingMap,
    correlation_id: String,
    reader: JoinHandle<()>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
        self.reader.abort();
    }
}

struct HandlerRecord {
    subject: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HandlerRecord {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(subject = %self.subject, error = %e, "Subscription task failed");
            }
        }
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct BusInner {
    config: BusConfig,
    subjects: Subjects,
    transport: Arc<dyn Transport>,
    running: AtomicBool,
    persistence_active: AtomicBool,
    counters: Arc<Counters>,
    handlers: Mutex<HashMap<String, HandlerRecord>>,
    pending: PendingMap,
    background: Mutex<Option<Background>>,
}

/// Asynchronous publish/subscribe messaging between agents and producers.
///
/// Wraps a [`Transport`] with the envelope format, subject naming, stream
/// provisioning, request/response correlation, acknowledgement policy and
/// counters. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Bus over the transport `config.url` selects (see [`BusConfig::transport`]).
    ///
    /// An unsupported url leaves the bus on an in-process broker that refuses
    /// it, so [`MessageBus::start`] fails; [`MessageBus::try_new`] reports it
    /// up front instead.
    pub fn new(config: BusConfig) -> Self {
        match config.transport() {
            Ok(transport) => Self::with_transport(config, transport),
            Err(e) => {
                warn!(error = %e, "No transport for bus url");
                Self::with_transport(config, Arc::new(MemoryTransport::new()))
            }
        }
    }

    pub fn try_new(config: BusConfig) -> SwitchyardResult<Self> {
        let transport = config.transport()?;
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        let subjects = Subjects::new(config.subject_prefix.clone());
        info!(prefix = %subjects.prefix(), "Message bus initialized");
        Self {
            inner: Arc::new(BusInner {
                config,
                subjects,
                transport,
                running: AtomicBool::new(false),
                persistence_active: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
                handlers: Mutex::new(HashMap::new()),
                pending: Arc::new(Mutex::new(HashMap::new())),
                background: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn subjects(&self) -> &Subjects {
        &self.inner.subjects
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Connect (with retries), provision streams, and start the background loops.
    ///
    /// Failing to connect is the one error that propagates.
    pub async fn start(&self) -> SwitchyardResult<()> {
        if self.is_running() {
            warn!("Message bus already started");
            return Ok(());
        }

        self.connect_with_retry().await?;

        if self.inner.config.persistence_enabled {
            self.provision_streams().await;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(heartbeat_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.heartbeat_interval(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(cleanup_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.cleanup_interval(),
                shutdown_rx,
            )),
        ];
        *self.inner.background.lock() = Some(Background { shutdown, handles });

        info!(
            url = %self.inner.config.url,
            persistence = self.inner.config.persistence_enabled,
            "Message bus started"
        );
        Ok(())
    }

    async fn connect_with_retry(&self) -> SwitchyardResult<()> {
        let options = ConnectOptions {
            url: self.inner.config.url.clone(),
            name: format!("{}-message-bus", self.inner.config.client_name),
        };
        let attempts = self.inner.config.max_reconnect_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.inner.transport.connect(&options).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    error!(url = %options.url, attempts, error = %e, "Failed to start message bus");
                    return Err(SwitchyardError::Transport(format!(
                        "could not connect to {} after {attempts} attempts: {e}",
                        options.url
                    )));
                }
                Err(e) => {
                    warn!(url = %options.url, attempt, error = %e, "Connection attempt failed, retrying");
                    tokio::time::sleep(self.inner.config.reconnect_wait()).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Provision the stream set. Persistent publishing is switched on only
    /// when every stream is in place; otherwise messages go out directly.
    async fn provision_streams(&self) -> bool {
        let streams = self.inner.config.streams();
        let wanted = streams.len();
        let mut ready = 0;
        for stream in streams {
            let name = stream.name.clone();
            match self.inner.transport.add_stream(stream).await {
                Ok(_) => {
                    info!(stream = %name, "Created stream");
                    ready += 1;
                }
                Err(e) if e.is_already_exists() => {
                    debug!(stream = %name, "Stream already exists");
                    ready += 1;
                }
                Err(e) => error!(stream = %name, error = %e, "Error creating stream"),
            }
        }

        let active = ready == wanted;
        if !active {
            warn!(ready, wanted, "Streams missing, publishing without persistence");
        }
        self.inner.persistence_active.store(active, Ordering::SeqCst);
        active
    }

    /// Called when the transport comes back after losing its connection.
    async fn on_reconnected(&self) {
        info!(url = %self.inner.config.url, "Message bus connection restored");
        if self.inner.config.persistence_enabled
            && !self.inner.persistence_active.load(Ordering::SeqCst)
        {
            self.provision_streams().await;
        }
    }

    /// Stop loops, cancel pending requests, drain subscriptions, then the transport.
    ///
    /// Safe to call at any time, including after a failed `start`.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let background = self.inner.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for handle in background.handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Bus background task failed");
                    }
                }
            }
        }

        self.cancel_pending();

        let records: Vec<(String, HandlerRecord)> = self.inner.handlers.lock().drain().collect();
        for (subscription_id, record) in records {
            record.shutdown().await;
            debug!(subscription_id = %subscription_id, "Subscription drained");
        }

        if let Err(e) = self.inner.transport.drain().await {
            error!(error = %e, "Error draining transport");
        }
        self.inner.persistence_active.store(false, Ordering::SeqCst);
        // Requests registered while the subscriptions were draining.
        self.cancel_pending();

        info!("Message bus stopped");
    }

    fn cancel_pending(&self) {
        let cancelled = {
            let mut pending = self.inner.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if cancelled > 0 {
            info!(cancelled, "Cancelled pending requests");
        }
    }

    /// Publish an envelope. Never fails loudly: returns `false` and counts the
    /// failure instead.
    ///
    /// With `persistent` (and persistence enabled) the message goes through the
    /// stream bound to `subject`, tagged with message-type, priority and
    /// correlation-id headers.
    pub async fn publish(&self, subject: &str, message: &MessageContent, persistent: bool) -> bool {
        match self.try_publish(subject, message, persistent).await {
            Ok(()) => {
                Counters::bump(&self.inner.counters.sent);
                debug!(subject = %subject, message_id = %message.message_id, "Message published");
                true
            }
            Err(e) => {
                Counters::bump(&self.inner.counters.failed);
                error!(subject = %subject, error = %e, "Failed to publish message");
                false
            }
        }
    }

    async fn try_publish(
        &self,
        subject: &str,
        message: &MessageContent,
        persistent: bool,
    ) -> SwitchyardResult<()> {
        let payload = message.to_wire()?;
        if persistent && self.inner.persistence_active.load(Ordering::SeqCst) {
            let headers = Headers::from([
                ("message-type".to_string(), message.message_type.to_string()),
                ("priority".to_string(), u8::from(message.priority).to_string()),
                (
                    "correlation-id".to_string(),
                    message.correlation_id.clone().unwrap_or_default(),
                ),
            ]);
            self.inner
                .transport
                .publish_persistent(subject, headers, payload)
                .await
                .map(|_| ())
        } else {
            self.inner
                .transport
                .publish(subject, Headers::new(), payload)
                .await
        }
    }

    /// Send `message` to `subject` and wait for the correlated response.
    ///
    /// `Ok(None)` means the timeout elapsed (`None` uses the configured
    /// default). `Err(Cancelled)` means the bus stopped while waiting.
    pub async fn request(
        &self,
        subject: &str,
        mut message: MessageContent,
        timeout: Option<Duration>,
    ) -> SwitchyardResult<Option<MessageContent>> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        let correlation_id = Uuid::new_v4().to_string();
        let reply_to = reply_subject(subject, &correlation_id);

        let replies = self
            .inner
            .transport
            .subscribe(&reply_to, Priority::Critical)
            .await
            .map_err(|e| {
                SwitchyardError::Transport(format!("cannot subscribe to {reply_to}: {e}"))
            })?;

        let (reply, response) = oneshot::channel();
        self.inner.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                reply,
                deadline: Instant::now() + timeout,
            },
        );
        let _guard = RequestGuard {
            pending: Arc::clone(&self.inner.pending),
            correlation_id: correlation_id.clone(),
            reader: tokio::spawn(read_replies(
                replies,
                Arc::clone(&self.inner.pending),
                Arc::clone(&self.inner.counters),
            )),
        };
        // `stop` may have cleared the pending map before our entry went in.
        if !self.is_running() {
            return Err(SwitchyardError::Cancelled(format!(
                "request {correlation_id} cancelled: bus stopped"
            )));
        }

        message.correlation_id = Some(correlation_id.clone());
        if message.sender_id.is_none() {
            message.sender_id = Some(BUS_SENDER.to_string());
        }
        if message.subject.is_empty() {
            message.subject = subject.to_string();
        }

        if !self.publish(subject, &message, false).await {
            return Err(SwitchyardError::Transport(format!(
                "failed to publish request to {subject}"
            )));
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(SwitchyardError::Cancelled(format!(
                "request {correlation_id} cancelled"
            ))),
            Err(_) => {
                warn!(correlation_id = %correlation_id, subject = %subject, "Request timed out");
                Ok(None)
            }
        }
    }

    /// Answer a message received through [`MessageBus::request`].
    pub async fn respond(
        &self,
        request: &MessageContent,
        payload: Value,
        sender_id: Option<&str>,
    ) -> bool {
        let Some(correlation_id) = request.correlation_id.as_deref() else {
            warn!(message_id = %request.message_id, "Cannot respond to a message without correlation id");
            return false;
        };
        if request.subject.is_empty() {
            warn!(message_id = %request.message_id, "Cannot respond to a message without subject");
            return false;
        }

        let mut response = request.response_to(payload);
        response.sender_id = sender_id.map(str::to_string);
        self.publish(&reply_subject(&request.subject, correlation_id), &response, false)
            .await
    }

    /// Bind a handler to a subject pattern. Returns the subscription id.
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> SwitchyardResult<String> {
        let subscription = self
            .inner
            .transport
            .subscribe(subject, options.priority)
            .await?;
        let subscription_id = Uuid::new_v4().to_string();

        let dispatcher = Arc::new(Dispatcher {
            subscription_id: subscription_id.clone(),
            handler,
            options,
            counters: Arc::clone(&self.inner.counters),
            transport: Arc::clone(&self.inner.transport),
            subjects: self.inner.subjects.clone(),
        });
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(subscription, dispatcher, stop_rx));

        self.inner.handlers.lock().insert(
            subscription_id.clone(),
            HandlerRecord {
                subject: subject.to_string(),
                stop,
                task,
            },
        );

        info!(
            subject = %subject,
            subscription_id = %subscription_id,
            auto_ack = options.auto_ack,
            priority = u8::from(options.priority),
            "Subscribed"
        );
        Ok(subscription_id)
    }

    /// Stop a subscription after its buffered and in-flight messages finish.
    /// Returns `false` for unknown ids.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let record = self.inner.handlers.lock().remove(subscription_id);
        let Some(record) = record else {
            warn!(subscription_id = %subscription_id, "Unknown subscription");
            return false;
        };
        record.shutdown().await;
        info!(subscription_id = %subscription_id, "Unsubscribed");
        true
    }

    pub async fn send_event(&self, event_type: &str, payload: Value, source_id: Option<&str>) -> bool {
        let mut message = MessageContent::new(MessageType::Event)
            .with_subject(event_type)
            .with_payload(payload)
            .with_correlation_id(Uuid::new_v4().to_string());
        message.sender_id = source_id.map(str::to_string);

        self.publish(&self.inner.subjects.event(event_type), &message, true)
            .await
    }

    /// Publish a task and return its id, whether or not the publish succeeded.
    ///
    /// Results arrive on [`Subjects::response`] for the returned id.
    pub async fn distribute_task(
        &self,
        task_type: &str,
        payload: Value,
        agent_type: Option<&str>,
        priority: Priority,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let mut message = MessageContent::new(MessageType::Task)
            .with_subject(task_type)
            .with_priority(priority)
            .with_correlation_id(task_id.clone())
            .with_payload(json!({
                "task_id": task_id,
                "data": payload,
                "priority": u8::from(priority),
            }));
        if let Some(agent_type) = agent_type {
            message
                .payload
                .insert("agent_type".into(), Value::from(agent_type));
        }

        let subject = self.inner.subjects.task(task_type, agent_type);
        if self.publish(&subject, &message, true).await {
            info!(task_id = %task_id, task_type = %task_type, "Task distributed");
        } else {
            warn!(task_id = %task_id, task_type = %task_type, "Task could not be published");
        }
        task_id
    }

    /// Publish the outcome of a task on its result subject.
    pub async fn send_task_result(&self, task_id: &str, result: Value, sender_id: Option<&str>) -> bool {
        let mut message = MessageContent::new(MessageType::Result)
            .with_subject(task_id)
            .with_payload(result)
            .with_correlation_id(task_id);
        message.sender_id = sender_id.map(str::to_string);

        self.publish(&self.inner.subjects.response(task_id), &message, true)
            .await
    }

    pub async fn broadcast(&self, message_type: &str, payload: Value, source_id: Option<&str>) -> bool {
        let mut message = MessageContent::new(MessageType::Broadcast)
            .with_subject(message_type)
            .with_payload(payload);
        message.sender_id = source_id.map(str::to_string);

        self.publish(&self.inner.subjects.broadcast(message_type), &message, true)
            .await
    }

    /// Liveness message from an agent. Heartbeats are not retained.
    pub async fn send_heartbeat(&self, agent_id: &str, status: Value) -> bool {
        let message = MessageContent::new(MessageType::Heartbeat)
            .with_subject("agent.heartbeat")
            .with_sender(agent_id)
            .with_payload(status);

        self.publish(&self.inner.subjects.heartbeat(agent_id), &message, false)
            .await
    }

    /// Subscribe `handler` to the agent's dedicated channel and return the channel name.
    pub async fn create_agent_channel(
        &self,
        agent_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> SwitchyardResult<String> {
        let channel = self.inner.subjects.agent_channel(agent_id);
        self.subscribe(&format!("{channel}.*"), handler, SubscribeOptions::default())
            .await?;
        debug!(agent_id = %agent_id, channel = %channel, "Agent channel created");
        Ok(channel)
    }

    /// Drop pending requests whose deadline has passed. Returns how many.
    pub fn sweep_expired_requests(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.inner.pending.lock();
        let before = pending.len();
        pending.retain(|_, request| request.deadline > now);
        before - pending.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn handler_counts(&self) -> (usize, usize) {
        let handlers = self.inner.handlers.lock();
        let live = handlers.values().filter(|r| !r.task.is_finished()).count();
        (handlers.len(), live)
    }

    /// Connectivity, subscription counts and counters, with a subscribe probe.
    pub async fn health_check(&self) -> BusHealth {
        let connected = self.inner.transport.is_connected();
        let (active_handlers, active_subscriptions) = self.handler_counts();

        let mut health = BusHealth {
            status: if connected {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            connected,
            persistence_enabled: self.inner.persistence_active.load(Ordering::SeqCst),
            active_handlers,
            active_subscriptions,
            pending_requests: self.pending_requests(),
            counters: self.inner.counters.snapshot(),
            connection_test: None,
        };

        if connected {
            let probe = format!("_health.probe.{}", Uuid::new_v4().simple());
            match self.inner.transport.subscribe(&probe, Priority::Low).await {
                Ok(subscription) => {
                    drop(subscription);
                    health.connection_test = Some("passed".into());
                }
                Err(e) => {
                    warn!(error = %e, "Bus connection test failed");
                    health.connection_test = Some("failed".into());
                    health.status = HealthState::Degraded;
                }
            }
        }
        health
    }

    pub fn get_message_statistics(&self) -> BusStatistics {
        let (active_handlers, active_subscriptions) = self.handler_counts();
        BusStatistics {
            counters: self.inner.counters.snapshot(),
            active_handlers,
            active_subscriptions,
            pending_requests: self.pending_requests(),
            subject_patterns: self.inner.subjects.patterns(),
        }
    }
}

/// Everything one subscription needs to process deliveries.
struct Dispatcher {
    subscription_id: String,
    handler: Arc<dyn MessageHandler>,
    options: SubscribeOptions,
    counters: Arc<Counters>,
    transport: Arc<dyn Transport>,
    subjects: Subjects,
}

impl Dispatcher {
    async fn dispatch(&self, delivery: Delivery) {
        let mut message = match MessageContent::from_wire(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                Counters::bump(&self.counters.failed);
                warn!(subject = %delivery.subject, error = %e, "Dropping undecodable message");
                delivery.ack();
                return;
            }
        };
        Counters::bump(&self.counters.received);

        let attempt = delivery.delivery_count();
        message.retry_count = attempt.saturating_sub(1);

        if message.is_expired() {
            debug!(subject = %delivery.subject, message_id = %message.message_id, "Dropping expired message");
            delivery.ack();
            return;
        }

        let outcome = AssertUnwindSafe(self.handler.handle(message.clone()))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(())) => {
                delivery.ack();
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };

        if self.options.auto_ack {
            error!(
                subscription_id = %self.subscription_id,
                subject = %delivery.subject,
                message_id = %message.message_id,
                error = %reason,
                "Error processing message"
            );
            delivery.ack();
            return;
        }

        if delivery.is_ackable() && attempt <= message.max_retries {
            Counters::bump(&self.counters.retried);
            warn!(
                subscription_id = %self.subscription_id,
                subject = %delivery.subject,
                message_id = %message.message_id,
                attempt,
                error = %reason,
                "Message handler failed, requesting redelivery"
            );
            delivery.nak();
            return;
        }

        Counters::bump(&self.counters.failed);
        error!(
            subscription_id = %self.subscription_id,
            subject = %delivery.subject,
            message_id = %message.message_id,
            attempts = attempt,
            error = %reason,
            "Message handler failed, giving up"
        );
        delivery.ack();
        if message.message_type != MessageType::Error {
            self.publish_failure(&message, &delivery.subject, &reason, attempt)
                .await;
        }
    }

    async fn publish_failure(&self, message: &MessageContent, subject: &str, reason: &str, attempts: u32) {
        let mut report = MessageContent::new(MessageType::Error)
            .with_subject(subject)
            .with_sender(BUS_SENDER)
            .with_priority(message.priority)
            .with_payload(json!({
                "error": reason,
                "subscription_id": self.subscription_id,
                "original_message_id": message.message_id,
                "original_message_type": message.message_type,
                "attempts": attempts,
                "failed_at": Utc::now().to_rfc3339(),
            }));
        report.correlation_id = message
            .correlation_id
            .clone()
            .or_else(|| Some(message.message_id.clone()));

        let error_subject = self.subjects.error_for(subject);
        let published = match report.to_wire() {
            Ok(payload) => self
                .transport
                .publish(&error_subject, Headers::new(), payload)
                .await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => Counters::bump(&self.counters.sent),
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!(subject = %error_subject, error = %e, "Failed to publish error report");
            }
        }
    }
}

async fn run_subscription(
    mut subscription: TransportSubscription,
    dispatcher: Arc<Dispatcher>,
    mut stop: oneshot::Receiver<()>,
) {
    let limiter = Arc::new(Semaphore::new(dispatcher.options.max_concurrent.max(1)));
    let mut in_flight = JoinSet::new();
    let mut stopping = false;

    loop {
        tokio::select! {
            delivery = subscription.next() => {
                let Some(delivery) = delivery else { break };
                let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else { break };
                let dispatcher = Arc::clone(&dispatcher);
                in_flight.spawn(async move {
                    dispatcher.dispatch(delivery).await;
                    drop(permit);
                });
            }
            _ = &mut stop, if !stopping => {
                // Buffered deliveries are still read until the channel reports closed.
                stopping = true;
                subscription.close();
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(subscription_id = %dispatcher.subscription_id, error = %e, "Message dispatch failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(subscription_id = %dispatcher.subscription_id, error = %e, "Message dispatch failed");
        }
    }
    debug!(subscription_id = %dispatcher.subscription_id, "Subscription loop stopped");
}

/// Resolve pending requests from the deliveries of one reply subscription.
async fn read_replies(mut replies: TransportSubscription, pending: PendingMap, counters: Arc<Counters>) {
    while let Some(delivery) = replies.next().await {
        let response = match MessageContent::from_wire(&delivery.payload) {
            Ok(response) => response,
            Err(e) => {
                Counters::bump(&counters.failed);
                warn!(subject = %delivery.subject, error = %e, "Dropping undecodable response");
                continue;
            }
        };
        Counters::bump(&counters.received);

        let Some(correlation_id) = response.correlation_id.clone() else {
            debug!(subject = %delivery.subject, "Response without correlation id");
            continue;
        };
        let waiter = pending.lock().remove(&correlation_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.reply.send(response);
            }
            None => debug!(correlation_id = %correlation_id, "Ignoring response for settled request"),
        }
    }
}

/// Publishes heartbeat events and watches the connection: a transport that
/// drops and comes back gets its streams provisioned again if they were missing.
async fn heartbeat_loop(bus: Weak<BusInner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_connected = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = bus.upgrade() else { break };
                let bus = MessageBus { inner };
                let connected = bus.inner.transport.is_connected();
                match (was_connected, connected) {
                    (true, false) => warn!(url = %bus.inner.config.url, "Message bus lost its connection"),
                    (false, true) => bus.on_reconnected().await,
                    _ => {}
                }
                was_connected = connected;
                if connected {
                    let counters = bus.inner.counters.snapshot();
                    bus.send_event(
                        "message_bus.heartbeat",
                        json!({
                            "status": "healthy",
                            "timestamp": Utc::now().to_rfc3339(),
                            "counters": counters,
                        }),
                        Some(bus.inner.config.client_name.as_str()),
                    )
                    .await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Heartbeat loop stopped");
}

async fn cleanup_loop(bus: Weak<BusInner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = bus.upgrade() else { break };
                let expired = MessageBus { inner }.sweep_expired_requests();
                if expired > 0 {
                    info!(expired, "Dropped expired pending requests");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Cleanup loop stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_before_start_is_safe() {
        let bus = MessageBus::new(BusConfig::default());
        bus.stop().await;
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let bus = MessageBus::new(BusConfig::default());
        let message = MessageContent::new(MessageType::Event);
        assert!(!bus.publish("switchyard.events.x", &message, true).await);
        assert_eq!(bus.get_message_statistics().counters.failed, 1);
    }

    #[tokio::test]
    async fn test_respond_requires_correlation() {
        let bus = MessageBus::new(BusConfig::default());
        bus.start().await.unwrap();
        let orphan = MessageContent::new(MessageType::Request).with_subject("switchyard.rpc.x");
        assert!(!bus.respond(&orphan, Value::Null, None).await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_statistics_patterns() {
        let bus = MessageBus::new(BusConfig::default());
        let stats = bus.get_message_statistics();
        assert_eq!(stats.subject_patterns["tasks"], "switchyard.tasks.>");
        assert_eq!(stats.active_handlers, 0);
        assert_eq!(stats.counters, MessageCounters::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_expired() {
        let bus = MessageBus::new(BusConfig::default());
        let (early, _rx1) = oneshot::channel();
        let (late, _rx2) = oneshot::channel();
        {
            let mut pending = bus.inner.pending.lock();
            pending.insert(
                "early".into(),
                PendingRequest {
                    reply: early,
                    deadline: Instant::now() + Duration::from_secs(1),
                },
            );
            pending.insert(
                "late".into(),
                PendingRequest {
                    reply: late,
                    deadline: Instant::now() + Duration::from_secs(60),
                },
            );
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(bus.sweep_expired_requests(), 1);
        assert_eq!(bus.pending_requests(), 1);
    }
}
