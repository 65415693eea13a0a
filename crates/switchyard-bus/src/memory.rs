//! In-process broker implementing [`Transport`].
//!
//! Subjects follow the usual token rules (`*` and `>` wildcards). Persistent
//! publishes are retained in streams, optionally mirrored to JSON-lines files
//! under `{data_dir}/streams/`, and delivered with ack handles; a nak sends
//! the same message back to the same subscriber with its delivery count bumped.

use crate::message::Priority;
use crate::subjects::{is_concrete, is_valid, subject_matches};
use crate::transport::{
    AckHandle, Acknowledger, ConnectOptions, Delivery, Headers, StorageType, StoredMessage,
    StreamConfig, StreamInfo, Transport, TransportSubscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const URL_SCHEME: &str = "memory://";

struct Subscriber {
    id: u64,
    pattern: String,
    priority: Priority,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// What the JSON-lines file of a stream holds right now.
#[derive(Debug, Default)]
struct FileCursor {
    persisted_seq: u64,
    lines: usize,
}

#[derive(Clone)]
struct StreamFile {
    path: PathBuf,
    cursor: Arc<tokio::sync::Mutex<FileCursor>>,
}

struct StreamState {
    config: StreamConfig,
    messages: VecDeque<StoredMessage>,
    last_seq: u64,
    file: Option<StreamFile>,
}

impl StreamState {
    fn binds(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn enforce_limits(&mut self, now: DateTime<Utc>) {
        if let Some(cutoff) = self
            .config
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| now.checked_sub_signed(age))
        {
            while self.messages.front().is_some_and(|m| m.stored_at < cutoff) {
                self.messages.pop_front();
            }
        }
        if let Some(max) = self.config.max_msgs {
            while self.messages.len() > max {
                self.messages.pop_front();
            }
        }
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len(),
            first_seq: self.messages.front().map(|m| m.seq),
            last_seq: self.last_seq,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    subscribers: Vec<Subscriber>,
    streams: BTreeMap<String, StreamState>,
    next_subscriber_id: u64,
}

impl BrokerState {
    /// Subscribers matching `subject`, highest priority first, then by age.
    fn route(&self, subject: &str) -> Vec<&Subscriber> {
        let mut targets: Vec<&Subscriber> = self
            .subscribers
            .iter()
            .filter(|s| subject_matches(&s.pattern, subject))
            .collect();
        targets.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        targets
    }

    fn deliver(&self, subject: &str, headers: &Headers, payload: &[u8], ackable: bool) -> usize {
        let targets = self.route(subject);
        for target in &targets {
            let delivery = Delivery::new(subject, headers.clone(), payload.to_vec());
            let delivery = if ackable {
                delivery.with_ack(AckHandle::new(
                    MemoryAck::new(&target.sender, subject, headers, payload, 1),
                    1,
                ))
            } else {
                delivery
            };
            if target.sender.send(delivery).is_err() {
                debug!(subscriber = target.id, "Subscriber gone, dropping delivery");
            }
        }
        targets.len()
    }
}

struct MemoryAck {
    redeliver: mpsc::WeakUnboundedSender<Delivery>,
    subject: String,
    headers: Headers,
    payload: Vec<u8>,
    delivery_count: u32,
    settled: AtomicBool,
}

impl MemoryAck {
    fn new(
        sender: &mpsc::UnboundedSender<Delivery>,
        subject: &str,
        headers: &Headers,
        payload: &[u8],
        delivery_count: u32,
    ) -> Self {
        Self {
            redeliver: sender.downgrade(),
            subject: subject.to_string(),
            headers: headers.clone(),
            payload: payload.to_vec(),
            delivery_count,
            settled: AtomicBool::new(false),
        }
    }
}

impl Acknowledger for MemoryAck {
    fn ack(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    fn nak(&self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Unsubscribed subscribers get nothing back.
        let Some(sender) = self.redeliver.upgrade() else {
            return;
        };
        let next = self.delivery_count + 1;
        let delivery = Delivery::new(&self.subject, self.headers.clone(), self.payload.clone())
            .with_ack(AckHandle::new(
                MemoryAck::new(&sender, &self.subject, &self.headers, &self.payload, next),
                next,
            ));
        let _ = sender.send(delivery);
    }
}

struct Broker {
    data_dir: Option<PathBuf>,
    connected: AtomicBool,
    state: Mutex<BrokerState>,
}

/// In-process [`Transport`]. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Broker>,
}

impl MemoryTransport {
    /// Broker whose streams live only in memory.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Broker whose file-backed streams are persisted under `data_dir/streams/`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::build(Some(data_dir.into()))
    }

    fn build(data_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Broker {
                data_dir,
                connected: AtomicBool::new(false),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    /// Messages currently retained by a stream, oldest first.
    pub fn stream_messages(&self, name: &str) -> SwitchyardResult<Vec<StoredMessage>> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(name)
            .map(|s| s.messages.iter().cloned().collect())
            .ok_or_else(|| SwitchyardError::Stream(format!("stream not found: {name}")))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    fn ensure_connected(&self) -> SwitchyardResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchyardError::Transport("not connected".into()))
        }
    }

    fn stream_file(&self, config: &StreamConfig) -> Option<StreamFile> {
        match (config.storage, &self.inner.data_dir) {
            (StorageType::File, Some(dir)) => Some(StreamFile {
                path: dir.join("streams").join(format!("{}.jsonl", config.name)),
                cursor: Arc::new(tokio::sync::Mutex::new(FileCursor::default())),
            }),
            _ => None,
        }
    }

    /// Bring a stream's file up to date with its retained messages.
    ///
    /// New messages are appended. Once the limits have discarded anything
    /// still on disk, the file is rewritten with exactly the retained set.
    async fn sync_stream_file(&self, name: &str, file: &StreamFile) -> SwitchyardResult<()> {
        let mut cursor = file.cursor.lock().await;
        let (compact, messages) = {
            let state = self.inner.state.lock();
            let Some(stream) = state.streams.get(name) else {
                return Ok(());
            };
            let fresh = stream
                .messages
                .iter()
                .filter(|m| m.seq > cursor.persisted_seq)
                .count();
            if cursor.lines + fresh > stream.messages.len() {
                (true, stream.messages.iter().cloned().collect::<Vec<_>>())
            } else {
                let skip = stream.messages.len() - fresh;
                (false, stream.messages.iter().skip(skip).cloned().collect())
            }
        };

        if compact {
            debug!(stream = %name, retained = messages.len(), "Compacting stream file");
            write_stream_file(&file.path, &messages, &mut cursor).await
        } else if messages.is_empty() {
            Ok(())
        } else {
            append_stream_file(&file.path, &messages, &mut cursor).await
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_stream(config: &StreamConfig) -> SwitchyardResult<()> {
    let bad_name = config.name.is_empty()
        || config
            .name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'));
    if bad_name {
        return Err(SwitchyardError::Stream(format!(
            "invalid stream name: {:?}",
            config.name
        )));
    }
    if config.subjects.is_empty() || !config.subjects.iter().all(|s| is_valid(s)) {
        return Err(SwitchyardError::Stream(format!(
            "stream {} needs at least one valid subject",
            config.name
        )));
    }
    Ok(())
}

async fn load_stream_file(path: &Path) -> SwitchyardResult<VecDeque<StoredMessage>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !tokio::fs::try_exists(path).await? {
        return Ok(VecDeque::new());
    }

    let content = tokio::fs::read_to_string(path).await?;
    let mut messages: Vec<StoredMessage> = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(message) => messages.push(message),
            Err(e) => warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping corrupt stream record"),
        }
    }
    messages.sort_by_key(|m| m.seq);
    Ok(messages.into())
}

async fn write_stream_file(
    path: &Path,
    messages: &[StoredMessage],
    cursor: &mut FileCursor,
) -> SwitchyardResult<()> {
    let mut content = String::new();
    for message in messages {
        content.push_str(&serde_json::to_string(message)?);
        content.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    cursor.lines = messages.len();
    cursor.persisted_seq = messages.last().map_or(0, |m| m.seq);
    Ok(())
}

async fn append_stream_file(
    path: &Path,
    messages: &[StoredMessage],
    cursor: &mut FileCursor,
) -> SwitchyardResult<()> {
    let mut lines = String::new();
    for message in messages {
        lines.push_str(&serde_json::to_string(message)?);
        lines.push('\n');
    }
    let mut handle = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    handle.write_all(lines.as_bytes()).await?;
    handle.flush().await?;
    cursor.lines += messages.len();
    if let Some(last) = messages.last() {
        cursor.persisted_seq = last.seq;
    }
    Ok(())
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: &ConnectOptions) -> SwitchyardResult<()> {
        if !options.url.starts_with(URL_SCHEME) {
            return Err(SwitchyardError::Transport(format!(
                "unsupported transport url '{}', expected {URL_SCHEME}...",
                options.url
            )));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        info!(url = %options.url, name = %options.name, "Connected to in-process broker");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> SwitchyardResult<()> {
        self.ensure_connected()?;
        if !is_concrete(subject) {
            return Err(SwitchyardError::Transport(format!(
                "cannot publish to '{subject}'"
            )));
        }
        let delivered = self
            .inner
            .state
            .lock()
            .deliver(subject, &headers, &payload, false);
        debug!(subject = %subject, delivered, "Published");
        Ok(())
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> SwitchyardResult<u64> {
        self.ensure_connected()?;
        if !is_concrete(subject) {
            return Err(SwitchyardError::Transport(format!(
                "cannot publish to '{subject}'"
            )));
        }

        let now = Utc::now();
        let (seq, files) = {
            let mut state = self.inner.state.lock();
            let mut first_seq = None;
            let mut files = Vec::new();
            for stream in state.streams.values_mut().filter(|s| s.binds(subject)) {
                stream.last_seq += 1;
                let stored = StoredMessage {
                    seq: stream.last_seq,
                    subject: subject.to_string(),
                    headers: headers.clone(),
                    payload: payload.clone(),
                    stored_at: now,
                };
                if let Some(file) = &stream.file {
                    files.push((stream.config.name.clone(), file.clone()));
                }
                stream.messages.push_back(stored);
                stream.enforce_limits(now);
                first_seq.get_or_insert(stream.last_seq);
            }

            let Some(seq) = first_seq else {
                return Err(SwitchyardError::Stream(format!(
                    "no stream bound to subject '{subject}'"
                )));
            };
            let delivered = state.deliver(subject, &headers, &payload, true);
            debug!(subject = %subject, seq, delivered, "Published to stream");
            (seq, files)
        };

        for (name, file) in files {
            self.sync_stream_file(&name, &file).await.map_err(|e| {
                SwitchyardError::Stream(format!(
                    "failed to persist to {}: {e}",
                    file.path.display()
                ))
            })?;
        }
        Ok(seq)
    }

    async fn add_stream(&self, config: StreamConfig) -> SwitchyardResult<StreamInfo> {
        validate_stream(&config)?;
        if self.inner.state.lock().streams.contains_key(&config.name) {
            return Err(SwitchyardError::StreamExists(config.name));
        }

        let file = self.stream_file(&config);
        let messages = match &file {
            Some(file) => load_stream_file(&file.path).await?,
            None => VecDeque::new(),
        };
        let mut stream = StreamState {
            last_seq: messages.back().map_or(0, |m| m.seq),
            config,
            messages,
            file,
        };
        let restored = stream.messages.len();
        stream.enforce_limits(Utc::now());
        if let Some(file) = &stream.file {
            let retained: Vec<StoredMessage> = stream.messages.iter().cloned().collect();
            write_stream_file(&file.path, &retained, &mut *file.cursor.lock().await).await?;
        }

        let mut state = self.inner.state.lock();
        if state.streams.contains_key(&stream.config.name) {
            return Err(SwitchyardError::StreamExists(stream.config.name));
        }
        let info = stream.info();
        info!(
            stream = %info.config.name,
            storage = ?info.config.storage,
            restored,
            retained = info.messages,
            "Stream provisioned"
        );
        state.streams.insert(info.config.name.clone(), stream);
        Ok(info)
    }

    async fn stream_info(&self, name: &str) -> SwitchyardResult<StreamInfo> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(name)
            .map(StreamState::info)
            .ok_or_else(|| SwitchyardError::Stream(format!("stream not found: {name}")))
    }

    async fn subscribe(
        &self,
        subject: &str,
        priority: Priority,
    ) -> SwitchyardResult<TransportSubscription> {
        self.ensure_connected()?;
        if !is_valid(subject) {
            return Err(SwitchyardError::Subscription(format!(
                "invalid subject '{subject}'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.push(Subscriber {
                id,
                pattern: subject.to_string(),
                priority,
                sender,
            });
            id
        };

        let broker: Weak<Broker> = Arc::downgrade(&self.inner);
        Ok(TransportSubscription::new(subject, receiver, move || {
            if let Some(broker) = broker.upgrade() {
                broker.state.lock().subscribers.retain(|s| s.id != id);
            }
        }))
    }

    async fn drain(&self) -> SwitchyardResult<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        let closed = {
            let mut state = self.inner.state.lock();
            let closed = state.subscribers.len();
            state.subscribers.clear();
            closed
        };
        info!(subscriptions = closed, "In-process broker drained");
        Ok(())
    }
}
