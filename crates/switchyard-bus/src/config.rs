use crate::memory::MemoryTransport;
use crate::nats::NatsTransport;
use crate::transport::{StorageType, StreamConfig, Transport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};

/// Bus settings, read from the `[bus]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Broker address: `nats://host:port` (or `tls://`) for a NATS server,
    /// `memory://...` for the in-process broker.
    #[serde(default = "default_url")]
    pub url: String,
    /// Connection name reported to the broker (suffixed with `-message-bus`).
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Provision streams and publish persistently.
    #[serde(default = "default_true")]
    pub persistence_enabled: bool,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds between sweeps of expired pending requests.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Timeout used by `request` when the caller passes none.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Directory for file-backed streams. Without it, file streams stay in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_url() -> String {
    "memory://local".to_string()
}

fn default_client_name() -> String {
    "switchyard".to_string()
}

fn default_true() -> bool {
    true
}

fn default_subject_prefix() -> String {
    "switchyard".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_wait() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            client_name: default_client_name(),
            persistence_enabled: true,
            subject_prefix: default_subject_prefix(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_wait_secs: default_reconnect_wait(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            request_timeout_secs: default_request_timeout(),
            data_dir: None,
        }
    }
}

impl BusConfig {
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Name of one of the bus streams, e.g. `SWITCHYARD_EVENTS`.
    ///
    /// Prefix characters that stream names cannot carry (`.`, wildcards,
    /// separators) become `_`.
    pub fn stream_name(&self, suffix: &str) -> String {
        let prefix: String = self
            .subject_prefix
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{prefix}_{suffix}")
    }

    /// The transport `url` points at.
    ///
    /// Fails with a config error for schemes no transport handles.
    pub fn transport(&self) -> SwitchyardResult<Arc<dyn Transport>> {
        if NatsTransport::handles(&self.url) {
            return Ok(Arc::new(NatsTransport::new(self.reconnect_wait())));
        }
        if self.url.starts_with("memory://") {
            let transport = match &self.data_dir {
                Some(dir) => MemoryTransport::with_data_dir(dir.clone()),
                None => MemoryTransport::new(),
            };
            return Ok(Arc::new(transport));
        }
        Err(SwitchyardError::Config(format!(
            "bus url '{}' has no supported scheme (nats://, tls://, memory://)",
            self.url
        )))
    }

    /// The streams provisioned at start when persistence is enabled.
    pub fn streams(&self) -> Vec<StreamConfig> {
        const HOUR: u64 = 3600;
        let bound = |category: &str| vec![format!("{}.{}.>", self.subject_prefix, category)];

        vec![
            StreamConfig::new(self.stream_name("EVENTS"), bound("events"))
                .with_storage(StorageType::File)
                .with_max_msgs(100_000)
                .with_max_age(Duration::from_secs(24 * HOUR)),
            StreamConfig::new(self.stream_name("TASKS"), bound("tasks"))
                .with_storage(StorageType::File)
                .with_max_msgs(50_000)
                .with_max_age(Duration::from_secs(12 * HOUR)),
            StreamConfig::new(self.stream_name("RESPONSES"), bound("responses"))
                .with_storage(StorageType::File)
                .with_max_msgs(100_000)
                .with_max_age(Duration::from_secs(6 * HOUR)),
            StreamConfig::new(self.stream_name("BROADCASTS"), bound("broadcasts"))
                .with_storage(StorageType::Memory)
                .with_max_msgs(1_000),
        ]
    }
}
