use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry settings, read from the `[registry]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds between health-check sweeps.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// A health check slower than this counts as failed.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    /// Idle time after which `cleanup_stale_agents` removes an agent.
    #[serde(default = "default_stale_threshold")]
    pub stale_agent_threshold_secs: u64,
    /// Seconds between automatic stale sweeps; 0 disables the sweep.
    #[serde(default)]
    pub stale_sweep_interval_secs: u64,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    10
}

fn default_stale_threshold() -> u64 {
    3600
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            stale_agent_threshold_secs: default_stale_threshold(),
            stale_sweep_interval_secs: 0,
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs.max(1))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_agent_threshold_secs)
    }

    /// `None` when the automatic stale sweep is disabled.
    pub fn stale_sweep_interval(&self) -> Option<Duration> {
        (self.stale_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.stale_sweep_interval_secs))
    }
}
