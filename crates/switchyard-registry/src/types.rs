use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use switchyard_core::HealthState;

/// Category of work an agent performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    CodeAnalysis,
    TestGeneration,
    SecurityScanning,
    PerformanceAnalysis,
    Documentation,
    QualityAssessment,
    Deployment,
    Monitoring,
    Custom,
}

impl AgentType {
    /// Every agent type, in declaration order.
    pub const ALL: [AgentType; 9] = [
        AgentType::CodeAnalysis,
        AgentType::TestGeneration,
        AgentType::SecurityScanning,
        AgentType::PerformanceAnalysis,
        AgentType::Documentation,
        AgentType::QualityAssessment,
        AgentType::Deployment,
        AgentType::Monitoring,
        AgentType::Custom,
    ];

    /// Wire name of this type (`code_analysis`, `test_generation`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::CodeAnalysis => "code_analysis",
            AgentType::TestGeneration => "test_generation",
            AgentType::SecurityScanning => "security_scanning",
            AgentType::PerformanceAnalysis => "performance_analysis",
            AgentType::Documentation => "documentation",
            AgentType::QualityAssessment => "quality_assessment",
            AgentType::Deployment => "deployment",
            AgentType::Monitoring => "monitoring",
            AgentType::Custom => "custom",
        }
    }

    /// Parse a wire name. Returns `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Capability tags conventionally served by agents of this type.
    pub fn default_capabilities(&self) -> &'static [&'static str] {
        match self {
            AgentType::CodeAnalysis => &["code_analysis"],
            AgentType::TestGeneration => &["test_generation", "unit_tests", "integration_tests"],
            AgentType::SecurityScanning => {
                &["security_analysis", "vulnerability_scan", "static_analysis"]
            }
            AgentType::PerformanceAnalysis => {
                &["performance_analysis", "profiling", "optimization"]
            }
            AgentType::Documentation => &["documentation", "api_docs", "user_guides"],
            AgentType::QualityAssessment => {
                &["quality_metrics", "code_review", "standards_compliance"]
            }
            AgentType::Deployment => &["deployment", "ci_cd", "release_management"],
            AgentType::Monitoring => &["monitoring", "alerting", "health_checks"],
            AgentType::Custom => &["custom", "extension", "plugin"],
        }
    }
}

impl Default for AgentType {
    fn default() -> Self {
        AgentType::Custom
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a registered agent.
///
/// ```text
/// INITIALIZING -> RUNNING <-> {IDLE, BUSY} -> STOPPING -> STOPPED
///                    |  \
///                    |   MAINTENANCE (from RUNNING / IDLE)
///                    +-> ERROR (from any active state; left via start_agent)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Running,
    Idle,
    Busy,
    Error,
    Stopping,
    Stopped,
    Maintenance,
}

impl AgentStatus {
    /// Statuses in which an agent may receive new tasks.
    pub const HEALTHY: [AgentStatus; 3] = [AgentStatus::Running, AgentStatus::Idle, AgentStatus::Busy];

    /// Whether an agent in this status is eligible for task dispatch.
    pub fn is_healthy(&self) -> bool {
        Self::HEALTHY.contains(self)
    }

    /// Whether moving from `self` to `next` follows the lifecycle state machine.
    ///
    /// Re-applying the current status is always allowed.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Initializing => matches!(next, Running | Error | Stopping),
            Running => matches!(next, Idle | Busy | Maintenance | Stopping | Error),
            Idle => matches!(next, Running | Busy | Maintenance | Stopping | Error),
            Busy => matches!(next, Running | Idle | Stopping | Error),
            Maintenance => matches!(next, Running | Idle | Stopping | Error),
            Error => matches!(next, Running | Stopping | Stopped),
            Stopping => matches!(next, Stopped | Error),
            Stopped => matches!(next, Running),
        }
    }

    /// Wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Running => "running",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory resource-usage snapshot. Never enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
}

/// Authoritative record of one registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub agent_id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub requirements: HashMap<String, Value>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Mean wall-clock duration of successful executions, in seconds.
    pub average_execution_time: f64,
    pub last_execution_time: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub resource_usage: ResourceUsage,
}

impl AgentMetadata {
    /// Percentage of executions that succeeded (0 when nothing has run yet).
    pub fn success_rate(&self) -> f64 {
        (self.successful_executions as f64 / self.total_executions.max(1) as f64) * 100.0
    }

    /// Whether the agent advertises the given capability tag.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// JSON form including the derived `success_rate` field.
    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Value::Object(map) = &mut value {
            map.insert("success_rate".into(), Value::from(self.success_rate()));
        }
        value
    }
}

/// Result envelope returned by [`crate::AgentRegistry::execute_agent_task`].
///
/// Agent failures are reported here with `success: false`; they are never
/// raised to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub agent_id: String,
    pub task_type: String,
    /// Wall-clock duration of the attempt, in seconds.
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A committed status change, as delivered to status callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub agent_id: String,
    pub status: AgentStatus,
    pub metadata: Option<Map<String, Value>>,
}

/// Per-agent entry of a [`RegistryHealth`] report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub status: AgentStatus,
    pub last_execution: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub average_execution_time: f64,
}

/// Registry-wide health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHealth {
    pub status: HealthState,
    pub total_agents: usize,
    pub running_agents: usize,
    pub error_agents: usize,
    pub agent_details: BTreeMap<String, AgentHealth>,
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_agents: usize,
    pub status_distribution: BTreeMap<AgentStatus, usize>,
    pub type_distribution: BTreeMap<AgentType, usize>,
    /// Seconds since `start()`; `None` while the registry is not running.
    pub uptime_secs: Option<f64>,
    pub health_check_interval_secs: u64,
}
