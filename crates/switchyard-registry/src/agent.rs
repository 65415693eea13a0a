use crate::types::AgentType;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use switchyard_core::SwitchyardResult;

/// Self-description an agent hands to the registry at registration time.
///
/// Every field is optional in spirit: [`AgentDescriptor::default`] yields the
/// fallbacks the registry uses for agents that say nothing about themselves.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    /// Display name. `None` falls back to `Agent-{first 8 chars of id}`.
    pub name: Option<String>,
    pub agent_type: AgentType,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub requirements: HashMap<String, Value>,
    pub config: HashMap<String, Value>,
}

impl Default for AgentDescriptor {
    fn default() -> Self {
        Self {
            name: None,
            agent_type: AgentType::Custom,
            version: "1.0.0".to_string(),
            description: "Unspecified agent".to_string(),
            capabilities: Vec::new(),
            requirements: HashMap::new(),
            config: HashMap::new(),
        }
    }
}

impl AgentDescriptor {
    /// Descriptor with a name and type; everything else defaulted.
    pub fn new(name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            name: Some(name.into()),
            agent_type,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// A pluggable unit of work execution managed by the [`crate::AgentRegistry`].
///
/// Only [`Agent::execute_task`] is required. The lifecycle hooks default to
/// no-ops and the health check defaults to "healthy", so an agent without
/// them registers and runs like one that implements them trivially.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Self-description, read once at registration.
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::default()
    }

    /// Called by `start_agent`.
    async fn start(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Called by `stop_agent` and on unregistration.
    async fn stop(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Run one task. Errors are recorded as failed executions.
    async fn execute_task(&self, task_type: &str, data: Value) -> SwitchyardResult<Value>;

    /// Liveness probe polled by the registry's health loop.
    async fn health_check(&self) -> bool {
        true
    }
}
