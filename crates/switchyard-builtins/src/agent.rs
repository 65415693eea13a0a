use async_trait::async_trait;
use serde_json::{json, Value};
use switchyard_core::{SwitchyardError, SwitchyardResult};
use switchyard_registry::{Agent, AgentDescriptor, AgentType};
use tracing::debug;

/// A built-in agent for one of the stock agent types.
///
/// It accepts the task types listed in its type's default capabilities and
/// acknowledges them; the analysis itself is left to real agents.
pub struct BuiltinAgent {
    descriptor: AgentDescriptor,
}

impl BuiltinAgent {
    pub fn new(agent_type: AgentType) -> Self {
        let (name, description) = match agent_type {
            AgentType::CodeAnalysis => (
                "Code Analysis Agent",
                "Inspects source code structure and complexity",
            ),
            AgentType::TestGeneration => (
                "Test Generation Agent",
                "Generates unit and integration test suites",
            ),
            AgentType::SecurityScanning => (
                "Security Scanning Agent",
                "Scans code and dependencies for vulnerabilities",
            ),
            AgentType::PerformanceAnalysis => (
                "Performance Analysis Agent",
                "Profiles code paths and suggests optimizations",
            ),
            AgentType::Documentation => (
                "Documentation Agent",
                "Produces API documentation and user guides",
            ),
            other => ("Built-in Agent", other.as_str()),
        };

        Self {
            descriptor: AgentDescriptor::new(name, agent_type)
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_description(description)
                .with_capabilities(agent_type.default_capabilities().iter().copied())
                .with_config("builtin", Value::Bool(true)),
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.descriptor.agent_type
    }

    /// Whether `task_type` is one of this agent's capabilities.
    pub fn accepts(&self, task_type: &str) -> bool {
        self.descriptor.capabilities.iter().any(|c| c == task_type)
    }
}

#[async_trait]
impl Agent for BuiltinAgent {
    fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    async fn execute_task(&self, task_type: &str, data: Value) -> SwitchyardResult<Value> {
        if !self.accepts(task_type) {
            return Err(SwitchyardError::NotImplemented(format!(
                "{} agent does not handle task type '{task_type}'",
                self.agent_type()
            )));
        }

        let received_keys: Vec<&String> = match &data {
            Value::Object(map) => map.keys().collect(),
            _ => Vec::new(),
        };
        debug!(
            agent_type = %self.agent_type(),
            task_type = %task_type,
            keys = received_keys.len(),
            "Built-in agent acknowledged task"
        );

        Ok(json!({
            "status": "completed",
            "agent": self.descriptor.name,
            "task_type": task_type,
            "received_keys": received_keys,
        }))
    }
}
