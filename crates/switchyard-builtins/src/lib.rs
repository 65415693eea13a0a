//! Built-in agents for the Switchyard host.
//!
//! One [`BuiltinAgent`] per stock agent type: code analysis, test generation,
//! security scanning, performance analysis and documentation.
//!
//! # Main entry points
//!
//! - [`register_builtins()`] registers the agents enabled in a [`BuiltinsConfig`].

/// The built-in agent implementation.
pub mod agent;

pub use agent::BuiltinAgent;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchyard_registry::{AgentRegistry, AgentType};
use tracing::info;

/// Which built-in agents to register, read from the `[builtins]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinsConfig {
    #[serde(default = "default_true")]
    pub code_analysis: bool,
    #[serde(default = "default_true")]
    pub test_generation: bool,
    #[serde(default = "default_true")]
    pub security_scanning: bool,
    #[serde(default = "default_true")]
    pub performance_analysis: bool,
    #[serde(default = "default_true")]
    pub documentation: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BuiltinsConfig {
    fn default() -> Self {
        Self {
            code_analysis: true,
            test_generation: true,
            security_scanning: true,
            performance_analysis: true,
            documentation: true,
        }
    }
}

impl BuiltinsConfig {
    /// Enabled agent types, in registration order.
    pub fn enabled_types(&self) -> Vec<AgentType> {
        [
            (AgentType::CodeAnalysis, self.code_analysis),
            (AgentType::TestGeneration, self.test_generation),
            (AgentType::SecurityScanning, self.security_scanning),
            (AgentType::PerformanceAnalysis, self.performance_analysis),
            (AgentType::Documentation, self.documentation),
        ]
        .into_iter()
        .filter_map(|(agent_type, enabled)| enabled.then_some(agent_type))
        .collect()
    }
}

/// Register the enabled built-in agents and return their ids.
pub async fn register_builtins(registry: &AgentRegistry, config: &BuiltinsConfig) -> Vec<String> {
    let mut ids = Vec::new();
    for agent_type in config.enabled_types() {
        let id = registry
            .register_agent(Arc::new(BuiltinAgent::new(agent_type)))
            .await;
        ids.push(id);
    }
    info!(count = ids.len(), "Registered built-in agents");
    ids
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_all_enabled_by_default() {
        let config: BuiltinsConfig = toml::from_str("").unwrap();
        assert_eq!(config.enabled_types().len(), 5);
    }

    #[test]
    fn test_disabled_types_skipped() {
        let config: BuiltinsConfig = toml::from_str(
            r#"
            security_scanning = false
            documentation = false
            "#,
        )
        .unwrap();
        assert_eq!(
            config.enabled_types(),
            vec![
                AgentType::CodeAnalysis,
                AgentType::TestGeneration,
                AgentType::PerformanceAnalysis
            ]
        );
    }
}
