//! Routes tasks from the bus to registered agents and publishes their results.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use switchyard_bus::{MessageBus, MessageContent, MessageHandler, MessageType, SubjectCategory, SubscribeOptions};
use switchyard_core::SwitchyardResult;
use switchyard_registry::{AgentRegistry, AgentType};
use tracing::{debug, error, info, warn};

const BRIDGE_SENDER: &str = "task-bridge";

/// Consumes `{prefix}.tasks.>` with manual acknowledgement.
///
/// An agent that disappears between selection and execution fails the
/// delivery, so the broker redelivers and the task is routed again.
#[derive(Clone)]
pub struct TaskBridge {
    registry: AgentRegistry,
    bus: MessageBus,
}

impl TaskBridge {
    pub fn new(registry: AgentRegistry, bus: MessageBus) -> Self {
        Self { registry, bus }
    }

    /// Subscribe to the task subjects. Returns the subscription id.
    pub async fn start(&self) -> SwitchyardResult<String> {
        let pattern = self.bus.subjects().pattern(SubjectCategory::Tasks);
        let id = self
            .bus
            .subscribe(
                &pattern,
                Arc::new(self.clone()),
                SubscribeOptions::default().manual_ack(),
            )
            .await?;
        info!(subject = %pattern, subscription_id = %id, "Task bridge started");
        Ok(id)
    }

    /// The least-loaded agent for a task: of the requested type when the task
    /// names one, otherwise of the type of the first healthy agent advertising
    /// `task_type` as a capability.
    async fn select_agent(&self, message: &MessageContent, task_type: &str) -> Option<String> {
        let agent_type = match message.payload.get("agent_type").and_then(Value::as_str) {
            Some(name) => {
                let parsed = AgentType::parse(name);
                if parsed.is_none() {
                    warn!(agent_type = %name, "Task targets unknown agent type");
                }
                parsed?
            }
            None => {
                self.registry
                    .get_healthy_agents(None)
                    .await
                    .into_iter()
                    .find(|agent| agent.has_capability(task_type))?
                    .agent_type
            }
        };
        self.registry.get_load_balanced_agent(agent_type).await
    }

    async fn publish_result(&self, task_id: &str, result: Value) {
        if !self
            .bus
            .send_task_result(task_id, result, Some(BRIDGE_SENDER))
            .await
        {
            error!(task_id = %task_id, "Failed to publish task result");
        }
    }
}

#[async_trait]
impl MessageHandler for TaskBridge {
    async fn handle(&self, message: MessageContent) -> SwitchyardResult<()> {
        if message.message_type != MessageType::Task {
            debug!(message_id = %message.message_id, message_type = %message.message_type, "Ignoring non-task message");
            return Ok(());
        }

        let task_type = message.subject.clone();
        let task_id = message
            .payload
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| message.correlation_id.clone())
            .unwrap_or_else(|| message.message_id.clone());
        let data = message
            .payload
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(message.payload.clone()));

        let Some(agent_id) = self.select_agent(&message, &task_type).await else {
            warn!(task_id = %task_id, task_type = %task_type, "No eligible agent for task");
            self.publish_result(
                &task_id,
                json!({
                    "success": false,
                    "task_id": task_id,
                    "task_type": task_type,
                    "error": format!("no eligible agent for task type '{task_type}'"),
                }),
            )
            .await;
            return Ok(());
        };

        let outcome = self
            .registry
            .execute_agent_task(&agent_id, &task_type, data)
            .await?;
        let mut result = serde_json::to_value(&outcome)?;
        if let Value::Object(map) = &mut result {
            map.insert("task_id".into(), Value::from(task_id.as_str()));
        }
        self.publish_result(&task_id, result).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_builtins::{register_builtins, BuiltinAgent, BuiltinsConfig};
    use switchyard_bus::{handler_fn, BusConfig, MemoryTransport, Priority};
    use switchyard_registry::RegistryConfig;
    use tokio::sync::mpsc;

    struct Harness {
        registry: AgentRegistry,
        bus: MessageBus,
        results: mpsc::UnboundedReceiver<MessageContent>,
    }

    impl Harness {
        async fn new(builtins: BuiltinsConfig) -> Self {
            let registry = AgentRegistry::new(RegistryConfig::default());
            let bus = MessageBus::with_transport(
                BusConfig::default(),
                Arc::new(MemoryTransport::new()),
            );
            bus.start().await.unwrap();
            for id in register_builtins(&registry, &builtins).await {
                assert!(registry.start_agent(&id).await);
            }
            TaskBridge::new(registry.clone(), bus.clone())
                .start()
                .await
                .unwrap();

            let (tx, results) = mpsc::unbounded_channel();
            bus.subscribe(
                "switchyard.responses.>",
                handler_fn(move |message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        Ok(())
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

            Self {
                registry,
                bus,
                results,
            }
        }

        async fn next_result(&mut self) -> MessageContent {
            tokio::time::timeout(Duration::from_secs(5), self.results.recv())
                .await
                .expect("no result within 5s")
                .expect("results channel closed")
        }
    }

    #[tokio::test]
    async fn test_targeted_task_runs_on_agent_type() {
        let mut harness = Harness::new(BuiltinsConfig::default()).await;

        let task_id = harness
            .bus
            .distribute_task(
                "vulnerability_scan",
                json!({"path": "crates"}),
                Some("security_scanning"),
                Priority::High,
            )
            .await;

        let result = harness.next_result().await;
        assert_eq!(result.message_type, MessageType::Result);
        assert_eq!(result.correlation_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(result.sender_id.as_deref(), Some(BRIDGE_SENDER));
        assert_eq!(result.payload["success"], true);
        assert_eq!(result.payload["task_id"], task_id.as_str());
        assert_eq!(result.payload["result"]["received_keys"], json!(["path"]));

        let agent_id = result.payload["agent_id"].as_str().unwrap();
        let agent = harness.registry.get_agent(agent_id).await.unwrap();
        assert_eq!(agent.agent_type, AgentType::SecurityScanning);
        assert_eq!(agent.successful_executions, 1);
        harness.bus.stop().await;
    }

    #[tokio::test]
    async fn test_untargeted_task_matches_capability() {
        let mut harness = Harness::new(BuiltinsConfig::default()).await;

        harness
            .bus
            .distribute_task("api_docs", json!({}), None, Priority::Normal)
            .await;

        let result = harness.next_result().await;
        assert_eq!(result.payload["success"], true);
        let agent_id = result.payload["agent_id"].as_str().unwrap();
        let agent = harness.registry.get_agent(agent_id).await.unwrap();
        assert_eq!(agent.agent_type, AgentType::Documentation);
        harness.bus.stop().await;
    }

    #[tokio::test]
    async fn test_no_eligible_agent_publishes_failure() {
        let mut harness = Harness::new(BuiltinsConfig::default()).await;

        let task_id = harness
            .bus
            .distribute_task("release_management", json!({}), None, Priority::Normal)
            .await;

        let result = harness.next_result().await;
        assert_eq!(result.correlation_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(result.payload["success"], false);
        assert!(result.payload["error"]
            .as_str()
            .unwrap()
            .contains("release_management"));
        harness.bus.stop().await;
    }

    #[tokio::test]
    async fn test_agent_failure_reported_in_result() {
        let mut harness = Harness::new(BuiltinsConfig::default()).await;

        // The code analysis agent does not handle this task type.
        harness
            .bus
            .distribute_task("profiling", json!({}), Some("code_analysis"), Priority::Normal)
            .await;

        let result = harness.next_result().await;
        assert_eq!(result.payload["success"], false);
        assert!(result.payload["error"].as_str().unwrap().contains("profiling"));
        harness.bus.stop().await;
    }

    #[tokio::test]
    async fn test_tasks_spread_across_agents_of_one_type() {
        let mut harness = Harness::new(BuiltinsConfig {
            test_generation: false,
            security_scanning: false,
            performance_analysis: false,
            documentation: false,
            ..BuiltinsConfig::default()
        })
        .await;
        let second = harness
            .registry
            .register_agent(Arc::new(BuiltinAgent::new(AgentType::CodeAnalysis)))
            .await;
        assert!(harness.registry.start_agent(&second).await);

        let mut agents = Vec::new();
        for _ in 0..2 {
            harness
                .bus
                .distribute_task("code_analysis", json!({}), Some("code_analysis"), Priority::Normal)
                .await;
            let result = harness.next_result().await;
            agents.push(result.payload["agent_id"].as_str().unwrap().to_string());
        }
        assert_ne!(agents[0], agents[1]);
        harness.bus.stop().await;
    }
}
