//! Registry behavior under realistic agent workloads.
//!
//! Timing-sensitive tests run on a paused tokio clock so execution times and
//! health-check cadence are exact.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use switchyard_registry::*;

/// Sleeps for a fixed duration, then succeeds or fails as configured.
struct TimedAgent {
    agent_type: AgentType,
    delay: Duration,
    fail: bool,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TimedAgent {
    fn new(agent_type: AgentType, delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            agent_type,
            delay,
            fail,
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Agent for TimedAgent {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("timed", self.agent_type)
            .with_capabilities(self.agent_type.default_capabilities().iter().copied())
    }

    async fn execute_task(&self, task_type: &str, _data: Value) -> SwitchyardResult<Value> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            Err(SwitchyardError::Agent(format!("{task_type} exploded")))
        } else {
            Ok(json!({ "done": task_type }))
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct PanickingAgent;

#[async_trait]
impl Agent for PanickingAgent {
    async fn execute_task(&self, _task_type: &str, _data: Value) -> SwitchyardResult<Value> {
        panic!("agent bug");
    }
}

/// Health probe never answers.
struct HangingAgent;

#[async_trait]
impl Agent for HangingAgent {
    async fn execute_task(&self, _task_type: &str, _data: Value) -> SwitchyardResult<Value> {
        Ok(Value::Null)
    }

    async fn health_check(&self) -> bool {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        true
    }
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

#[tokio::test]
async fn test_registration_yields_fresh_ids() {
    let registry = AgentRegistry::default();
    let mut ids = HashSet::new();
    for _ in 0..50 {
        let agent = TimedAgent::new(AgentType::Custom, Duration::ZERO, false);
        let id = registry.register_agent(agent).await;
        assert!(ids.insert(id.clone()), "duplicate id {id}");
        assert_eq!(
            registry.get_agent(&id).await.unwrap().status,
            AgentStatus::Running
        );
    }
}

#[tokio::test]
async fn test_callbacks_observe_statuses_in_commit_order() {
    let registry = AgentRegistry::default();
    let id = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    registry.register_status_callback(&id, move |change| {
        assert_eq!(change.agent_id.len(), 36);
        sink.lock().unwrap().push(change.status);
        Ok(())
    });

    let applied = [
        AgentStatus::Idle,
        AgentStatus::Busy,
        AgentStatus::Idle,
        AgentStatus::Maintenance,
        AgentStatus::Running,
        AgentStatus::Stopping,
        AgentStatus::Stopped,
    ];
    for status in applied {
        assert!(registry.update_agent_status(&id, status, None).await);
    }

    assert_eq!(*seen.lock().unwrap(), applied.to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_average_matches_constant_execution_time() {
    let registry = AgentRegistry::default();
    let id = registry
        .register_agent(TimedAgent::new(
            AgentType::CodeAnalysis,
            Duration::from_millis(250),
            false,
        ))
        .await;

    for _ in 0..4 {
        let outcome = registry
            .execute_agent_task(&id, "code_analysis", json!({}))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!((outcome.execution_time - 0.25).abs() < 1e-3);
    }

    let meta = registry.get_agent(&id).await.unwrap();
    assert_eq!(meta.total_executions, 4);
    assert_eq!(meta.successful_executions, 4);
    assert!((meta.average_execution_time - 0.25).abs() < 1e-3);
    assert_eq!(meta.status, AgentStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_failures_leave_average_untouched() {
    let registry = AgentRegistry::default();
    let id = registry
        .register_agent(TimedAgent::new(
            AgentType::Custom,
            Duration::from_millis(100),
            true,
        ))
        .await;
    registry
        .update_agent_status(
            &id,
            AgentStatus::Running,
            Some(fields(json!({ "average_execution_time": 2.5 }))),
        )
        .await;

    for _ in 0..3 {
        let outcome = registry
            .execute_agent_task(&id, "custom", Value::Null)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("exploded"));
    }

    let meta = registry.get_agent(&id).await.unwrap();
    assert_eq!(meta.failed_executions, 3);
    assert_eq!(meta.total_executions, 3);
    assert_eq!(meta.average_execution_time, 2.5);
    assert_eq!(meta.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_panicking_agent_is_contained() {
    let registry = AgentRegistry::default();
    let id = registry.register_agent(Arc::new(PanickingAgent)).await;

    let outcome = registry
        .execute_agent_task(&id, "custom", Value::Null)
        .await
        .unwrap();
    assert!(!outcome.success);

    let meta = registry.get_agent(&id).await.unwrap();
    assert_eq!(meta.failed_executions, 1);
    assert_eq!(meta.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_load_balancing_picks_least_loaded() {
    let registry = AgentRegistry::default();
    let mut ids = Vec::new();
    for (total, avg) in [(5, 1.2), (2, 3.0), (2, 1.0)] {
        let id = registry
            .register_agent(TimedAgent::new(AgentType::Documentation, Duration::ZERO, false))
            .await;
        registry
            .update_agent_status(
                &id,
                AgentStatus::Idle,
                Some(fields(json!({
                    "total_executions": total,
                    "average_execution_time": avg,
                }))),
            )
            .await;
        ids.push(id);
    }

    assert_eq!(
        registry
            .get_load_balanced_agent(AgentType::Documentation)
            .await,
        Some(ids[2].clone())
    );
    assert_eq!(
        registry.get_load_balanced_agent(AgentType::Deployment).await,
        None
    );
}

#[tokio::test]
async fn test_load_balancing_ties_keep_registration_order() {
    let registry = AgentRegistry::default();
    let first = registry
        .register_agent(TimedAgent::new(AgentType::Monitoring, Duration::ZERO, false))
        .await;
    registry
        .register_agent(TimedAgent::new(AgentType::Monitoring, Duration::ZERO, false))
        .await;

    assert_eq!(
        registry.get_load_balanced_agent(AgentType::Monitoring).await,
        Some(first.clone())
    );

    registry
        .update_agent_status(&first, AgentStatus::Error, None)
        .await;
    let picked = registry
        .get_load_balanced_agent(AgentType::Monitoring)
        .await
        .unwrap();
    assert_ne!(picked, first);
}

#[tokio::test]
async fn test_cleanup_removes_only_stale_agents() {
    let registry = AgentRegistry::default();
    let now = chrono::Utc::now();

    let stale = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;
    let fresh = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;
    let never_ran = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;

    let two_hours_ago = (now - chrono::Duration::hours(2)).to_rfc3339();
    let ten_minutes_ago = (now - chrono::Duration::minutes(10)).to_rfc3339();
    registry
        .update_agent_status(
            &stale,
            AgentStatus::Idle,
            Some(fields(json!({ "last_execution_time": two_hours_ago }))),
        )
        .await;
    registry
        .update_agent_status(
            &fresh,
            AgentStatus::Idle,
            Some(fields(json!({ "last_execution_time": ten_minutes_ago }))),
        )
        .await;

    let removed = registry
        .cleanup_stale_agents(Duration::from_secs(3600))
        .await;

    assert_eq!(removed, vec![stale.clone()]);
    assert!(registry.get_agent(&stale).await.is_none());
    assert!(registry.get_agent(&fresh).await.is_some());
    assert!(registry.get_agent(&never_ran).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_executions_on_one_agent_are_serialized() {
    let registry = AgentRegistry::default();
    let agent = TimedAgent::new(AgentType::Custom, Duration::from_millis(100), false);
    let id = registry.register_agent(agent.clone()).await;

    let runs: Vec<_> = (0..3)
        .map(|i| {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .execute_agent_task(&id, "custom", json!({ "run": i }))
                    .await
            })
        })
        .collect();
    for run in runs {
        assert!(run.await.unwrap().unwrap().success);
    }

    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        registry.get_agent(&id).await.unwrap().total_executions,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_health_loop_flags_unhealthy_running_agent() {
    let registry = AgentRegistry::new(RegistryConfig {
        health_check_interval_secs: 1,
        ..RegistryConfig::default()
    });
    let sick = TimedAgent::new(AgentType::Custom, Duration::ZERO, false);
    let well = TimedAgent::new(AgentType::Custom, Duration::ZERO, false);
    let sick_id = registry.register_agent(sick.clone()).await;
    let well_id = registry.register_agent(well).await;

    registry.start().await;
    assert!(registry.is_running());
    sick.healthy.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(
        registry.get_agent(&sick_id).await.unwrap().status,
        AgentStatus::Error
    );
    assert_eq!(
        registry.get_agent(&well_id).await.unwrap().status,
        AgentStatus::Running
    );

    // Recovery is explicit.
    sick.healthy.store(true, Ordering::SeqCst);
    assert!(registry.start_agent(&sick_id).await);
    assert_eq!(
        registry.get_agent(&sick_id).await.unwrap().status,
        AgentStatus::Running
    );

    registry.stop().await;
    assert!(!registry.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_health_check_times_out() {
    let registry = AgentRegistry::new(RegistryConfig {
        health_check_timeout_secs: 2,
        ..RegistryConfig::default()
    });
    let id = registry.register_agent(Arc::new(HangingAgent)).await;

    registry.perform_health_checks().await;

    assert_eq!(
        registry.get_agent(&id).await.unwrap().status,
        AgentStatus::Error
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_leaves_agents_stopped_and_readable() {
    let registry = AgentRegistry::default();
    let id = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;

    registry.start().await;
    let stats = registry.get_registry_statistics().await;
    assert!(stats.uptime_secs.is_some());

    registry.stop().await;
    assert_eq!(
        registry.get_agent(&id).await.unwrap().status,
        AgentStatus::Stopped
    );
    assert!(registry.get_agent(&id).await.is_some());
    assert_eq!(
        registry.health_check().await.status,
        switchyard_core::HealthState::Unhealthy
    );
}

#[tokio::test(start_paused = true)]
async fn test_stopped_agent_refuses_tasks() {
    let registry = AgentRegistry::default();
    let agent = TimedAgent::new(AgentType::Custom, Duration::from_millis(10), false);
    let id = registry.register_agent(agent.clone()).await;
    assert!(registry.stop_agent(&id).await);

    let outcome = registry
        .execute_agent_task(&id, "custom", Value::Null)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("stopped"));
    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 0);

    let meta = registry.get_agent(&id).await.unwrap();
    assert_eq!(meta.status, AgentStatus::Stopped);
    assert_eq!(meta.total_executions, 0);
    assert!(registry.get_load_balanced_agent(AgentType::Custom).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_errored_agent_stays_errored_until_restarted() {
    let registry = AgentRegistry::default();
    let id = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;
    registry
        .update_agent_status(&id, AgentStatus::Error, None)
        .await;

    let outcome = registry
        .execute_agent_task(&id, "custom", Value::Null)
        .await
        .unwrap();
    assert!(!outcome.success);
    let meta = registry.get_agent(&id).await.unwrap();
    assert_eq!(meta.status, AgentStatus::Error);
    assert_eq!(meta.total_executions, 0);

    assert!(registry.start_agent(&id).await);
    let outcome = registry
        .execute_agent_task(&id, "custom", Value::Null)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(
        registry.get_agent(&id).await.unwrap().status,
        AgentStatus::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_sweep_runs_when_configured() {
    let registry = AgentRegistry::new(RegistryConfig {
        stale_sweep_interval_secs: 60,
        stale_agent_threshold_secs: 3600,
        ..RegistryConfig::default()
    });
    let id = registry
        .register_agent(TimedAgent::new(AgentType::Custom, Duration::ZERO, false))
        .await;
    let long_ago = (chrono::Utc::now() - chrono::Duration::hours(3)).to_rfc3339();
    registry
        .update_agent_status(
            &id,
            AgentStatus::Idle,
            Some(fields(json!({ "last_execution_time": long_ago }))),
        )
        .await;

    registry.start().await;
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(registry.get_agent(&id).await.is_none());
    registry.stop().await;
}
