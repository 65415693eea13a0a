use crate::agent::Agent;
use crate::config::RegistryConfig;
use crate::types::{
    AgentHealth, AgentMetadata, AgentStatus, AgentType, RegistryHealth, RegistryStatistics,
    ResourceUsage, StatusChange, TaskOutcome,
};
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchyard_core::{HealthState, SwitchyardError, SwitchyardResult};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Observer invoked synchronously after every committed status change.
pub type StatusCallback = Arc<dyn Fn(&StatusChange) -> SwitchyardResult<()> + Send + Sync>;

/// Handle returned by [`AgentRegistry::register_status_callback`].
pub type CallbackId = u64;

/// Metadata keys that extra-metadata merges may not overwrite.
const PROTECTED_KEYS: [&str; 2] = ["agent_id", "status"];

struct AgentEntry {
    metadata: AgentMetadata,
    instance: Arc<dyn Agent>,
    /// Registration order, used as the stable tie-break everywhere.
    seq: u64,
    /// Held for the duration of one `execute_task` call.
    exec_lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentEntry>,
    next_seq: u64,
}

impl RegistryState {
    fn ordered(&self) -> Vec<&AgentEntry> {
        let mut entries: Vec<&AgentEntry> = self.agents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}

#[derive(Default)]
struct CallbackTable {
    by_agent: HashMap<String, Vec<(CallbackId, StatusCallback)>>,
    next_id: CallbackId,
}

struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    callbacks: parking_lot::Mutex<CallbackTable>,
    /// Serializes commit + callback dispatch so observers see changes in commit order.
    status_gate: Mutex<()>,
    started_at: parking_lot::Mutex<Option<Instant>>,
    background: parking_lot::Mutex<Option<Background>>,
}

/// Owns the authoritative state of every registered agent.
///
/// All mutation goes through the registry's methods: status changes are
/// committed under a single write lock and announced to observers in commit
/// order, and task execution is serialized per agent. Cloning the registry
/// yields another handle to the same state.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Inner>,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        info!(
            health_check_interval_secs = config.health_check_interval_secs,
            "Agent registry initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(RegistryState::default()),
                callbacks: parking_lot::Mutex::new(CallbackTable::default()),
                status_gate: Mutex::new(()),
                started_at: parking_lot::Mutex::new(None),
                background: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Whether the background loops are running.
    pub fn is_running(&self) -> bool {
        self.inner.background.lock().is_some()
    }

    /// Start the health-check loop (and the stale sweep, when configured).
    pub async fn start(&self) {
        let mut background = self.inner.background.lock();
        if background.is_some() {
            warn!("Agent registry already started");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = vec![tokio::spawn(health_check_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.health_check_interval(),
            shutdown_rx.clone(),
        ))];
        if let Some(period) = self.inner.config.stale_sweep_interval() {
            handles.push(tokio::spawn(stale_sweep_loop(
                Arc::downgrade(&self.inner),
                period,
                self.inner.config.stale_threshold(),
                shutdown_rx,
            )));
        }

        *background = Some(Background { shutdown, handles });
        *self.inner.started_at.lock() = Some(Instant::now());
        info!("Agent registry started");
    }

    /// Stop the background loops, then stop every registered agent.
    ///
    /// Agents stay registered (in `STOPPED`) so their metadata remains readable.
    pub async fn stop(&self) {
        let background = self.inner.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for handle in background.handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Registry background task failed");
                    }
                }
            }
        }
        *self.inner.started_at.lock() = None;

        let ids = self.agent_ids().await;
        join_all(ids.iter().map(|id| self.stop_agent(id))).await;

        info!(agents = ids.len(), "Agent registry stopped");
    }

    /// Register an agent and return its freshly generated id.
    ///
    /// The agent's descriptor is read once here; the agent ends up `RUNNING`.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> String {
        let agent_id = Uuid::new_v4().to_string();
        let descriptor = agent.descriptor();
        let now = Utc::now();

        let metadata = AgentMetadata {
            name: descriptor
                .name
                .unwrap_or_else(|| format!("Agent-{}", &agent_id[..8])),
            agent_id: agent_id.clone(),
            agent_type: descriptor.agent_type,
            version: descriptor.version,
            description: descriptor.description,
            capabilities: descriptor.capabilities,
            requirements: descriptor.requirements,
            config: descriptor.config,
            status: AgentStatus::Initializing,
            created_at: now,
            updated_at: now,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            average_execution_time: 0.0,
            last_execution_time: None,
            resource_usage: ResourceUsage::default(),
        };
        let name = metadata.name.clone();
        let agent_type = metadata.agent_type;

        {
            let mut state = self.inner.state.write().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.agents.insert(
                agent_id.clone(),
                AgentEntry {
                    metadata,
                    instance: agent,
                    seq,
                    exec_lock: Arc::new(Mutex::new(())),
                },
            );
        }

        self.update_agent_status(&agent_id, AgentStatus::Running, None)
            .await;

        info!(agent_id = %agent_id, name = %name, agent_type = %agent_type, "Agent registered");
        agent_id
    }

    /// Stop and remove an agent. Returns `false` for unknown ids.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        if !self.contains(agent_id).await {
            warn!(agent_id = %agent_id, "Agent not found");
            return false;
        }

        self.stop_agent(agent_id).await;

        let removed = self.inner.state.write().await.agents.remove(agent_id);
        self.inner.callbacks.lock().by_agent.remove(agent_id);

        match removed {
            Some(entry) => {
                info!(agent_id = %agent_id, name = %entry.metadata.name, "Agent unregistered");
                true
            }
            None => false,
        }
    }

    /// Invoke the agent's `start` hook and move it to `RUNNING`.
    ///
    /// This is also the way out of `ERROR`.
    pub async fn start_agent(&self, agent_id: &str) -> bool {
        let Some(instance) = self.instance(agent_id).await else {
            warn!(agent_id = %agent_id, "Agent not found");
            return false;
        };

        match run_isolated(async move { instance.start().await }).await {
            Ok(()) => {
                self.update_agent_status(agent_id, AgentStatus::Running, None)
                    .await;
                info!(agent_id = %agent_id, "Agent started");
                true
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Failed to start agent");
                self.update_agent_status(agent_id, AgentStatus::Error, None)
                    .await;
                false
            }
        }
    }

    /// Move the agent through `STOPPING` to `STOPPED`, invoking its `stop` hook.
    pub async fn stop_agent(&self, agent_id: &str) -> bool {
        let Some(instance) = self.instance(agent_id).await else {
            warn!(agent_id = %agent_id, "Agent not found");
            return false;
        };

        self.update_agent_status(agent_id, AgentStatus::Stopping, None)
            .await;

        match run_isolated(async move { instance.stop().await }).await {
            Ok(()) => {
                self.update_agent_status(agent_id, AgentStatus::Stopped, None)
                    .await;
                info!(agent_id = %agent_id, "Agent stopped");
                true
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Failed to stop agent");
                self.update_agent_status(agent_id, AgentStatus::Error, None)
                    .await;
                false
            }
        }
    }

    /// Set an agent's status, merge optional extra metadata, and notify observers.
    ///
    /// Keys of `metadata` that name existing metadata fields are merged
    /// (except `agent_id` and `status`); other keys are ignored. Returns
    /// `false` for unknown ids.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        metadata: Option<Map<String, Value>>,
    ) -> bool {
        self.apply_status(agent_id, status, metadata, None).await
    }

    async fn apply_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        metadata: Option<Map<String, Value>>,
        only_if: Option<AgentStatus>,
    ) -> bool {
        let _gate = self.inner.status_gate.lock().await;

        {
            let mut state = self.inner.state.write().await;
            let Some(entry) = state.agents.get_mut(agent_id) else {
                warn!(agent_id = %agent_id, "Agent not found for status update");
                return false;
            };

            let previous = entry.metadata.status;
            if only_if.is_some_and(|expected| expected != previous) {
                return false;
            }
            if !previous.can_transition_to(status) {
                warn!(
                    agent_id = %agent_id,
                    from = %previous,
                    to = %status,
                    "Status change outside the agent lifecycle"
                );
            }

            if let Some(extra) = &metadata {
                merge_metadata(&mut entry.metadata, extra);
            }
            entry.metadata.status = status;
            entry.metadata.updated_at = Utc::now();
        }

        let change = StatusChange {
            agent_id: agent_id.to_string(),
            status,
            metadata,
        };
        self.notify(&change);

        debug!(agent_id = %agent_id, status = %status, "Agent status updated");
        true
    }

    fn notify(&self, change: &StatusChange) {
        let callbacks: Vec<StatusCallback> = self
            .inner
            .callbacks
            .lock()
            .by_agent
            .get(&change.agent_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(agent_id = %change.agent_id, error = %e, "Status callback failed");
                }
                Err(_) => {
                    error!(agent_id = %change.agent_id, "Status callback panicked");
                }
            }
        }
    }

    /// Observe status changes of one agent. Callbacks fire in registration order.
    pub fn register_status_callback<F>(&self, agent_id: &str, callback: F) -> CallbackId
    where
        F: Fn(&StatusChange) -> SwitchyardResult<()> + Send + Sync + 'static,
    {
        let mut table = self.inner.callbacks.lock();
        let id = table.next_id;
        table.next_id += 1;
        table
            .by_agent
            .entry(agent_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a status callback. Unknown ids are ignored.
    pub fn unregister_status_callback(&self, agent_id: &str, callback_id: CallbackId) {
        let mut table = self.inner.callbacks.lock();
        if let Some(list) = table.by_agent.get_mut(agent_id) {
            list.retain(|(id, _)| *id != callback_id);
        }
    }

    /// Run one task on one agent, recording the outcome in its counters.
    ///
    /// Fails only for unknown ids. Agent errors (and panics) come back as an
    /// outcome with `success: false`. Calls for the same agent run one at a
    /// time; the call makes exactly one attempt.
    ///
    /// Agents outside [`AgentStatus::HEALTHY`] are not run: the outcome is a
    /// refusal with `success: false`, and neither the status nor the counters
    /// change.
    pub async fn execute_agent_task(
        &self,
        agent_id: &str,
        task_type: &str,
        task_data: Value,
    ) -> SwitchyardResult<TaskOutcome> {
        let exec_lock = {
            let state = self.inner.state.read().await;
            let entry = state
                .agents
                .get(agent_id)
                .ok_or_else(|| SwitchyardError::AgentNotFound(agent_id.to_string()))?;
            Arc::clone(&entry.exec_lock)
        };
        let _running = exec_lock.lock().await;

        // Re-resolve: the agent may have been unregistered while we queued.
        let instance = self
            .instance(agent_id)
            .await
            .ok_or_else(|| SwitchyardError::AgentNotFound(agent_id.to_string()))?;
        let status = self
            .get_agent(agent_id)
            .await
            .map(|m| m.status)
            .ok_or_else(|| SwitchyardError::AgentNotFound(agent_id.to_string()))?;
        if !status.is_healthy() {
            warn!(agent_id = %agent_id, task_type = %task_type, status = %status, "Refusing task for unavailable agent");
            return Ok(TaskOutcome {
                success: false,
                agent_id: agent_id.to_string(),
                task_type: task_type.to_string(),
                execution_time: 0.0,
                result: None,
                error: Some(format!("agent {agent_id} is {status}, not accepting tasks")),
                timestamp: Utc::now(),
            });
        }

        self.update_agent_status(agent_id, AgentStatus::Busy, None)
            .await;

        let started = Instant::now();
        let owned_type = task_type.to_string();
        let result = run_isolated(async move { instance.execute_task(&owned_type, task_data).await })
            .await;
        let execution_time = started.elapsed().as_secs_f64();

        {
            let mut state = self.inner.state.write().await;
            if let Some(entry) = state.agents.get_mut(agent_id) {
                let meta = &mut entry.metadata;
                meta.total_executions += 1;
                if result.is_ok() {
                    meta.successful_executions += 1;
                    let n = meta.successful_executions as f64;
                    meta.average_execution_time =
                        (meta.average_execution_time * (n - 1.0) + execution_time) / n;
                    meta.last_execution_time = Some(Utc::now());
                } else {
                    meta.failed_executions += 1;
                }
            }
        }

        self.update_agent_status(agent_id, AgentStatus::Idle, None)
            .await;

        let outcome = match result {
            Ok(value) => {
                info!(agent_id = %agent_id, task_type = %task_type, execution_time, "Task executed");
                TaskOutcome {
                    success: true,
                    agent_id: agent_id.to_string(),
                    task_type: task_type.to_string(),
                    execution_time,
                    result: Some(value),
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                error!(agent_id = %agent_id, task_type = %task_type, error = %e, "Task execution failed");
                TaskOutcome {
                    success: false,
                    agent_id: agent_id.to_string(),
                    task_type: task_type.to_string(),
                    execution_time,
                    result: None,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
            }
        };
        Ok(outcome)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentMetadata> {
        let state = self.inner.state.read().await;
        state.agents.get(agent_id).map(|e| e.metadata.clone())
    }

    /// All agents in registration order, optionally filtered by type and status.
    pub async fn list_agents(
        &self,
        agent_type: Option<AgentType>,
        status: Option<AgentStatus>,
    ) -> Vec<AgentMetadata> {
        let state = self.inner.state.read().await;
        state
            .ordered()
            .into_iter()
            .map(|e| &e.metadata)
            .filter(|m| agent_type.map_or(true, |t| m.agent_type == t))
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect()
    }

    pub async fn find_agents_by_capability(&self, capability: &str) -> Vec<AgentMetadata> {
        let state = self.inner.state.read().await;
        state
            .ordered()
            .into_iter()
            .filter(|e| e.metadata.has_capability(capability))
            .map(|e| e.metadata.clone())
            .collect()
    }

    /// Agents in `RUNNING`, `IDLE` or `BUSY`, in registration order.
    pub async fn get_healthy_agents(&self, agent_type: Option<AgentType>) -> Vec<AgentMetadata> {
        let mut agents = self.list_agents(agent_type, None).await;
        agents.retain(|m| m.status.is_healthy());
        agents
    }

    /// Id of the least-loaded healthy agent of `agent_type`.
    ///
    /// Load is `(total_executions, average_execution_time)`; ties keep
    /// registration order.
    pub async fn get_load_balanced_agent(&self, agent_type: AgentType) -> Option<String> {
        let mut candidates = self.get_healthy_agents(Some(agent_type)).await;
        candidates.sort_by(|a, b| {
            a.total_executions
                .cmp(&b.total_executions)
                .then(a.average_execution_time.total_cmp(&b.average_execution_time))
        });
        candidates.into_iter().next().map(|m| m.agent_id)
    }

    /// Unregister every agent whose last execution is older than `threshold`.
    ///
    /// Agents that never executed a task are kept. Returns the removed ids.
    pub async fn cleanup_stale_agents(&self, threshold: Duration) -> Vec<String> {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return Vec::new();
        };
        let now = Utc::now();

        let stale: Vec<(String, String)> = {
            let state = self.inner.state.read().await;
            state
                .ordered()
                .into_iter()
                .filter(|e| {
                    e.metadata
                        .last_execution_time
                        .is_some_and(|last| now - last > threshold)
                })
                .map(|e| (e.metadata.agent_id.clone(), e.metadata.name.clone()))
                .collect()
        };

        let mut removed = Vec::with_capacity(stale.len());
        for (agent_id, name) in stale {
            info!(agent_id = %agent_id, name = %name, "Cleaning up stale agent");
            if self.unregister_agent(&agent_id).await {
                removed.push(agent_id);
            }
        }
        removed
    }

    /// Registry-wide health: degraded when any agent is in `ERROR`,
    /// unhealthy when none is in a healthy status.
    pub async fn health_check(&self) -> RegistryHealth {
        let state = self.inner.state.read().await;
        let mut report = RegistryHealth {
            status: HealthState::Healthy,
            total_agents: state.agents.len(),
            running_agents: 0,
            error_agents: 0,
            agent_details: BTreeMap::new(),
        };

        for entry in state.ordered() {
            let meta = &entry.metadata;
            report.agent_details.insert(
                meta.agent_id.clone(),
                AgentHealth {
                    status: meta.status,
                    last_execution: meta.last_execution_time,
                    success_rate: meta.success_rate(),
                    average_execution_time: meta.average_execution_time,
                },
            );
            if meta.status == AgentStatus::Error {
                report.error_agents += 1;
            } else if meta.status.is_healthy() {
                report.running_agents += 1;
            }
        }

        if report.error_agents > 0 {
            report.status = HealthState::Degraded;
        }
        if report.running_agents == 0 {
            report.status = HealthState::Unhealthy;
        }
        report
    }

    pub async fn get_registry_statistics(&self) -> RegistryStatistics {
        let state = self.inner.state.read().await;
        let mut status_distribution = BTreeMap::new();
        let mut type_distribution = BTreeMap::new();
        for entry in state.agents.values() {
            *status_distribution.entry(entry.metadata.status).or_insert(0) += 1;
            *type_distribution.entry(entry.metadata.agent_type).or_insert(0) += 1;
        }

        RegistryStatistics {
            total_agents: state.agents.len(),
            status_distribution,
            type_distribution,
            uptime_secs: self
                .inner
                .started_at
                .lock()
                .map(|t| t.elapsed().as_secs_f64()),
            health_check_interval_secs: self.inner.config.health_check_interval_secs,
        }
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.state.read().await.agents.len()
    }

    async fn contains(&self, agent_id: &str) -> bool {
        self.inner.state.read().await.agents.contains_key(agent_id)
    }

    async fn instance(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        let state = self.inner.state.read().await;
        state.agents.get(agent_id).map(|e| Arc::clone(&e.instance))
    }

    async fn agent_ids(&self) -> Vec<String> {
        let state = self.inner.state.read().await;
        state
            .ordered()
            .into_iter()
            .map(|e| e.metadata.agent_id.clone())
            .collect()
    }

    /// Probe every agent once; `RUNNING` agents that fail are flagged `ERROR`.
    pub async fn perform_health_checks(&self) {
        let targets: Vec<(String, Arc<dyn Agent>)> = {
            let state = self.inner.state.read().await;
            state
                .ordered()
                .into_iter()
                .map(|e| (e.metadata.agent_id.clone(), Arc::clone(&e.instance)))
                .collect()
        };
        let timeout = self.inner.config.health_check_timeout();

        let results = join_all(targets.into_iter().map(|(agent_id, instance)| async move {
            let mut probe = tokio::spawn(async move { instance.health_check().await });
            let healthy = match tokio::time::timeout(timeout, &mut probe).await {
                Ok(Ok(healthy)) => healthy,
                Ok(Err(e)) => {
                    error!(agent_id = %agent_id, error = %e, "Health check failed");
                    false
                }
                Err(_) => {
                    probe.abort();
                    warn!(agent_id = %agent_id, ?timeout, "Health check timed out");
                    false
                }
            };
            (agent_id, healthy)
        }))
        .await;

        for (agent_id, healthy) in results {
            if healthy {
                continue;
            }
            let demoted = self
                .apply_status(
                    &agent_id,
                    AgentStatus::Error,
                    None,
                    Some(AgentStatus::Running),
                )
                .await;
            if demoted {
                warn!(agent_id = %agent_id, "Agent failed health check, marked as error");
            }
        }
    }
}

/// Run an agent hook on its own task so a panic surfaces as an error.
async fn run_isolated<F, T>(hook: F) -> SwitchyardResult<T>
where
    F: Future<Output = SwitchyardResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(hook).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(SwitchyardError::Agent("agent panicked".to_string())),
        Err(e) => Err(SwitchyardError::Agent(format!("agent task aborted: {e}"))),
    }
}

fn merge_metadata(metadata: &mut AgentMetadata, extra: &Map<String, Value>) {
    let Ok(Value::Object(mut merged)) = serde_json::to_value(&*metadata) else {
        return;
    };

    for (key, value) in extra {
        if PROTECTED_KEYS.contains(&key.as_str()) || !merged.contains_key(key) {
            debug!(field = %key, "Ignoring extra metadata field");
            continue;
        }
        let mut candidate = merged.clone();
        candidate.insert(key.clone(), value.clone());
        match serde_json::from_value::<AgentMetadata>(Value::Object(candidate)) {
            Ok(_) => {
                merged.insert(key.clone(), value.clone());
            }
            Err(e) => warn!(field = %key, error = %e, "Skipping invalid metadata value"),
        }
    }

    match serde_json::from_value(Value::Object(merged)) {
        Ok(updated) => *metadata = updated,
        Err(e) => warn!(error = %e, "Failed to merge agent metadata"),
    }
}

async fn health_check_loop(
    registry: Weak<Inner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = registry.upgrade() else { break };
                AgentRegistry { inner }.perform_health_checks().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Health-check loop stopped");
}

async fn stale_sweep_loop(
    registry: Weak<Inner>,
    period: Duration,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = registry.upgrade() else { break };
                let removed = AgentRegistry { inner }.cleanup_stale_agents(threshold).await;
                if !removed.is_empty() {
                    info!(removed = removed.len(), "Stale agent sweep");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Stale sweep loop stopped");
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
