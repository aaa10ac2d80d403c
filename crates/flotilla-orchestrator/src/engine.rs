use crate::health::{HealthMonitor, HealthProbe};
use crate::lifecycle::{AgentHost, LifecycleManager};
use crate::queue::TaskQueue;
use crate::registry::{PoolRegistry, PoolSnapshot};
use crate::scaler::AutoScaler;
use crate::scheduler::Scheduler;
use crate::strategy::{strategy_for, SelectionStrategy, ThresholdPolicy};
use crate::types::{AgentRecord, HealthCheckResult, Task};
use flotilla_core::config::OrchestratorConfig;
use flotilla_core::events::{EventBus, OrchestratorEvent};
use flotilla_core::{FlotillaError, FlotillaResult};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// The agent-pool control plane.
///
/// Wires the registry, scheduler, health monitor, auto-scaler, and
/// lifecycle manager from a validated configuration, brings every pool up
/// to its floor, and exposes the task ingress/egress surface.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<RwLock<PoolRegistry>>,
    queue: Arc<RwLock<TaskQueue>>,
    events: EventBus,
    scheduler: Scheduler,
    monitor: HealthMonitor,
    scaler: AutoScaler,
    lifecycle: LifecycleManager,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator from a validated config.
    ///
    /// Registers every configured pool, then spawns agents up to each
    /// pool's `min_agents` floor through the given host. Configuration
    /// problems are rejected here, before any side effect.
    pub async fn new(
        config: OrchestratorConfig,
        host: Arc<dyn AgentHost>,
        probe: Arc<dyn HealthProbe>,
    ) -> FlotillaResult<Self> {
        config.validate()?;

        let registry = Arc::new(RwLock::new(PoolRegistry::new()));
        {
            let mut reg = registry.write().await;
            for pool in &config.pools {
                reg.register_pool(
                    &pool.name,
                    pool.capabilities.iter().cloned().collect(),
                    pool.min_agents,
                    pool.max_agents,
                )?;
            }
        }
        let queue = Arc::new(RwLock::new(TaskQueue::new()));
        let events = EventBus::default();

        let lifecycle = LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            events.clone(),
            host,
            config.drain_timeout(),
        );
        let strategy: Arc<dyn SelectionStrategy> = Arc::from(strategy_for(config.strategy));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            events.clone(),
            strategy,
            lifecycle.clone(),
            config.max_tasks_per_agent,
            config.cancel_ack_timeout(),
        );
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            events.clone(),
            scheduler.clone(),
            probe,
            config.health.clone(),
        );
        let policy = Arc::new(ThresholdPolicy {
            scale_up_queue_threshold: config.scaling.scale_up_queue_threshold,
            scale_down_idle_threshold: config.scaling.scale_down_idle_threshold,
        });
        let scaler = AutoScaler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            events.clone(),
            scheduler.clone(),
            lifecycle.clone(),
            policy,
            config.scaling.clone(),
        );

        let orchestrator = Self {
            config,
            registry,
            queue,
            events,
            scheduler,
            monitor,
            scaler,
            lifecycle,
        };

        // Bring every pool up to its floor before the loops start.
        for pool in &orchestrator.config.pools {
            let capabilities: HashSet<String> = pool.capabilities.iter().cloned().collect();
            for _ in 0..pool.min_agents {
                orchestrator
                    .lifecycle
                    .spawn(&pool.name, capabilities.clone())
                    .await?;
            }
        }

        info!(
            pools = orchestrator.config.pools.len(),
            strategy = %orchestrator.config.strategy,
            "orchestrator ready"
        );
        Ok(orchestrator)
    }

    /// Start the health-monitor and auto-scaler loops. Each runs on its
    /// own interval; abort the handles to stop them.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![self.monitor.clone().run(), self.scaler.clone().run()]
    }

    // --- Task ingress ---

    /// Enqueue a task. See [`Scheduler::enqueue`].
    pub async fn enqueue(
        &self,
        required_capability: &str,
        priority: i32,
        payload: serde_json::Value,
    ) -> FlotillaResult<Uuid> {
        self.scheduler
            .enqueue(required_capability, priority, payload)
            .await
    }

    /// Cancel a task. See [`Scheduler::cancel`].
    pub async fn cancel(&self, task_id: Uuid) -> FlotillaResult<()> {
        self.scheduler.cancel(task_id).await
    }

    /// Requeue a failed task. See [`Scheduler::requeue`].
    pub async fn requeue(&self, task_id: Uuid) -> FlotillaResult<()> {
        self.scheduler.requeue(task_id).await
    }

    // --- Agent result callbacks ---

    /// Report a task completed. See [`Scheduler::complete`].
    pub async fn complete(&self, task_id: Uuid) -> FlotillaResult<()> {
        self.scheduler.complete(task_id).await
    }

    /// Report a task failed. See [`Scheduler::fail`].
    pub async fn fail(&self, task_id: Uuid, reason: &str) -> FlotillaResult<()> {
        self.scheduler.fail(task_id, reason).await
    }

    // --- Administrative surface ---

    /// Spawn one agent into a pool, carrying the pool's capability filter.
    pub async fn spawn_agent(&self, pool_name: &str) -> FlotillaResult<Uuid> {
        let capabilities = {
            let registry = self.registry.read().await;
            registry
                .pool(pool_name)
                .map(|p| p.capability_filter.clone())
                .ok_or_else(|| FlotillaError::Config(format!("unknown pool '{pool_name}'")))?
        };
        self.lifecycle.spawn(pool_name, capabilities).await
    }

    /// Re-run the assignment loop over all queued tasks. Returns the
    /// number of assignments made.
    pub async fn rebalance(&self) -> usize {
        self.scheduler.dispatch().await
    }

    /// Run one health probe round and return the raw results.
    pub async fn probe_round(&self) -> Vec<HealthCheckResult> {
        self.monitor.tick().await
    }

    /// Run one auto-scaler evaluation.
    pub async fn scale_round(&self) {
        self.scaler.tick().await;
    }

    // --- Observation ---

    /// Subscribe to the structured event stream (result egress included).
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Occupancy snapshot of every pool.
    pub async fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.registry.read().await.pool_snapshots()
    }

    /// Snapshot of every agent record, sorted by pool then id.
    pub async fn agent_snapshots(&self) -> Vec<AgentRecord> {
        let registry = self.registry.read().await;
        let mut agents: Vec<AgentRecord> = registry.agents().cloned().collect();
        agents.sort_by(|a, b| a.pool.cmp(&b.pool).then(a.id.cmp(&b.id)));
        agents
    }

    /// Look up a task's current record.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.queue.read().await.get(task_id).cloned()
    }

    /// Drop terminal task records; returns how many were removed.
    pub async fn prune_terminal_tasks(&self) -> usize {
        self.queue.write().await.prune_terminal()
    }

    /// The validated configuration this orchestrator was built from.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The scheduler, for embedders wiring their own transports.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<RwLock<PoolRegistry>> {
        &self.registry
    }

    /// The shared task queue.
    pub fn queue(&self) -> &Arc<RwLock<TaskQueue>> {
        &self.queue
    }

    /// The lifecycle manager, for embedders driving manual recycles.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }
}
