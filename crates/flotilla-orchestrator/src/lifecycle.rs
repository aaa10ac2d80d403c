use crate::queue::TaskQueue;
use crate::registry::PoolRegistry;
use crate::scheduler::fail_in_flight;
use crate::types::{AgentRecord, AgentStatus};
use async_trait::async_trait;
use flotilla_core::events::{EventBus, OrchestratorEvent, TerminationReason};
use flotilla_core::{FlotillaError, FlotillaResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How often the graceful drain wait re-checks an agent's task slot.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// The agent-hosting side effect: starting and stopping the actual worker
/// (subprocess, container, thread; opaque to the control plane).
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// Start hosting the given agent.
    async fn launch(&self, agent: &AgentRecord) -> FlotillaResult<()>;

    /// Stop hosting the given agent.
    async fn terminate(&self, agent_id: Uuid) -> FlotillaResult<()>;
}

/// Host with no side effect, for tests and in-process embedding.
pub struct NoopHost;

#[async_trait]
impl AgentHost for NoopHost {
    async fn launch(&self, _agent: &AgentRecord) -> FlotillaResult<()> {
        Ok(())
    }

    async fn terminate(&self, _agent_id: Uuid) -> FlotillaResult<()> {
        Ok(())
    }
}

/// Executes spawn/terminate/recycle decisions against the registry and the
/// hosting mechanism.
///
/// Lock order everywhere in this crate: registry before queue.
#[derive(Clone)]
pub struct LifecycleManager {
    registry: Arc<RwLock<PoolRegistry>>,
    queue: Arc<RwLock<TaskQueue>>,
    events: EventBus,
    host: Arc<dyn AgentHost>,
    drain_timeout: Duration,
}

impl LifecycleManager {
    /// Create a manager over the shared registry and queue.
    pub fn new(
        registry: Arc<RwLock<PoolRegistry>>,
        queue: Arc<RwLock<TaskQueue>>,
        events: EventBus,
        host: Arc<dyn AgentHost>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            events,
            host,
            drain_timeout,
        }
    }

    /// Spawn a new agent into a pool.
    ///
    /// The registry entry is created first; if the hosting side effect
    /// then fails, the entry is rolled back so no orphaned record remains.
    /// Capacity errors are reported without invoking the host at all.
    pub async fn spawn(
        &self,
        pool_name: &str,
        capabilities: HashSet<String>,
    ) -> FlotillaResult<Uuid> {
        let record = {
            let mut registry = self.registry.write().await;
            let id = registry.add_agent(pool_name, capabilities)?;
            registry
                .agent(id)
                .cloned()
                .ok_or(FlotillaError::UnknownAgent(id))?
        };
        let agent_id = record.id;

        if let Err(e) = self.host.launch(&record).await {
            error!(agent = %agent_id, pool = %pool_name, error = %e, "hosting failed, rolling back spawn");
            self.rollback_spawn(agent_id, pool_name).await;
            return Err(FlotillaError::Hosting(e.to_string()));
        }

        info!(agent = %agent_id, pool = %pool_name, "agent spawned");
        self.events.emit(OrchestratorEvent::AgentSpawned {
            agent_id,
            pool: pool_name.to_string(),
        });
        Ok(agent_id)
    }

    async fn rollback_spawn(&self, agent_id: Uuid, pool_name: &str) {
        let mut registry = self.registry.write().await;
        let mut queue = self.queue.write().await;
        match registry.remove_agent(agent_id, true) {
            Ok(removed) => {
                // A task may have been assigned in the launch window.
                if let Some(task_id) = removed.current_task {
                    fail_in_flight(&mut queue, &self.events, task_id, "agent hosting failed");
                }
            }
            Err(e) => warn!(agent = %agent_id, error = %e, "spawn rollback found no record"),
        }
        self.events.emit(OrchestratorEvent::AgentTerminated {
            agent_id,
            pool: pool_name.to_string(),
            reason: TerminationReason::HostingRollback,
        });
    }

    /// Remove an agent, draining gracefully first.
    ///
    /// The agent is marked `Terminating` (excluding it from scheduling),
    /// then the manager waits up to the drain timeout for its current task
    /// to finish. On timeout it escalates to forced removal and the
    /// in-flight task is failed. Never blocks indefinitely.
    pub async fn recycle(&self, agent_id: Uuid, reason: TerminationReason) -> FlotillaResult<()> {
        {
            let mut registry = self.registry.write().await;
            registry.set_status(agent_id, AgentStatus::Terminating)?;
        }

        let drained = self.wait_for_drain(agent_id).await;
        if !drained {
            warn!(agent = %agent_id, "drain timed out, forcing removal");
        }

        let removed = {
            let mut registry = self.registry.write().await;
            let mut queue = self.queue.write().await;
            let removed = match registry.remove_agent(agent_id, true) {
                Ok(removed) => removed,
                // Someone else already removed it; nothing left to do.
                Err(FlotillaError::UnknownAgent(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Some(task_id) = removed.current_task {
                fail_in_flight(
                    &mut queue,
                    &self.events,
                    task_id,
                    "agent removed before completion",
                );
            }
            removed
        };

        if let Err(e) = self.host.terminate(agent_id).await {
            warn!(agent = %agent_id, error = %e, "hosting terminate failed");
        }

        info!(agent = %agent_id, pool = %removed.pool, reason = %reason, "agent terminated");
        self.events.emit(OrchestratorEvent::AgentTerminated {
            agent_id,
            pool: removed.pool,
            reason,
        });
        Ok(())
    }

    /// Poll until the agent has no current task, bounded by the drain
    /// timeout. Returns `false` on timeout. A record that disappears
    /// mid-wait counts as drained.
    async fn wait_for_drain(&self, agent_id: Uuid) -> bool {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            {
                let registry = self.registry.read().await;
                match registry.agent(agent_id) {
                    Some(agent) if agent.current_task.is_some() => {}
                    _ => return true,
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}
