use crate::lifecycle::LifecycleManager;
use crate::queue::{CancelOutcome, TaskQueue};
use crate::registry::PoolRegistry;
use crate::strategy::SelectionStrategy;
use crate::types::{AgentStatus, Task, TaskStatus};
use chrono::Utc;
use flotilla_core::events::{EventBus, OrchestratorEvent, TerminationReason};
use flotilla_core::{FlotillaError, FlotillaResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Mark an assigned task failed and emit the egress event.
///
/// Used wherever an agent loses its task outside the normal failure
/// callback (unhealthy transition, forced removal, spawn rollback). Agent
/// cleanup stays with the caller. Must be called with the queue write
/// guard held.
pub(crate) fn fail_in_flight(
    queue: &mut TaskQueue,
    events: &EventBus,
    task_id: Uuid,
    reason: &str,
) {
    match queue.mark_failed(task_id, reason) {
        Ok(task) => {
            events.emit(OrchestratorEvent::TaskFailed {
                task_id,
                agent_id: task.assigned_agent,
                duration_ms: task.running_ms(),
                reason: reason.to_string(),
                payload: task.payload,
            });
        }
        Err(e) => warn!(task = %task_id, error = %e, "in-flight failure skipped"),
    }
}

/// Matches queued tasks to eligible agents and drives task state.
///
/// Assignment runs whenever a task is enqueued and whenever an agent
/// becomes idle (completion, failure, recovery, scale-up). The scheduler
/// is cheap to clone; all state lives behind the shared registry and
/// queue locks.
///
/// Lock order everywhere in this crate: registry before queue. The
/// assignment and callback paths hold both write guards so the
/// agent-task bijection is never observable in a violated intermediate
/// state.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<RwLock<PoolRegistry>>,
    queue: Arc<RwLock<TaskQueue>>,
    events: EventBus,
    strategy: Arc<dyn SelectionStrategy>,
    lifecycle: LifecycleManager,
    max_tasks_per_agent: u64,
    cancel_ack_timeout: Duration,
}

impl Scheduler {
    /// Create a scheduler over the shared registry and queue.
    pub fn new(
        registry: Arc<RwLock<PoolRegistry>>,
        queue: Arc<RwLock<TaskQueue>>,
        events: EventBus,
        strategy: Arc<dyn SelectionStrategy>,
        lifecycle: LifecycleManager,
        max_tasks_per_agent: u64,
        cancel_ack_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            events,
            strategy,
            lifecycle,
            max_tasks_per_agent,
            cancel_ack_timeout,
        }
    }

    /// Enqueue a task and immediately try to dispatch it.
    ///
    /// A capability no registered pool accepts is rejected here with
    /// [`FlotillaError::NoEligiblePool`] rather than queued indefinitely.
    pub async fn enqueue(
        &self,
        required_capability: &str,
        priority: i32,
        payload: serde_json::Value,
    ) -> FlotillaResult<Uuid> {
        {
            let registry = self.registry.read().await;
            if !registry.has_pool_for(required_capability) {
                return Err(FlotillaError::NoEligiblePool {
                    capability: required_capability.to_string(),
                });
            }
        }
        let task = Task::new(required_capability, priority, payload);
        let task_id = {
            let mut queue = self.queue.write().await;
            queue.enqueue(task)
        };
        info!(task = %task_id, capability = %required_capability, priority, "task enqueued");
        self.dispatch().await;
        Ok(task_id)
    }

    /// Cancel a task.
    ///
    /// Queued tasks are removed with no side effects. For an assigned task
    /// this requests cooperative cancellation and arms a timer: if the
    /// agent has not acknowledged (via the failure callback) when the
    /// timeout elapses, the task is failed. Cancelling a terminal or
    /// unknown task is a no-op.
    pub async fn cancel(&self, task_id: Uuid) -> FlotillaResult<()> {
        let outcome = {
            let mut queue = self.queue.write().await;
            queue.cancel(task_id)
        };
        match outcome {
            CancelOutcome::Removed(_) => {
                info!(task = %task_id, "queued task cancelled");
                self.events
                    .emit(OrchestratorEvent::TaskCancelled { task_id });
            }
            CancelOutcome::InFlight(agent_id) => {
                info!(task = %task_id, agent = %agent_id, "cancellation requested for in-flight task");
                self.events
                    .emit(OrchestratorEvent::TaskCancelRequested { task_id, agent_id });
                let scheduler = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(scheduler.cancel_ack_timeout).await;
                    let still_assigned = {
                        let queue = scheduler.queue.read().await;
                        queue
                            .get(task_id)
                            .is_some_and(|t| t.status == TaskStatus::Assigned)
                    };
                    if still_assigned {
                        warn!(task = %task_id, "cancellation unacknowledged, failing task");
                        if let Err(e) =
                            scheduler.fail(task_id, "cancellation not acknowledged").await
                        {
                            warn!(task = %task_id, error = %e, "cancel escalation failed");
                        }
                    }
                });
            }
            CancelOutcome::Noop => {}
        }
        Ok(())
    }

    /// Reset a failed task to `Queued` with its original priority, then
    /// try to dispatch it.
    pub async fn requeue(&self, task_id: Uuid) -> FlotillaResult<()> {
        {
            let mut queue = self.queue.write().await;
            queue.requeue(task_id)?;
        }
        info!(task = %task_id, "task requeued");
        self.dispatch().await;
        Ok(())
    }

    /// Completion callback: the agent finished its task successfully.
    pub async fn complete(&self, task_id: Uuid) -> FlotillaResult<()> {
        let (agent_id, duration_ms, recycle) = self.finish(task_id, None).await?;
        self.events.emit(OrchestratorEvent::TaskCompleted {
            task_id,
            agent_id,
            duration_ms,
        });
        info!(task = %task_id, agent = %agent_id, duration_ms, "task completed");
        self.after_release(agent_id, recycle).await;
        Ok(())
    }

    /// Failure callback: the agent reported its task failed.
    ///
    /// Failure does not by itself mark the agent unhealthy; liveness is
    /// judged by the health monitor's probes, not task outcomes.
    pub async fn fail(&self, task_id: Uuid, reason: &str) -> FlotillaResult<()> {
        let (agent_id, _duration_ms, recycle) = self.finish(task_id, Some(reason)).await?;
        info!(task = %task_id, agent = %agent_id, reason, "task failed");
        self.after_release(agent_id, recycle).await;
        Ok(())
    }

    /// Assign queued tasks to eligible agents until no match remains.
    /// Returns the number of assignments made.
    pub async fn dispatch(&self) -> usize {
        let mut assigned = 0;
        while let Some((task_id, agent_id)) = self.assign_one().await {
            info!(task = %task_id, agent = %agent_id, strategy = self.strategy.name(), "task assigned");
            self.events
                .emit(OrchestratorEvent::TaskAssigned { task_id, agent_id });
            assigned += 1;
        }
        assigned
    }

    /// One pass of the assignment algorithm: pop the highest-priority
    /// queued task that has an eligible idle agent, skipping over starved
    /// capabilities so a capability with no agents cannot block the head
    /// of the queue.
    async fn assign_one(&self) -> Option<(Uuid, Uuid)> {
        let mut registry = self.registry.write().await;
        let mut queue = self.queue.write().await;

        let mut pick = None;
        {
            // Capabilities found starved once are skipped for the rest of
            // the scan, bounding the work per queued entry.
            let mut starved: HashSet<String> = HashSet::new();
            for task in queue.queued_in_order() {
                if starved.contains(&task.required_capability) {
                    continue;
                }
                let candidates = registry.find_eligible(&task.required_capability);
                if candidates.is_empty() {
                    starved.insert(task.required_capability.clone());
                    continue;
                }
                if let Some(agent_id) = self.strategy.select(&candidates) {
                    pick = Some((task.id, agent_id));
                    break;
                }
            }
        }
        let (task_id, agent_id) = pick?;

        // Both write guards are held: the two sides change together.
        registry.set_status(agent_id, AgentStatus::Busy).ok()?;
        if let Err(e) = queue.mark_assigned(task_id, agent_id) {
            error!(task = %task_id, agent = %agent_id, error = %e, "assignment rolled back");
            let _ = registry.set_status(agent_id, AgentStatus::Idle);
            return None;
        }
        if let Some(agent) = registry.agent_mut(agent_id) {
            agent.current_task = Some(task_id);
        }
        Some((task_id, agent_id))
    }

    /// Shared completion/failure path: verify the bijection, move the task
    /// to its terminal state, release the agent. Returns the agent, the
    /// task duration, and whether the recycle threshold was hit.
    async fn finish(
        &self,
        task_id: Uuid,
        failure_reason: Option<&str>,
    ) -> FlotillaResult<(Uuid, u64, bool)> {
        let mut registry = self.registry.write().await;
        let mut queue = self.queue.write().await;

        let task = queue.get(task_id).ok_or(FlotillaError::UnknownTask(task_id))?;
        if task.status != TaskStatus::Assigned {
            return Err(FlotillaError::Task(format!(
                "terminal callback for task {task_id} in state {}",
                task.status
            )));
        }
        let agent_id = task
            .assigned_agent
            .ok_or_else(|| FlotillaError::Invariant(format!("assigned task {task_id} has no agent")))?;

        let bijection = registry
            .agent(agent_id)
            .map(|agent| (agent.current_task, agent.pool.clone()));
        match bijection {
            Some((held, _)) if held == Some(task_id) => {}
            Some((held, pool)) => {
                return Err(self.invariant_failure(
                    &mut registry,
                    &pool,
                    format!("task {task_id} assigned to agent {agent_id} which holds {held:?}"),
                ));
            }
            None => {
                return Err(FlotillaError::Invariant(format!(
                    "assigned task {task_id} references missing agent {agent_id}"
                )))
            }
        }

        let final_task = match failure_reason {
            None => queue.mark_completed(task_id)?,
            Some(reason) => {
                let task = queue.mark_failed(task_id, reason)?;
                self.events.emit(OrchestratorEvent::TaskFailed {
                    task_id,
                    agent_id: Some(agent_id),
                    duration_ms: task.running_ms(),
                    reason: reason.to_string(),
                    payload: task.payload.clone(),
                });
                task
            }
        };
        let duration_ms = final_task
            .assigned_at
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let recycle = self.release_agent(&mut registry, agent_id);
        Ok((agent_id, duration_ms, recycle))
    }

    /// Return the agent to the idle pool after a terminal task state.
    /// Returns true when the recycle threshold was reached.
    fn release_agent(&self, registry: &mut PoolRegistry, agent_id: Uuid) -> bool {
        let (was_busy, hit_threshold) = match registry.agent_mut(agent_id) {
            Some(agent) => {
                agent.current_task = None;
                agent.tasks_completed += 1;
                (
                    agent.status == AgentStatus::Busy,
                    self.max_tasks_per_agent > 0
                        && agent.tasks_completed >= self.max_tasks_per_agent,
                )
            }
            None => return false,
        };
        if was_busy {
            if let Err(e) = registry.set_status(agent_id, AgentStatus::Idle) {
                warn!(agent = %agent_id, error = %e, "agent release skipped");
                return false;
            }
        }
        // An agent already draining or unhealthy is not recycled here.
        was_busy && hit_threshold
    }

    /// After the guards are dropped: recycle a worn agent, then re-run the
    /// assignment loop for the freed capacity.
    async fn after_release(&self, agent_id: Uuid, recycle: bool) {
        if recycle {
            info!(agent = %agent_id, "recycle threshold reached");
            if let Err(e) = self
                .lifecycle
                .recycle(agent_id, TerminationReason::Recycled)
                .await
            {
                warn!(agent = %agent_id, error = %e, "proactive recycle failed");
            }
        }
        self.dispatch().await;
    }

    /// Halt the pool, emit the alert, and produce the fatal error.
    fn invariant_failure(
        &self,
        registry: &mut PoolRegistry,
        pool: &str,
        detail: String,
    ) -> FlotillaError {
        error!(pool = %pool, detail = %detail, "invariant violation, halting pool");
        registry.halt_pool(pool);
        self.events.emit(OrchestratorEvent::PoolHalted {
            pool: pool.to_string(),
            reason: detail.clone(),
        });
        FlotillaError::Invariant(detail)
    }
}
