use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Why an agent was removed from its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Retired by an auto-scaler scale-down decision.
    ScaleDown,
    /// Recycled after reaching the per-agent task limit.
    Recycled,
    /// Evicted after failing to recover from unhealthy status.
    Unhealthy,
    /// Spawn rolled back because the hosting side effect failed.
    HostingRollback,
    /// Removed by an administrative request.
    Manual,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::ScaleDown => write!(f, "scale_down"),
            TerminationReason::Recycled => write!(f, "recycled"),
            TerminationReason::Unhealthy => write!(f, "unhealthy"),
            TerminationReason::HostingRollback => write!(f, "hosting_rollback"),
            TerminationReason::Manual => write!(f, "manual"),
        }
    }
}

/// A structured control-plane event.
///
/// Terminal task states carry the result-egress fields (task, agent,
/// duration); the remaining variants report pool and agent lifecycle
/// activity. Consumers subscribe via [`EventBus::subscribe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A task was dispatched to an agent.
    TaskAssigned {
        /// The assigned task.
        task_id: Uuid,
        /// The agent now executing it.
        agent_id: Uuid,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// The completed task.
        task_id: Uuid,
        /// The agent that executed it.
        agent_id: Uuid,
        /// Milliseconds between assignment and completion.
        duration_ms: u64,
    },
    /// A task finished in failure.
    TaskFailed {
        /// The failed task.
        task_id: Uuid,
        /// The executing agent, if the task was ever assigned.
        agent_id: Option<Uuid>,
        /// Milliseconds between assignment and failure, if assigned.
        duration_ms: Option<u64>,
        /// Failure description.
        reason: String,
        /// The task's opaque payload. Retention past this event is the
        /// subscriber's policy.
        payload: serde_json::Value,
    },
    /// A queued task was cancelled and removed.
    TaskCancelled {
        /// The cancelled task.
        task_id: Uuid,
    },
    /// Cooperative cancellation was requested for an in-flight task.
    TaskCancelRequested {
        /// The task to cancel.
        task_id: Uuid,
        /// The agent asked to stop.
        agent_id: Uuid,
    },
    /// A new agent joined a pool.
    AgentSpawned {
        /// The new agent.
        agent_id: Uuid,
        /// Its owning pool.
        pool: String,
    },
    /// An agent was removed from its pool.
    AgentTerminated {
        /// The removed agent.
        agent_id: Uuid,
        /// The pool it belonged to.
        pool: String,
        /// Why it was removed.
        reason: TerminationReason,
    },
    /// An agent crossed the unhealthy threshold.
    AgentUnhealthy {
        /// The unhealthy agent.
        agent_id: Uuid,
        /// Probe failures in a row at the time of the transition.
        consecutive_failures: u32,
    },
    /// An unhealthy agent recovered and rejoined scheduling.
    AgentRecovered {
        /// The recovered agent.
        agent_id: Uuid,
    },
    /// The auto-scaler grew a pool.
    PoolScaledUp {
        /// The scaled pool.
        pool: String,
        /// Agents added this tick.
        added: usize,
    },
    /// The auto-scaler shrank a pool.
    PoolScaledDown {
        /// The scaled pool.
        pool: String,
        /// Agents retired this tick.
        removed: usize,
    },
    /// Scheduling for a pool was halted after a fatal invariant violation.
    PoolHalted {
        /// The halted pool.
        pool: String,
        /// The violated invariant.
        reason: String,
    },
}

/// Broadcast bus for [`OrchestratorEvent`]s.
///
/// Emission is fire-and-forget: an absent subscriber is not an error, and a
/// slow subscriber lags rather than blocking the control plane.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: OrchestratorEvent) {
        // SendError only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
