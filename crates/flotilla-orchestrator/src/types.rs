use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Status of an agent in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Healthy and available for assignment.
    Idle,
    /// Executing a task.
    Busy,
    /// Excluded from scheduling until it recovers or is recycled.
    Unhealthy,
    /// Being drained and removed; absorbing until the record is deleted.
    Terminating,
}

impl AgentStatus {
    /// Whether the agent state machine allows `self -> to`.
    ///
    /// Allowed: `Idle <-> Busy`, `Idle|Busy -> Unhealthy`,
    /// `Unhealthy -> Idle` (explicit recovery), `any -> Terminating`.
    pub fn can_transition(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Idle | Busy | Unhealthy, Terminating)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle | Busy, Unhealthy)
                | (Unhealthy, Idle)
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
            AgentStatus::Terminating => write!(f, "terminating"),
        }
    }
}

/// Record of a single worker agent.
///
/// Cross-references are stored as ids, never embedded: `current_task`
/// points into the task table, and the owning [`Pool`] lists this record
/// by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique id, assigned at spawn time.
    pub id: Uuid,
    /// Name of the owning pool. Immutable after spawn.
    pub pool: String,
    /// Capability tags this agent can execute. Immutable.
    pub capabilities: HashSet<String>,
    /// Current scheduling status.
    pub status: AgentStatus,
    /// Probe failures in a row; reset by any success.
    pub consecutive_failures: u32,
    /// Probe successes in a row; reset by any failure.
    pub consecutive_successes: u32,
    /// The task this agent is executing, if any. An agent executes at most
    /// one task at a time.
    pub current_task: Option<Uuid>,
    /// Lifetime completed-task counter, used by the recycling policy.
    pub tasks_completed: u64,
    /// When the agent was last probed.
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// When the agent was spawned.
    pub spawned_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Create a fresh idle record for the given pool.
    pub fn new(pool: impl Into<String>, capabilities: HashSet<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool: pool.into(),
            capabilities,
            status: AgentStatus::Idle,
            consecutive_failures: 0,
            consecutive_successes: 0,
            current_task: None,
            tasks_completed: 0,
            last_health_check_at: None,
            spawned_at: Utc::now(),
        }
    }

    /// Whether this agent can execute tasks tagged `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// A named, capability-scoped group of agents with size bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Unique pool name.
    pub name: String,
    /// Capability tags a task must carry to be eligible for this pool.
    pub capability_filter: HashSet<String>,
    /// Lower scaling bound.
    pub min_agents: usize,
    /// Upper scaling bound.
    pub max_agents: usize,
    /// Ids of the agents owned by this pool.
    pub agents: HashSet<Uuid>,
    /// Set after a fatal invariant violation; a halted pool no longer
    /// schedules tasks.
    pub halted: bool,
}

impl Pool {
    /// Create an empty pool.
    pub fn new(
        name: impl Into<String>,
        capability_filter: HashSet<String>,
        min_agents: usize,
        max_agents: usize,
    ) -> Self {
        Self {
            name: name.into(),
            capability_filter,
            min_agents,
            max_agents,
            agents: HashSet::new(),
            halted: false,
        }
    }

    /// Whether tasks tagged `capability` may run in this pool.
    pub fn accepts(&self, capability: &str) -> bool {
        self.capability_filter.contains(capability)
    }

    /// Whether the pool has reached its upper bound.
    pub fn at_capacity(&self) -> bool {
        self.agents.len() >= self.max_agents
    }
}

/// Status of a task in the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for an eligible agent.
    Queued,
    /// Dispatched to exactly one agent.
    Assigned,
    /// Finished successfully.
    Completed,
    /// Finished in failure. Not automatically requeued.
    Failed {
        /// Failure description.
        reason: String,
    },
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// A unit of work flowing through the orchestrator.
///
/// The payload is opaque; the orchestrator routes on
/// `required_capability` and `priority` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, assigned on enqueue.
    pub id: Uuid,
    /// Single capability tag an executing agent must hold.
    pub required_capability: String,
    /// Lower numeric value = higher priority.
    pub priority: i32,
    /// Enqueue sequence number; FIFO tiebreak within a priority band.
    pub seq: u64,
    /// Opaque unit of work, not interpreted here.
    pub payload: serde_json::Value,
    /// Current state.
    pub status: TaskStatus,
    /// When the task entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// When the task was dispatched, if it has been.
    pub assigned_at: Option<DateTime<Utc>>,
    /// The executing agent, if assigned.
    pub assigned_agent: Option<Uuid>,
}

impl Task {
    /// Create a queued task. The queue assigns `seq` on enqueue.
    pub fn new(
        required_capability: impl Into<String>,
        priority: i32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            required_capability: required_capability.into(),
            priority,
            seq: 0,
            payload,
            status: TaskStatus::Queued,
            enqueued_at: Utc::now(),
            assigned_at: None,
            assigned_agent: None,
        }
    }

    /// Milliseconds between assignment and now. `None` if never assigned.
    pub fn running_ms(&self) -> Option<u64> {
        self.assigned_at
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
    }
}

/// Outcome of a single health probe. Transient; not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// The probed agent.
    pub agent_id: Uuid,
    /// Whether the probe succeeded within its timeout.
    pub success: bool,
    /// How long the probe took (capped at the timeout).
    pub latency: Duration,
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
}
