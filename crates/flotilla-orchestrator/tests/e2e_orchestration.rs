//! End-to-end orchestration tests.
//!
//! Exercises the full control plane through the [`Orchestrator`] facade
//! with mock host and probe implementations: scheduling under load,
//! closed-loop scaling, health transitions, lifecycle guarantees, and the
//! result-egress event stream.

use async_trait::async_trait;
use flotilla_core::config::{HealthConfig, OrchestratorConfig, PoolConfig, ScalingConfig};
use flotilla_core::events::OrchestratorEvent;
use flotilla_core::{FlotillaError, FlotillaResult};
use flotilla_orchestrator::{
    AgentHost, AgentRecord, AgentStatus, HealthProbe, Orchestrator, TaskStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mock host and probe
// ---------------------------------------------------------------------------

/// Host that records hosting side effects.
#[derive(Default)]
struct RecordingHost {
    launches: AtomicUsize,
    terminations: AtomicUsize,
}

#[async_trait]
impl AgentHost for RecordingHost {
    async fn launch(&self, _agent: &AgentRecord) -> FlotillaResult<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self, _agent_id: Uuid) -> FlotillaResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Probe whose per-agent answers can be flipped mid-test.
#[derive(Default)]
struct ScriptedProbe {
    sick: Mutex<HashSet<Uuid>>,
}

impl ScriptedProbe {
    fn set_sick(&self, agent_id: Uuid, sick: bool) {
        let mut set = self.sick.lock().expect("probe lock");
        if sick {
            set.insert(agent_id);
        } else {
            set.remove(&agent_id);
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, agent: &AgentRecord) -> bool {
        !self.sick.lock().expect("probe lock").contains(&agent.id)
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn coding_pool_config(min: usize, max: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        pools: vec![PoolConfig {
            name: "coding".to_string(),
            capabilities: vec!["code".to_string()],
            min_agents: min,
            max_agents: max,
        }],
        strategy: Default::default(),
        health: HealthConfig {
            interval_secs: 30,
            probe_timeout_secs: 1,
            unhealthy_threshold: 3,
            recovery_threshold: 2,
        },
        scaling: ScalingConfig {
            interval_secs: 10,
            scale_up_queue_threshold: 3,
            scale_up_dwell_ticks: 2,
            scale_down_idle_threshold: 2,
            scale_down_dwell_ticks: 2,
            max_spawn_per_tick: 1,
        },
        max_tasks_per_agent: 0,
        drain_timeout_secs: 1,
        cancel_ack_timeout_secs: 1,
    }
}

struct Fixture {
    orchestrator: Orchestrator,
    host: Arc<RecordingHost>,
    probe: Arc<ScriptedProbe>,
}

async fn fixture(config: OrchestratorConfig) -> Fixture {
    let host = Arc::new(RecordingHost::default());
    let probe = Arc::new(ScriptedProbe::default());
    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&host) as Arc<dyn AgentHost>,
        Arc::clone(&probe) as Arc<dyn HealthProbe>,
    )
    .await
    .expect("orchestrator builds");
    Fixture {
        orchestrator,
        host,
        probe,
    }
}

// ---------------------------------------------------------------------------
// Scenario A: sustained backlog scales the pool up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_backlog_triggers_scale_up() {
    let f = fixture(coding_pool_config(1, 4)).await;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        tasks.push(
            f.orchestrator
                .enqueue("code", 5, serde_json::Value::Null)
                .await
                .expect("enqueue"),
        );
    }

    // One agent present: one task assigned, four queued.
    let mut assigned = 0;
    let mut queued = 0;
    for task in &tasks {
        match f.orchestrator.task(*task).await.expect("task exists").status {
            TaskStatus::Assigned => assigned += 1,
            TaskStatus::Queued => queued += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(assigned, 1);
    assert_eq!(queued, 4);

    // queue_depth = 4 > threshold 3, sustained for the dwell period.
    f.orchestrator.scale_round().await;
    assert_eq!(f.host.launches.load(Ordering::SeqCst), 1);
    f.orchestrator.scale_round().await;
    assert_eq!(f.host.launches.load(Ordering::SeqCst), 2);

    // A second task transitioned to Assigned on the new agent.
    let assigned_now = count_assigned(&f, &tasks).await;
    assert_eq!(assigned_now, 2);
}

async fn count_assigned(f: &Fixture, tasks: &[Uuid]) -> usize {
    let mut assigned = 0;
    for task in tasks {
        if matches!(
            f.orchestrator.task(*task).await.expect("task exists").status,
            TaskStatus::Assigned
        ) {
            assigned += 1;
        }
    }
    assigned
}

// ---------------------------------------------------------------------------
// Scenario B: probe failures mark unhealthy, successes recover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_unhealthy_then_recovery() {
    let f = fixture(coding_pool_config(1, 4)).await;
    let agent = f.orchestrator.agent_snapshots().await[0].id;

    f.probe.set_sick(agent, true);
    for _ in 0..3 {
        f.orchestrator.probe_round().await;
    }
    {
        let registry = f.orchestrator.registry().read().await;
        assert_eq!(registry.agent(agent).expect("agent").status, AgentStatus::Unhealthy);
        assert!(registry.find_eligible("code").is_empty());
    }

    f.probe.set_sick(agent, false);
    f.orchestrator.probe_round().await;
    f.orchestrator.probe_round().await;
    {
        let registry = f.orchestrator.registry().read().await;
        assert_eq!(registry.agent(agent).expect("agent").status, AgentStatus::Idle);
        assert_eq!(registry.find_eligible("code").len(), 1);
    }
}

// ---------------------------------------------------------------------------
// Scenario C: removing a busy agent requires force
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_busy_agent_removal_requires_force() {
    let f = fixture(coding_pool_config(1, 4)).await;
    let task = f
        .orchestrator
        .enqueue("code", 5, serde_json::Value::Null)
        .await
        .expect("enqueue");
    let agent = f.orchestrator.agent_snapshots().await[0].id;

    {
        let mut registry = f.orchestrator.registry().write().await;
        let err = registry.remove_agent(agent, false).expect_err("must refuse");
        assert!(matches!(err, FlotillaError::AgentBusy { agent: a } if a == agent));
        // The agent is unchanged and still holds its task.
        let record = registry.agent(agent).expect("agent");
        assert_eq!(record.status, AgentStatus::Busy);
        assert_eq!(record.current_task, Some(task));
    }
    f.orchestrator.complete(task).await.expect("complete");
}

// ---------------------------------------------------------------------------
// Scenario D: unmatched capability rejected at enqueue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_unmatched_capability_rejected() {
    let f = fixture(coding_pool_config(1, 4)).await;
    let err = f
        .orchestrator
        .enqueue("gpu", 0, serde_json::Value::Null)
        .await
        .expect_err("must reject");
    assert!(matches!(err, FlotillaError::NoEligiblePool { capability } if capability == "gpu"));
    // The task never entered any queue.
    assert_eq!(f.orchestrator.queue().read().await.total_count(), 0);
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invariant_pool_bounds_hold() {
    let f = fixture(coding_pool_config(1, 4)).await;
    for _ in 0..8 {
        f.orchestrator
            .enqueue("code", 5, serde_json::Value::Null)
            .await
            .expect("enqueue");
    }
    // Drive the scaler well past the point where it wants more agents.
    for _ in 0..10 {
        f.orchestrator.scale_round().await;
        let snapshot = &f.orchestrator.pool_snapshots().await[0];
        let total =
            snapshot.idle + snapshot.busy + snapshot.unhealthy + snapshot.terminating;
        assert!(total >= snapshot.min_agents && total <= snapshot.max_agents);
    }
    assert_eq!(f.orchestrator.agent_snapshots().await.len(), 4);
}

#[tokio::test]
async fn test_invariant_assignment_bijection() {
    let f = fixture(coding_pool_config(3, 4)).await;
    let mut tasks = Vec::new();
    for _ in 0..3 {
        tasks.push(
            f.orchestrator
                .enqueue("code", 5, serde_json::Value::Null)
                .await
                .expect("enqueue"),
        );
    }

    let agents = f.orchestrator.agent_snapshots().await;
    for task_id in tasks {
        let task = f.orchestrator.task(task_id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Assigned);
        let holders: Vec<&AgentRecord> = agents
            .iter()
            .filter(|a| a.current_task == Some(task_id))
            .collect();
        assert_eq!(holders.len(), 1, "exactly one agent holds the task");
        assert!(holders[0].has_capability(&task.required_capability));
    }
}

// ---------------------------------------------------------------------------
// Idempotence: cancelling a completed task is a no-op
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_completed_task_is_noop() {
    let f = fixture(coding_pool_config(1, 4)).await;
    let task = f
        .orchestrator
        .enqueue("code", 5, serde_json::Value::Null)
        .await
        .expect("enqueue");
    f.orchestrator.complete(task).await.expect("complete");

    f.orchestrator.cancel(task).await.expect("cancel is a no-op");
    assert_eq!(
        f.orchestrator.task(task).await.expect("task").status,
        TaskStatus::Completed
    );
}

// ---------------------------------------------------------------------------
// Liveness: every task is eventually assigned and completed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_liveness_backlog_drains() {
    let f = fixture(coding_pool_config(2, 4)).await;
    let mut tasks = Vec::new();
    for i in 0..10 {
        tasks.push(
            f.orchestrator
                .enqueue("code", i % 3, serde_json::Value::Null)
                .await
                .expect("enqueue"),
        );
    }

    // Drive completions the way external agents would.
    for _ in 0..32 {
        let running: Vec<Uuid> = f
            .orchestrator
            .agent_snapshots()
            .await
            .iter()
            .filter_map(|a| a.current_task)
            .collect();
        if running.is_empty() {
            break;
        }
        for task_id in running {
            f.orchestrator.complete(task_id).await.expect("complete");
        }
    }

    for task_id in tasks {
        assert_eq!(
            f.orchestrator.task(task_id).await.expect("task").status,
            TaskStatus::Completed
        );
    }
}

// ---------------------------------------------------------------------------
// Recycling: the per-agent task limit retires agents, the floor recovers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_recycle_policy_and_floor_restoration() {
    let mut config = coding_pool_config(1, 4);
    config.max_tasks_per_agent = 1;
    let f = fixture(config).await;
    let first_agent = f.orchestrator.agent_snapshots().await[0].id;

    let task = f
        .orchestrator
        .enqueue("code", 5, serde_json::Value::Null)
        .await
        .expect("enqueue");
    f.orchestrator.complete(task).await.expect("complete");

    // The worn agent was retired after finishing its task.
    assert!(f
        .orchestrator
        .agent_snapshots()
        .await
        .iter()
        .all(|a| a.id != first_agent));
    assert_eq!(f.host.terminations.load(Ordering::SeqCst), 1);

    // The scaler restores the min floor with a fresh agent.
    f.orchestrator.scale_round().await;
    let agents = f.orchestrator.agent_snapshots().await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].tasks_completed, 0);
}

// ---------------------------------------------------------------------------
// Event stream: result egress for terminal states
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_event_stream_carries_terminal_results() {
    let f = fixture(coding_pool_config(1, 4)).await;
    let mut events = f.orchestrator.subscribe();

    let ok_task = f
        .orchestrator
        .enqueue("code", 5, serde_json::json!({"job": "ok"}))
        .await
        .expect("enqueue");
    f.orchestrator.complete(ok_task).await.expect("complete");

    let bad_task = f
        .orchestrator
        .enqueue("code", 5, serde_json::json!({"job": "bad"}))
        .await
        .expect("enqueue");
    f.orchestrator.fail(bad_task, "exit 1").await.expect("fail");

    let mut saw_assigned = 0;
    let mut saw_completed = false;
    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestratorEvent::TaskAssigned { .. } => saw_assigned += 1,
            OrchestratorEvent::TaskCompleted { task_id, agent_id: _, duration_ms: _ } => {
                assert_eq!(task_id, ok_task);
                saw_completed = true;
            }
            OrchestratorEvent::TaskFailed { task_id, reason, payload, .. } => {
                assert_eq!(task_id, bad_task);
                assert_eq!(reason, "exit 1");
                assert_eq!(payload, serde_json::json!({"job": "bad"}));
                saw_failed = true;
            }
            _ => {}
        }
    }
    assert_eq!(saw_assigned, 2);
    assert!(saw_completed);
    assert!(saw_failed);
}

// ---------------------------------------------------------------------------
// Unhealthy busy agent: in-flight task fails, caller chooses to requeue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unhealthy_busy_agent_task_requeued_by_caller() {
    let f = fixture(coding_pool_config(2, 4)).await;
    let task = f
        .orchestrator
        .enqueue("code", 5, serde_json::Value::Null)
        .await
        .expect("enqueue");
    let agent = f
        .orchestrator
        .agent_snapshots()
        .await
        .iter()
        .find(|a| a.current_task == Some(task))
        .expect("assigned agent")
        .id;

    f.probe.set_sick(agent, true);
    for _ in 0..3 {
        f.orchestrator.probe_round().await;
    }
    assert!(matches!(
        f.orchestrator.task(task).await.expect("task").status,
        TaskStatus::Failed { .. }
    ));

    // Retry is the caller's decision: requeue lands on the healthy agent.
    f.orchestrator.requeue(task).await.expect("requeue");
    let record = f.orchestrator.task(task).await.expect("task");
    assert_eq!(record.status, TaskStatus::Assigned);
    assert_ne!(record.assigned_agent, Some(agent));
}
