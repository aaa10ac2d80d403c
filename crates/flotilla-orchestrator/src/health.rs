use crate::queue::TaskQueue;
use crate::registry::PoolRegistry;
use crate::scheduler::{fail_in_flight, Scheduler};
use crate::types::{AgentRecord, AgentStatus, HealthCheckResult};
use async_trait::async_trait;
use chrono::Utc;
use flotilla_core::config::HealthConfig;
use flotilla_core::events::{EventBus, OrchestratorEvent};
use flotilla_core::FlotillaError;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The probing seam: asks an agent whether it is alive.
///
/// The monitor wraps every probe in its own timeout; implementations do
/// not need to bound themselves.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one agent. `true` means healthy.
    async fn probe(&self, agent: &AgentRecord) -> bool;
}

/// Probe with a fixed answer, for tests and in-process embedding.
pub struct StaticProbe {
    healthy: bool,
}

impl StaticProbe {
    /// A probe that always reports `healthy`.
    pub fn new(healthy: bool) -> Self {
        Self { healthy }
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, _agent: &AgentRecord) -> bool {
        self.healthy
    }
}

/// What to do with one agent after a probe round, decided under the write
/// guard.
enum Verdict {
    None,
    Recovered,
    MarkUnhealthy {
        in_flight: Option<Uuid>,
        failures: u32,
    },
}

/// Periodically probes every agent and drives the health state machine.
///
/// Health is judged by probes alone; task failures never feed these
/// counters, so application-level errors are not conflated with agent
/// liveness.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<RwLock<PoolRegistry>>,
    queue: Arc<RwLock<TaskQueue>>,
    events: EventBus,
    scheduler: Scheduler,
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a monitor over the shared registry and queue.
    pub fn new(
        registry: Arc<RwLock<PoolRegistry>>,
        queue: Arc<RwLock<TaskQueue>>,
        events: EventBus,
        scheduler: Scheduler,
        probe: Arc<dyn HealthProbe>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            events,
            scheduler,
            probe,
            config,
        }
    }

    /// Run one probe round over every agent not being terminated.
    ///
    /// Probes run concurrently, each bounded by the per-probe timeout; an
    /// overrun counts as a failure and is recorded, never surfaced. State
    /// updates are applied afterwards under the write guards so probing
    /// itself never blocks other components.
    pub async fn tick(&self) -> Vec<HealthCheckResult> {
        let targets: Vec<AgentRecord> = {
            let registry = self.registry.read().await;
            registry
                .agents()
                .filter(|a| a.status != AgentStatus::Terminating)
                .cloned()
                .collect()
        };

        let results = join_all(targets.iter().map(|agent| self.probe_one(agent))).await;

        let mut recovered_any = false;
        {
            // Lock order: registry before queue.
            let mut registry = self.registry.write().await;
            let mut queue = self.queue.write().await;
            for result in &results {
                if self.apply(&mut registry, &mut queue, result) {
                    recovered_any = true;
                }
            }
        }
        if recovered_any {
            // A recovered agent is an idle event; give it work.
            self.scheduler.dispatch().await;
        }
        results
    }

    async fn probe_one(&self, agent: &AgentRecord) -> HealthCheckResult {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.probe_timeout(), self.probe.probe(agent)).await;
        let success = match outcome {
            Ok(alive) => alive,
            Err(_) => {
                let err = FlotillaError::ProbeTimeout { agent: agent.id };
                warn!(agent = %agent.id, error = %err, "health probe timed out");
                false
            }
        };
        HealthCheckResult {
            agent_id: agent.id,
            success,
            latency: started.elapsed(),
            timestamp: Utc::now(),
        }
    }

    /// Fold one probe result into the agent's counters and status.
    /// Returns true when the agent recovered to `Idle`.
    fn apply(
        &self,
        registry: &mut PoolRegistry,
        queue: &mut TaskQueue,
        result: &HealthCheckResult,
    ) -> bool {
        let verdict = {
            let Some(agent) = registry.agent_mut(result.agent_id) else {
                // Removed since the snapshot was taken.
                return false;
            };
            if agent.status == AgentStatus::Terminating {
                return false;
            }
            agent.last_health_check_at = Some(result.timestamp);
            if result.success {
                agent.consecutive_successes += 1;
                agent.consecutive_failures = 0;
                if agent.status == AgentStatus::Unhealthy
                    && agent.consecutive_successes >= self.config.recovery_threshold
                {
                    Verdict::Recovered
                } else {
                    Verdict::None
                }
            } else {
                agent.consecutive_failures += 1;
                agent.consecutive_successes = 0;
                if agent.consecutive_failures >= self.config.unhealthy_threshold
                    && matches!(agent.status, AgentStatus::Idle | AgentStatus::Busy)
                {
                    Verdict::MarkUnhealthy {
                        in_flight: agent.current_task.take(),
                        failures: agent.consecutive_failures,
                    }
                } else {
                    Verdict::None
                }
            }
        };

        let agent_id = result.agent_id;
        match verdict {
            Verdict::None => false,
            Verdict::Recovered => {
                if let Err(e) = registry.set_status(agent_id, AgentStatus::Idle) {
                    warn!(agent = %agent_id, error = %e, "recovery transition rejected");
                    return false;
                }
                info!(agent = %agent_id, "agent recovered, rejoining pool");
                self.events
                    .emit(OrchestratorEvent::AgentRecovered { agent_id });
                true
            }
            Verdict::MarkUnhealthy { in_flight, failures } => {
                if let Err(e) = registry.set_status(agent_id, AgentStatus::Unhealthy) {
                    warn!(agent = %agent_id, error = %e, "unhealthy transition rejected");
                    return false;
                }
                // The monitor only fails the task and emits the event;
                // whether to requeue is the caller's choice.
                if let Some(task_id) = in_flight {
                    fail_in_flight(queue, &self.events, task_id, "agent became unhealthy");
                }
                warn!(agent = %agent_id, consecutive_failures = failures, "agent marked unhealthy");
                self.events.emit(OrchestratorEvent::AgentUnhealthy {
                    agent_id,
                    consecutive_failures: failures,
                });
                false
            }
        }
    }

    /// Start the probe loop. Rounds run on a fixed interval; the first
    /// round fires one interval after startup.
    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            // The interval's first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}
