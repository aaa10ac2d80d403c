use crate::lifecycle::LifecycleManager;
use crate::queue::TaskQueue;
use crate::registry::PoolRegistry;
use crate::scheduler::Scheduler;
use crate::strategy::{PoolSignals, ScalingPolicy, ScalingSignal};
use crate::types::AgentStatus;
use flotilla_core::config::ScalingConfig;
use flotilla_core::events::{EventBus, OrchestratorEvent, TerminationReason};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Consecutive-tick counters backing the dwell debounce.
#[derive(Debug, Default, Clone, Copy)]
struct DwellState {
    up: u32,
    down: u32,
}

/// Closed-loop pool sizing.
///
/// Each tick reads queue depth and occupancy per pool, debounces the
/// policy's judgement over the configured dwell ticks, and hands spawn and
/// graceful-retire decisions to the lifecycle manager. Busy agents are
/// never interrupted; the hysteresis band between the two thresholds
/// prevents oscillation.
#[derive(Clone)]
pub struct AutoScaler {
    registry: Arc<RwLock<PoolRegistry>>,
    queue: Arc<RwLock<TaskQueue>>,
    events: EventBus,
    scheduler: Scheduler,
    lifecycle: LifecycleManager,
    policy: Arc<dyn ScalingPolicy>,
    config: ScalingConfig,
    dwell: Arc<Mutex<HashMap<String, DwellState>>>,
}

impl AutoScaler {
    /// Create a scaler over the shared registry and queue.
    pub fn new(
        registry: Arc<RwLock<PoolRegistry>>,
        queue: Arc<RwLock<TaskQueue>>,
        events: EventBus,
        scheduler: Scheduler,
        lifecycle: LifecycleManager,
        policy: Arc<dyn ScalingPolicy>,
        config: ScalingConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            events,
            scheduler,
            lifecycle,
            policy,
            config,
            dwell: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Evaluate every pool once and apply any due scaling actions, then
    /// re-run dispatch so queued tasks are re-evaluated this tick.
    pub async fn tick(&self) {
        let snapshots = self.gather_signals().await;
        for (signals, capabilities) in snapshots {
            if signals.total < signals.min_agents {
                self.restore_floor(&signals, &capabilities).await;
                continue;
            }
            match self.judge(&signals) {
                Some(ScalingSignal::Up) => self.scale_up(&signals, &capabilities).await,
                Some(ScalingSignal::Down) => self.scale_down(&signals).await,
                _ => {}
            }
        }
        self.scheduler.dispatch().await;
    }

    /// Per-pool signals plus the capability set new agents would carry.
    async fn gather_signals(&self) -> Vec<(PoolSignals, HashSet<String>)> {
        // Lock order: registry before queue.
        let registry = self.registry.read().await;
        let queue = self.queue.read().await;
        registry
            .pools()
            .filter(|pool| !pool.halted)
            .map(|pool| {
                let queue_depth = pool
                    .capability_filter
                    .iter()
                    .map(|capability| queue.queue_depth(capability))
                    .sum();
                (
                    PoolSignals {
                        pool: pool.name.clone(),
                        queue_depth,
                        idle: registry.idle_count(&pool.name),
                        busy: registry.busy_count(&pool.name),
                        total: pool.agents.len(),
                        min_agents: pool.min_agents,
                        max_agents: pool.max_agents,
                    },
                    pool.capability_filter.clone(),
                )
            })
            .collect()
    }

    /// Debounce the policy's judgement. Returns an action only once the
    /// signal has held for the configured dwell ticks; any interruption
    /// resets the counters.
    fn judge(&self, signals: &PoolSignals) -> Option<ScalingSignal> {
        let verdict = self.policy.evaluate(signals);
        let Ok(mut dwell) = self.dwell.lock() else {
            return None;
        };
        let state = dwell.entry(signals.pool.clone()).or_default();
        match verdict {
            ScalingSignal::Up => {
                state.up += 1;
                state.down = 0;
                if state.up >= self.config.scale_up_dwell_ticks {
                    *state = DwellState::default();
                    return Some(ScalingSignal::Up);
                }
            }
            ScalingSignal::Down => {
                state.down += 1;
                state.up = 0;
                if state.down >= self.config.scale_down_dwell_ticks {
                    *state = DwellState::default();
                    return Some(ScalingSignal::Down);
                }
            }
            ScalingSignal::Hold => {
                *state = DwellState::default();
            }
        }
        None
    }

    /// Bring a pool back up to its `min_agents` floor after evictions.
    async fn restore_floor(&self, signals: &PoolSignals, capabilities: &HashSet<String>) {
        let missing = signals.min_agents - signals.total;
        info!(pool = %signals.pool, missing, "restoring pool floor");
        let added = self.spawn_n(signals, capabilities, missing).await;
        if added > 0 {
            self.events.emit(OrchestratorEvent::PoolScaledUp {
                pool: signals.pool.clone(),
                added,
            });
        }
    }

    /// Spawn the lesser of the observed backlog and the per-tick ramp
    /// bound, capped by the pool's headroom.
    async fn scale_up(&self, signals: &PoolSignals, capabilities: &HashSet<String>) {
        let headroom = signals.max_agents.saturating_sub(signals.total);
        let wanted = signals
            .queue_depth
            .min(self.config.max_spawn_per_tick)
            .min(headroom);
        if wanted == 0 {
            return;
        }
        let added = self.spawn_n(signals, capabilities, wanted).await;
        if added > 0 {
            info!(pool = %signals.pool, added, queue_depth = signals.queue_depth, "scaled up");
            self.events.emit(OrchestratorEvent::PoolScaledUp {
                pool: signals.pool.clone(),
                added,
            });
        }
    }

    async fn spawn_n(
        &self,
        signals: &PoolSignals,
        capabilities: &HashSet<String>,
        count: usize,
    ) -> usize {
        let mut added = 0;
        for _ in 0..count {
            match self.lifecycle.spawn(&signals.pool, capabilities.clone()).await {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!(pool = %signals.pool, error = %e, "scale-up spawn failed");
                    break;
                }
            }
        }
        added
    }

    /// Gracefully retire idle agents down toward the idle threshold,
    /// never touching a busy agent and never undercutting `min_agents`.
    async fn scale_down(&self, signals: &PoolSignals) {
        let surplus = signals
            .idle
            .saturating_sub(self.config.scale_down_idle_threshold);
        let count = surplus
            .min(self.config.max_spawn_per_tick)
            .min(signals.total.saturating_sub(signals.min_agents));
        if count == 0 {
            return;
        }

        let victims: Vec<Uuid> = {
            let registry = self.registry.read().await;
            let mut idle: Vec<_> = registry
                .agents()
                .filter(|a| a.pool == signals.pool && a.status == AgentStatus::Idle)
                .map(|a| (a.tasks_completed, a.id))
                .collect();
            // Retire the most worn instances first.
            idle.sort_by(|a, b| b.cmp(a));
            idle.into_iter().take(count).map(|(_, id)| id).collect()
        };

        let mut removed = 0;
        for agent_id in victims {
            match self
                .lifecycle
                .recycle(agent_id, TerminationReason::ScaleDown)
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => warn!(agent = %agent_id, error = %e, "scale-down retire failed"),
            }
        }
        if removed > 0 {
            info!(pool = %signals.pool, removed, idle = signals.idle, "scaled down");
            self.events.emit(OrchestratorEvent::PoolScaledDown {
                pool: signals.pool.clone(),
                removed,
            });
        }
    }

    /// Start the scaling loop on its own interval, independent of the
    /// health monitor's.
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
