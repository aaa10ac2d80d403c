use crate::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Top-level orchestrator configuration.
///
/// Deserialized from TOML by the CLI (or constructed directly by embedders)
/// and passed into the core as a validated struct. [`validate`] must be
/// called before the orchestrator accepts it.
///
/// [`validate`]: OrchestratorConfig::validate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Pool definitions. At least one pool is required.
    pub pools: Vec<PoolConfig>,
    /// Agent-selection strategy used by the scheduler.
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Health monitor settings.
    #[serde(default)]
    pub health: HealthConfig,
    /// Auto-scaler settings.
    #[serde(default)]
    pub scaling: ScalingConfig,
    /// Recycle an agent after it has completed this many tasks.
    #[serde(default = "default_max_tasks_per_agent")]
    pub max_tasks_per_agent: u64,
    /// How long a graceful recycle waits for an agent to drain before
    /// escalating to forced removal.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// How long a cancelled in-flight task may go unacknowledged before it
    /// is treated as failed.
    #[serde(default = "default_cancel_ack_timeout_secs")]
    pub cancel_ack_timeout_secs: u64,
}

/// Definition of a single agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Unique pool name.
    pub name: String,
    /// Capability tags a task must carry to be eligible for this pool.
    pub capabilities: Vec<String>,
    /// Lower scaling bound.
    #[serde(default)]
    pub min_agents: usize,
    /// Upper scaling bound.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Per-probe timeout in seconds; an overrun counts as a failure.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Consecutive probe failures before an agent is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive probe successes before an unhealthy agent recovers.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

/// Auto-scaler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Seconds between scaler ticks.
    #[serde(default = "default_scaling_interval_secs")]
    pub interval_secs: u64,
    /// Queue depth above which a pool is considered backlogged.
    #[serde(default = "default_scale_up_queue_threshold")]
    pub scale_up_queue_threshold: usize,
    /// Consecutive backlogged ticks required before scaling up.
    #[serde(default = "default_dwell_ticks")]
    pub scale_up_dwell_ticks: u32,
    /// Idle-agent count above which a pool is considered over-provisioned.
    #[serde(default = "default_scale_down_idle_threshold")]
    pub scale_down_idle_threshold: usize,
    /// Consecutive over-provisioned ticks required before scaling down.
    #[serde(default = "default_dwell_ticks")]
    pub scale_down_dwell_ticks: u32,
    /// Ramp bound: agents spawned or retired per pool per tick.
    #[serde(default = "default_max_spawn_per_tick")]
    pub max_spawn_per_tick: usize,
}

/// Agent-selection strategy for the scheduler's assignment step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Rotate a per-pool cursor over eligible agents.
    #[default]
    RoundRobin,
    /// Pick the agent with the fewest completed tasks.
    LeastLoaded,
    /// Prefer the agent whose capability set is the smallest superset of
    /// the requirement.
    CapabilityMatch,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::RoundRobin => write!(f, "round_robin"),
            StrategyKind::LeastLoaded => write!(f, "least_loaded"),
            StrategyKind::CapabilityMatch => write!(f, "capability_match"),
        }
    }
}

fn default_max_tasks_per_agent() -> u64 {
    500
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_cancel_ack_timeout_secs() -> u64 {
    10
}
fn default_max_agents() -> usize {
    8
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_recovery_threshold() -> u32 {
    2
}
fn default_scaling_interval_secs() -> u64 {
    10
}
fn default_scale_up_queue_threshold() -> usize {
    3
}
fn default_scale_down_idle_threshold() -> usize {
    2
}
fn default_dwell_ticks() -> u32 {
    2
}
fn default_max_spawn_per_tick() -> usize {
    1
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scaling_interval_secs(),
            scale_up_queue_threshold: default_scale_up_queue_threshold(),
            scale_up_dwell_ticks: default_dwell_ticks(),
            scale_down_idle_threshold: default_scale_down_idle_threshold(),
            scale_down_dwell_ticks: default_dwell_ticks(),
            max_spawn_per_tick: default_max_spawn_per_tick(),
        }
    }
}

impl HealthConfig {
    /// Probe round interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl ScalingConfig {
    /// Scaler tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl OrchestratorConfig {
    /// Validate the configuration.
    ///
    /// Checks pool bounds (`min_agents <= max_agents`, `max_agents >= 1`),
    /// name uniqueness, non-empty capability filters, and non-zero health
    /// thresholds. Returns [`FlotillaError::Config`] on the first problem
    /// found.
    pub fn validate(&self) -> FlotillaResult<()> {
        if self.pools.is_empty() {
            return Err(FlotillaError::Config(
                "at least one pool must be defined".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(FlotillaError::Config("pool name must not be empty".to_string()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(FlotillaError::Config(format!(
                    "duplicate pool name '{}'",
                    pool.name
                )));
            }
            if pool.capabilities.is_empty() {
                return Err(FlotillaError::Config(format!(
                    "pool '{}' has an empty capability filter",
                    pool.name
                )));
            }
            if pool.max_agents == 0 {
                return Err(FlotillaError::Config(format!(
                    "pool '{}': max_agents must be at least 1",
                    pool.name
                )));
            }
            if pool.min_agents > pool.max_agents {
                return Err(FlotillaError::Config(format!(
                    "pool '{}': min_agents ({}) exceeds max_agents ({})",
                    pool.name, pool.min_agents, pool.max_agents
                )));
            }
        }

        if self.health.unhealthy_threshold == 0 || self.health.recovery_threshold == 0 {
            return Err(FlotillaError::Config(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if self.scaling.scale_up_dwell_ticks == 0 || self.scaling.scale_down_dwell_ticks == 0 {
            return Err(FlotillaError::Config(
                "scaling dwell ticks must be at least 1".to_string(),
            ));
        }
        if self.scaling.max_spawn_per_tick == 0 {
            return Err(FlotillaError::Config(
                "max_spawn_per_tick must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Graceful drain timeout for recycle and scale-down.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Acknowledgement timeout for cooperative cancellation.
    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_ack_timeout_secs)
    }
}
