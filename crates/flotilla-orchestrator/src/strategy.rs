use crate::types::AgentRecord;
use flotilla_core::config::StrategyKind;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Pluggable agent-selection strategy for the scheduler's assignment step.
///
/// Implementations receive the eligible candidates for one task and pick
/// the agent to dispatch to. Queue ordering (priority, FIFO) is not a
/// strategy concern; it is always honored upstream.
pub trait SelectionStrategy: Send + Sync {
    /// Strategy name for logging and identification.
    fn name(&self) -> &'static str;

    /// Pick one agent from the eligible set. `None` only if the set is
    /// empty.
    fn select(&self, candidates: &[&AgentRecord]) -> Option<Uuid>;
}

/// Build the configured selection strategy.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::LeastLoaded => Box::new(LeastLoaded),
        StrategyKind::CapabilityMatch => Box::new(CapabilityMatch),
    }
}

/// Rotates a per-pool cursor over that pool's eligible agents.
///
/// When several pools hold candidates, the first pool in name order is
/// rotated; rotation within a pool is what the strategy guarantees.
pub struct RoundRobin {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobin {
    /// Create a strategy with all cursors at zero.
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[&AgentRecord]) -> Option<Uuid> {
        let pool = candidates.iter().map(|a| a.pool.as_str()).min()?;
        let mut ids: Vec<Uuid> = candidates
            .iter()
            .filter(|a| a.pool == pool)
            .map(|a| a.id)
            .collect();
        ids.sort();
        let Ok(mut cursors) = self.cursors.lock() else {
            return ids.first().copied();
        };
        let cursor = cursors.entry(pool.to_string()).or_insert(0);
        let picked = ids[*cursor % ids.len()];
        *cursor = cursor.wrapping_add(1);
        Some(picked)
    }
}

/// Picks the agent with the fewest completed tasks, i.e. the freshest,
/// least fatigued instance.
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, candidates: &[&AgentRecord]) -> Option<Uuid> {
        candidates
            .iter()
            .min_by_key(|a| (a.tasks_completed, a.id))
            .map(|a| a.id)
    }
}

/// Prefers the agent whose capability set is the smallest superset of the
/// requirement, keeping broadly-capable agents free for narrow tasks.
pub struct CapabilityMatch;

impl SelectionStrategy for CapabilityMatch {
    fn name(&self) -> &'static str {
        "capability_match"
    }

    fn select(&self, candidates: &[&AgentRecord]) -> Option<Uuid> {
        candidates
            .iter()
            .min_by_key(|a| (a.capabilities.len(), a.tasks_completed, a.id))
            .map(|a| a.id)
    }
}

// --- Scaling ---

/// Per-pool signals the auto-scaler evaluates each tick.
#[derive(Debug, Clone)]
pub struct PoolSignals {
    /// The evaluated pool.
    pub pool: String,
    /// Queued tasks whose capability maps to this pool.
    pub queue_depth: usize,
    /// Idle agents.
    pub idle: usize,
    /// Busy agents.
    pub busy: usize,
    /// All agents owned by the pool.
    pub total: usize,
    /// Lower scaling bound.
    pub min_agents: usize,
    /// Upper scaling bound.
    pub max_agents: usize,
}

/// Instantaneous judgement for one pool on one tick. Dwell/debounce state
/// lives in the scaler, not the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingSignal {
    /// The pool is backlogged and has headroom.
    Up,
    /// The pool is over-provisioned and above its floor.
    Down,
    /// Inside the hysteresis band; no action.
    Hold,
}

/// Pluggable scaling judgement.
pub trait ScalingPolicy: Send + Sync {
    /// Policy name for logging and identification.
    fn name(&self) -> &'static str;

    /// Evaluate the signals for one pool.
    fn evaluate(&self, signals: &PoolSignals) -> ScalingSignal;
}

/// Threshold policy: scale up on queue backlog, down on idle surplus,
/// hold inside the band between the two.
pub struct ThresholdPolicy {
    /// Queue depth above which the pool is backlogged.
    pub scale_up_queue_threshold: usize,
    /// Idle count above which the pool is over-provisioned.
    pub scale_down_idle_threshold: usize,
}

impl ScalingPolicy for ThresholdPolicy {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn evaluate(&self, signals: &PoolSignals) -> ScalingSignal {
        if signals.queue_depth > self.scale_up_queue_threshold
            && signals.total < signals.max_agents
        {
            ScalingSignal::Up
        } else if signals.idle > self.scale_down_idle_threshold
            && signals.total > signals.min_agents
        {
            ScalingSignal::Down
        } else {
            ScalingSignal::Hold
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn caps(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|t| (*t).to_string()).collect()
    }

    fn agent(pool: &str, tags: &[&str], tasks_completed: u64) -> AgentRecord {
        let mut agent = AgentRecord::new(pool, caps(tags));
        agent.tasks_completed = tasks_completed;
        agent
    }

    #[test]
    fn test_round_robin_rotates_within_pool() {
        let strategy = RoundRobin::new();
        let a = agent("coding", &["code"], 0);
        let b = agent("coding", &["code"], 0);
        let candidates = vec![&a, &b];

        let first = strategy.select(&candidates).unwrap();
        let second = strategy.select(&candidates).unwrap();
        let third = strategy.select(&candidates).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_round_robin_empty_candidates() {
        let strategy = RoundRobin::new();
        assert!(strategy.select(&[]).is_none());
    }

    #[test]
    fn test_least_loaded_picks_freshest() {
        let strategy = LeastLoaded;
        let worn = agent("coding", &["code"], 40);
        let fresh = agent("coding", &["code"], 2);
        assert_eq!(strategy.select(&[&worn, &fresh]), Some(fresh.id));
    }

    #[test]
    fn test_capability_match_prefers_narrow_agent() {
        let strategy = CapabilityMatch;
        let broad = agent("mixed", &["code", "io", "net"], 0);
        let narrow = agent("coding", &["code"], 0);
        assert_eq!(strategy.select(&[&broad, &narrow]), Some(narrow.id));
    }

    #[test]
    fn test_threshold_policy_bands() {
        let policy = ThresholdPolicy {
            scale_up_queue_threshold: 3,
            scale_down_idle_threshold: 2,
        };
        let mut signals = PoolSignals {
            pool: "coding".to_string(),
            queue_depth: 5,
            idle: 0,
            busy: 2,
            total: 2,
            min_agents: 1,
            max_agents: 4,
        };
        assert_eq!(policy.evaluate(&signals), ScalingSignal::Up);

        // Backlogged but already at max: hold.
        signals.total = 4;
        assert_eq!(policy.evaluate(&signals), ScalingSignal::Hold);

        // Idle surplus above the floor: down.
        signals.queue_depth = 0;
        signals.idle = 3;
        signals.busy = 1;
        assert_eq!(policy.evaluate(&signals), ScalingSignal::Down);

        // Idle surplus at the floor: hold.
        signals.total = 1;
        assert_eq!(policy.evaluate(&signals), ScalingSignal::Hold);

        // Inside the hysteresis band: hold.
        signals.total = 2;
        signals.idle = 1;
        assert_eq!(policy.evaluate(&signals), ScalingSignal::Hold);
    }
}
