use crate::types::{AgentRecord, AgentStatus, Pool};
use flotilla_core::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

/// Single source of truth for pool and agent membership.
///
/// All mutations go through this table so the pool-bound and
/// status-machine invariants are checked in one place. The struct itself
/// is synchronous; the engine wraps it in `Arc<RwLock<_>>` and every
/// mutating caller holds the write guard, so no intermediate state is
/// observable.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: HashMap<String, Pool>,
    agents: HashMap<Uuid, AgentRecord>,
}

/// Point-in-time occupancy summary of one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Pool name.
    pub name: String,
    /// Capability filter, sorted for stable output.
    pub capabilities: Vec<String>,
    /// Lower scaling bound.
    pub min_agents: usize,
    /// Upper scaling bound.
    pub max_agents: usize,
    /// Agents currently idle.
    pub idle: usize,
    /// Agents currently executing a task.
    pub busy: usize,
    /// Agents excluded as unhealthy.
    pub unhealthy: usize,
    /// Agents being drained for removal.
    pub terminating: usize,
    /// Whether scheduling for this pool is halted.
    pub halted: bool,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pool.
    ///
    /// Fails with [`FlotillaError::Config`] if the name is already taken
    /// or `min > max`.
    pub fn register_pool(
        &mut self,
        name: &str,
        capability_filter: HashSet<String>,
        min_agents: usize,
        max_agents: usize,
    ) -> FlotillaResult<()> {
        if min_agents > max_agents {
            return Err(FlotillaError::Config(format!(
                "pool '{name}': min_agents ({min_agents}) exceeds max_agents ({max_agents})"
            )));
        }
        if self.pools.contains_key(name) {
            return Err(FlotillaError::Config(format!(
                "pool '{name}' is already registered"
            )));
        }
        self.pools.insert(
            name.to_string(),
            Pool::new(name, capability_filter, min_agents, max_agents),
        );
        Ok(())
    }

    /// Add a fresh idle agent to a pool.
    ///
    /// Fails with [`FlotillaError::CapacityExceeded`] when the pool is at
    /// `max_agents`.
    pub fn add_agent(
        &mut self,
        pool_name: &str,
        capabilities: HashSet<String>,
    ) -> FlotillaResult<Uuid> {
        let pool = self
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| FlotillaError::Config(format!("unknown pool '{pool_name}'")))?;
        if pool.at_capacity() {
            return Err(FlotillaError::CapacityExceeded {
                pool: pool_name.to_string(),
            });
        }
        let agent = AgentRecord::new(pool_name, capabilities);
        let id = agent.id;
        pool.agents.insert(id);
        self.agents.insert(id, agent);
        Ok(id)
    }

    /// Remove an agent and return its final record.
    ///
    /// Fails with [`FlotillaError::AgentBusy`] when the agent still holds
    /// a task and `force` is not set. The forced path is used for
    /// hard-timeout eviction; the caller is responsible for failing the
    /// returned record's in-flight task.
    pub fn remove_agent(&mut self, agent_id: Uuid, force: bool) -> FlotillaResult<AgentRecord> {
        let agent = self
            .agents
            .get(&agent_id)
            .ok_or(FlotillaError::UnknownAgent(agent_id))?;
        if agent.current_task.is_some() && !force {
            return Err(FlotillaError::AgentBusy { agent: agent_id });
        }
        // Unwrap-free removal: presence was just checked.
        let Some(agent) = self.agents.remove(&agent_id) else {
            return Err(FlotillaError::UnknownAgent(agent_id));
        };
        if let Some(pool) = self.pools.get_mut(&agent.pool) {
            pool.agents.remove(&agent_id);
        } else {
            warn!(agent = %agent_id, pool = %agent.pool, "removed agent had no owning pool");
        }
        Ok(agent)
    }

    /// Change an agent's status, validating the transition against the
    /// state machine. Setting the current status again is a no-op.
    pub fn set_status(&mut self, agent_id: Uuid, new_status: AgentStatus) -> FlotillaResult<()> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(FlotillaError::UnknownAgent(agent_id))?;
        if agent.status == new_status {
            return Ok(());
        }
        if !agent.status.can_transition(new_status) {
            return Err(FlotillaError::InvalidTransition {
                agent: agent_id,
                from: agent.status.to_string(),
                to: new_status.to_string(),
            });
        }
        agent.status = new_status;
        Ok(())
    }

    /// Idle, healthy agents able to execute `capability`, from non-halted
    /// pools whose filter accepts it. Unordered; the scheduler's strategy
    /// picks among them.
    pub fn find_eligible(&self, capability: &str) -> Vec<&AgentRecord> {
        self.agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle)
            .filter(|a| a.has_capability(capability))
            .filter(|a| {
                self.pools
                    .get(&a.pool)
                    .is_some_and(|p| !p.halted && p.accepts(capability))
            })
            .collect()
    }

    /// Whether any registered pool accepts `capability` at all. Used to
    /// reject tasks at enqueue time instead of queueing them forever.
    pub fn has_pool_for(&self, capability: &str) -> bool {
        self.pools.values().any(|p| p.accepts(capability))
    }

    /// Halt scheduling for a pool after a fatal invariant violation.
    pub fn halt_pool(&mut self, name: &str) {
        if let Some(pool) = self.pools.get_mut(name) {
            pool.halted = true;
        }
    }

    /// Look up an agent record.
    pub fn agent(&self, agent_id: Uuid) -> Option<&AgentRecord> {
        self.agents.get(&agent_id)
    }

    pub(crate) fn agent_mut(&mut self, agent_id: Uuid) -> Option<&mut AgentRecord> {
        self.agents.get_mut(&agent_id)
    }

    /// Look up a pool.
    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    /// Iterate all pools.
    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    /// Iterate all agent records.
    pub fn agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// Number of agents owned by a pool.
    pub fn agent_count(&self, pool_name: &str) -> usize {
        self.pools.get(pool_name).map_or(0, |p| p.agents.len())
    }

    /// Idle agents in a pool.
    pub fn idle_count(&self, pool_name: &str) -> usize {
        self.count_in(pool_name, AgentStatus::Idle)
    }

    /// Busy agents in a pool.
    pub fn busy_count(&self, pool_name: &str) -> usize {
        self.count_in(pool_name, AgentStatus::Busy)
    }

    fn count_in(&self, pool_name: &str, status: AgentStatus) -> usize {
        self.agents
            .values()
            .filter(|a| a.pool == pool_name && a.status == status)
            .count()
    }

    /// Occupancy snapshots for every pool, sorted by name.
    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<PoolSnapshot> = self
            .pools
            .values()
            .map(|pool| {
                let mut capabilities: Vec<String> =
                    pool.capability_filter.iter().cloned().collect();
                capabilities.sort();
                PoolSnapshot {
                    name: pool.name.clone(),
                    capabilities,
                    min_agents: pool.min_agents,
                    max_agents: pool.max_agents,
                    idle: self.count_in(&pool.name, AgentStatus::Idle),
                    busy: self.count_in(&pool.name, AgentStatus::Busy),
                    unhealthy: self.count_in(&pool.name, AgentStatus::Unhealthy),
                    terminating: self.count_in(&pool.name, AgentStatus::Terminating),
                    halted: pool.halted,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|t| (*t).to_string()).collect()
    }

    fn registry_with_pool() -> PoolRegistry {
        let mut registry = PoolRegistry::new();
        registry
            .register_pool("coding", caps(&["code"]), 1, 4)
            .unwrap();
        registry
    }

    #[test]
    fn test_register_pool_rejects_duplicate() {
        let mut registry = registry_with_pool();
        let err = registry
            .register_pool("coding", caps(&["code"]), 0, 2)
            .unwrap_err();
        assert!(matches!(err, FlotillaError::Config(_)));
    }

    #[test]
    fn test_register_pool_rejects_min_above_max() {
        let mut registry = PoolRegistry::new();
        let err = registry
            .register_pool("bad", caps(&["code"]), 3, 1)
            .unwrap_err();
        assert!(matches!(err, FlotillaError::Config(_)));
    }

    #[test]
    fn test_add_agent_respects_capacity() {
        let mut registry = PoolRegistry::new();
        registry
            .register_pool("tiny", caps(&["code"]), 0, 2)
            .unwrap();
        registry.add_agent("tiny", caps(&["code"])).unwrap();
        registry.add_agent("tiny", caps(&["code"])).unwrap();
        let err = registry.add_agent("tiny", caps(&["code"])).unwrap_err();
        assert!(matches!(err, FlotillaError::CapacityExceeded { pool } if pool == "tiny"));
    }

    #[test]
    fn test_remove_busy_agent_requires_force() {
        let mut registry = registry_with_pool();
        let id = registry.add_agent("coding", caps(&["code"])).unwrap();
        registry.set_status(id, AgentStatus::Busy).unwrap();
        registry.agent_mut(id).unwrap().current_task = Some(Uuid::new_v4());

        let err = registry.remove_agent(id, false).unwrap_err();
        assert!(matches!(err, FlotillaError::AgentBusy { agent } if agent == id));
        // The agent is unchanged.
        assert_eq!(registry.agent(id).unwrap().status, AgentStatus::Busy);

        let removed = registry.remove_agent(id, true).unwrap();
        assert!(removed.current_task.is_some());
        assert!(registry.agent(id).is_none());
        assert_eq!(registry.agent_count("coding"), 0);
    }

    #[test]
    fn test_set_status_validates_transitions() {
        let mut registry = registry_with_pool();
        let id = registry.add_agent("coding", caps(&["code"])).unwrap();

        registry.set_status(id, AgentStatus::Busy).unwrap();
        registry.set_status(id, AgentStatus::Unhealthy).unwrap();
        let err = registry.set_status(id, AgentStatus::Busy).unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidTransition { .. }));

        // Recovery is explicit, and re-setting the same status is a no-op.
        registry.set_status(id, AgentStatus::Idle).unwrap();
        registry.set_status(id, AgentStatus::Idle).unwrap();
    }

    #[test]
    fn test_find_eligible_filters_status_and_capability() {
        let mut registry = registry_with_pool();
        let idle = registry.add_agent("coding", caps(&["code"])).unwrap();
        let busy = registry.add_agent("coding", caps(&["code"])).unwrap();
        let sick = registry.add_agent("coding", caps(&["code"])).unwrap();
        registry.set_status(busy, AgentStatus::Busy).unwrap();
        registry.set_status(sick, AgentStatus::Unhealthy).unwrap();

        let eligible: Vec<Uuid> = registry
            .find_eligible("code")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(eligible, vec![idle]);
        assert!(registry.find_eligible("gpu").is_empty());
    }

    #[test]
    fn test_find_eligible_skips_halted_pool() {
        let mut registry = registry_with_pool();
        registry.add_agent("coding", caps(&["code"])).unwrap();
        registry.halt_pool("coding");
        assert!(registry.find_eligible("code").is_empty());
        // The pool still exists for enqueue-time matching.
        assert!(registry.has_pool_for("code"));
    }

    #[test]
    fn test_counts_and_snapshot() {
        let mut registry = registry_with_pool();
        let a = registry.add_agent("coding", caps(&["code"])).unwrap();
        registry.add_agent("coding", caps(&["code"])).unwrap();
        registry.set_status(a, AgentStatus::Busy).unwrap();

        assert_eq!(registry.idle_count("coding"), 1);
        assert_eq!(registry.busy_count("coding"), 1);
        assert_eq!(registry.agent_count("coding"), 2);

        let snapshots = registry.pool_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "coding");
        assert_eq!(snapshots[0].idle, 1);
        assert_eq!(snapshots[0].busy, 1);
        assert_eq!(snapshots[0].capabilities, vec!["code".to_string()]);
        assert!(!snapshots[0].halted);
    }
}
