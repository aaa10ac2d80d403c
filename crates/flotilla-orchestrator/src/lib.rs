//! Agent pool control plane: capability-scoped pools, priority
//! scheduling, health monitoring, auto-scaling, and agent lifecycle.
//!
//! Tasks enter the scheduler's queue; the scheduler asks the pool registry
//! for eligible, healthy, idle agents and dispatches under the configured
//! strategy. In parallel the health monitor probes every agent on a fixed
//! interval and the auto-scaler reads queue depth and occupancy to grow or
//! shrink each pool, handing spawn/retire actions to the lifecycle
//! manager. The registry is the single synchronization point for shared
//! state.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level engine wiring all components from a config.
//! - [`PoolRegistry`] — Single source of truth for pools and agents.
//! - [`Scheduler`] — Matches queued tasks to eligible agents.
//! - [`HealthMonitor`] — Probes agents and drives the health state machine.
//! - [`AutoScaler`] — Closed-loop pool sizing with dwell debouncing.
//! - [`LifecycleManager`] — Executes spawn/terminate/recycle decisions.
//! - [`AgentHost`] / [`HealthProbe`] — Seams to the hosting mechanism.

/// Top-level engine assembling all components.
pub mod engine;
/// Health probing and the per-agent health state machine.
pub mod health;
/// Agent spawn/terminate/recycle against the hosting mechanism.
pub mod lifecycle;
/// Priority task table.
pub mod queue;
/// Pool and agent membership tables.
pub mod registry;
/// Closed-loop pool sizing.
pub mod scaler;
/// Task-to-agent assignment and task state transitions.
pub mod scheduler;
/// Pluggable selection strategies and scaling policies.
pub mod strategy;
/// Shared data model (agents, pools, tasks, probe results).
pub mod types;

pub use engine::Orchestrator;
pub use health::{HealthMonitor, HealthProbe, StaticProbe};
pub use lifecycle::{AgentHost, LifecycleManager, NoopHost};
pub use queue::{CancelOutcome, TaskQueue};
pub use registry::{PoolRegistry, PoolSnapshot};
pub use scaler::AutoScaler;
pub use scheduler::Scheduler;
pub use strategy::{
    strategy_for, CapabilityMatch, LeastLoaded, PoolSignals, RoundRobin, ScalingPolicy,
    ScalingSignal, SelectionStrategy, ThresholdPolicy,
};
pub use types::{AgentRecord, AgentStatus, HealthCheckResult, Pool, Task, TaskStatus};
