//! Core types and error definitions for the Flotilla control plane.
//!
//! This crate provides the foundational types shared across all Flotilla
//! crates: the unified error enum, the validated configuration structs the
//! orchestrator is built from, and the structured event stream it emits.
//!
//! # Main types
//!
//! - [`FlotillaError`] — Unified error enum for all Flotilla subsystems.
//! - [`FlotillaResult`] — Convenience alias for `Result<T, FlotillaError>`.
//! - [`config::OrchestratorConfig`] — Validated top-level configuration.
//! - [`events::OrchestratorEvent`] — Structured control-plane event.
//! - [`events::EventBus`] — Broadcast channel carrying the event stream.

/// Validated configuration structs for pools, health checks, and scaling.
pub mod config;
/// Structured control-plane events and the broadcast bus carrying them.
pub mod events;

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Flotilla control plane.
///
/// Registry-invariant violations (capacity, duplicate pools, busy agents)
/// are always rejected synchronously to the caller. Health and scaling
/// outcomes are reported via the event stream, not as errors.
#[derive(Debug, thiserror::Error)]
pub enum FlotillaError {
    /// Invalid configuration (bad pool bounds, duplicate names, zero
    /// thresholds). Rejected at startup.
    #[error("Config error: {0}")]
    Config(String),

    /// A spawn would exceed the pool's `max_agents` bound. Not fatal; the
    /// caller may retry once capacity frees up.
    #[error("Pool '{pool}' is at maximum capacity")]
    CapacityExceeded {
        /// Name of the pool that is full.
        pool: String,
    },

    /// A task was enqueued with a capability no registered pool accepts.
    #[error("No pool accepts capability '{capability}'")]
    NoEligiblePool {
        /// The unmatched capability tag.
        capability: String,
    },

    /// An attempt to remove a working agent without the `force` flag.
    #[error("Agent {agent} is busy")]
    AgentBusy {
        /// The agent that still holds a task.
        agent: Uuid,
    },

    /// A health probe exceeded its timeout. Recorded as a probe failure,
    /// never surfaced to task callers.
    #[error("Health probe timed out for agent {agent}")]
    ProbeTimeout {
        /// The agent whose probe timed out.
        agent: Uuid,
    },

    /// The agent-hosting side effect failed; the registry entry has been
    /// rolled back.
    #[error("Hosting error: {0}")]
    Hosting(String),

    /// A status change that the agent state machine does not allow.
    #[error("Invalid status transition for agent {agent}: {from} -> {to}")]
    InvalidTransition {
        /// The agent whose status change was rejected.
        agent: Uuid,
        /// Status before the rejected change.
        from: String,
        /// The requested target status.
        to: String,
    },

    /// An agent id with no record in the registry.
    #[error("Unknown agent: {0}")]
    UnknownAgent(Uuid),

    /// A task id with no record in the queue.
    #[error("Unknown task: {0}")]
    UnknownTask(Uuid),

    /// A task operation invalid for the task's current state (e.g.
    /// requeueing a task that has not failed).
    #[error("Task error: {0}")]
    Task(String),

    /// An unrecoverable internal inconsistency (e.g. an assigned task with
    /// no matching agent). Halts the affected pool's scheduling.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`FlotillaError`].
pub type FlotillaResult<T> = Result<T, FlotillaError>;
