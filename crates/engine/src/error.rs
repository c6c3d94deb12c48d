//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestration core (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Lookup / precondition errors ------

    /// The requested workflow does not exist.
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// Only an active workflow may be executed.
    #[error("workflow {id} is not active (status: {status})")]
    WorkflowNotActive { id: Uuid, status: String },

    /// The requested execution does not exist.
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// The stored definition is malformed.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // ------ Graph validation errors ------

    /// The dependency graph contains a cycle.
    #[error("circular dependency detected at '{0}'")]
    CircularDependency(String),

    /// A `depends_on` entry names a task that does not exist.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    // ------ Execution errors ------

    /// The agent registry returned no executor for the key.
    #[error("no agent registered for ({agent_type}, {action})")]
    AgentUnresolvable { agent_type: String, action: String },

    /// A task's retry budget was exhausted.
    #[error("task '{task}' failed after {attempts} attempts: {message}")]
    TaskFailed {
        task: String,
        attempts: u32,
        message: String,
    },

    /// Propagation marker for tasks skipped because an upstream task
    /// failed. The display string is the persisted skip reason.
    #[error("Dependency failed")]
    DependencyFailed,

    /// A chain sub-execution did not finish within the wait cap.
    #[error("timed out after {0:?} waiting for execution {1}")]
    ExecutionTimeout(Duration, Uuid),

    /// Cancellation was observed before completion.
    #[error("execution {0} was cancelled")]
    ExecutionCancelled(Uuid),

    /// An expression condition failed to evaluate (treated as false).
    #[error("condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    /// Chain creation or execution validation failure.
    #[error("chain validation failed: {0}")]
    ChainValidation(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}
