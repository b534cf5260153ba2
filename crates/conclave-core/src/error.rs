use crate::{AgentId, TaskId};
use thiserror::Error;

/// A convenience `Result` alias using [`ConclaveError`].
pub type ConclaveResult<T> = Result<T, ConclaveError>;

/// Top-level error type for the coordination engine.
///
/// Variants fall into three groups: submission errors rejected at the
/// boundary, task failures that are eligible for retry, and internal errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConclaveError {
    /// A submitted task references a missing task, itself, or closes a cycle.
    #[error("Invalid dependency for task {task_id}: {reason}")]
    InvalidDependency {
        /// The task being submitted.
        task_id: TaskId,
        /// Human-readable explanation.
        reason: String,
    },

    /// A task with the same id is already tracked.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// The scheduler already tracks `task_queue_size` non-terminal tasks.
    #[error("Task queue full ({limit} active tasks)")]
    QueueFull {
        /// Configured bound.
        limit: usize,
    },

    /// No registered agent can take the task right now.
    #[error("No eligible agent for task {0}")]
    NoEligibleAgent(TaskId),

    /// The agent is already running `maxConcurrentTasks` tasks.
    #[error("Agent {0} is overloaded")]
    AgentOverloaded(AgentId),

    /// The registry already tracks `max_concurrent_agents` live agents.
    #[error("Agent limit reached ({limit} agents)")]
    AgentLimitReached {
        /// Configured bound.
        limit: usize,
    },

    /// A resource wait exceeded its timeout.
    #[error("Timed out after {timeout_ms}ms waiting for resource '{resource_id}'")]
    AcquireTimeout {
        /// Resource that was requested.
        resource_id: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The wait was aborted to break a wait-for cycle.
    #[error("Deadlock detected while waiting for resource '{resource_id}'")]
    DeadlockDetected {
        /// Resource the aborted waiter was queued on.
        resource_id: String,
    },

    /// The agent went away (error state, termination, missed heartbeats).
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// The execution collaborator did not finish within the task timeout.
    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// The execution collaborator reported a failure.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The task was cancelled by a caller.
    #[error("Task {0} cancelled")]
    Cancelled(TaskId),

    /// The agent does not hold the resource it tried to release.
    #[error("Agent {agent_id} does not hold resource '{resource_id}'")]
    ResourceNotHeld {
        /// Resource named in the release.
        resource_id: String,
        /// Agent that attempted the release.
        agent_id: AgentId,
    },

    /// Unknown task id.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Unknown agent id.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// A state transition was requested that the state machine forbids.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Internal state no longer satisfies a safety invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The engine is not running.
    #[error("Engine is shut down")]
    Shutdown,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

impl ConclaveError {
    /// Whether a task that failed with this error may be retried with backoff.
    ///
    /// Structural problems (bad dependencies, cancellation, invariant
    /// violations) are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConclaveError::AcquireTimeout { .. }
                | ConclaveError::DeadlockDetected { .. }
                | ConclaveError::AgentUnavailable(_)
                | ConclaveError::ExecutionTimeout(_)
                | ConclaveError::Execution(_)
                | ConclaveError::NoEligibleAgent(_)
        )
    }

    /// Short machine-readable tag, used for metrics breakdowns.
    pub fn kind(&self) -> &'static str {
        match self {
            ConclaveError::InvalidDependency { .. } => "invalid_dependency",
            ConclaveError::DuplicateTask(_) => "duplicate_task",
            ConclaveError::QueueFull { .. } => "queue_full",
            ConclaveError::NoEligibleAgent(_) => "no_eligible_agent",
            ConclaveError::AgentOverloaded(_) => "agent_overloaded",
            ConclaveError::AgentLimitReached { .. } => "agent_limit_reached",
            ConclaveError::AcquireTimeout { .. } => "acquire_timeout",
            ConclaveError::DeadlockDetected { .. } => "deadlock_detected",
            ConclaveError::AgentUnavailable(_) => "agent_unavailable",
            ConclaveError::ExecutionTimeout(_) => "execution_timeout",
            ConclaveError::Execution(_) => "execution",
            ConclaveError::Cancelled(_) => "cancelled",
            ConclaveError::ResourceNotHeld { .. } => "resource_not_held",
            ConclaveError::TaskNotFound(_) => "task_not_found",
            ConclaveError::AgentNotFound(_) => "agent_not_found",
            ConclaveError::InvalidTransition(_) => "invalid_transition",
            ConclaveError::InvariantViolation(_) => "invariant_violation",
            ConclaveError::Config(_) => "config",
            ConclaveError::Shutdown => "shutdown",
            ConclaveError::Json(_) => "json",
            ConclaveError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for ConclaveError {
    fn from(e: serde_json::Error) -> Self {
        ConclaveError::Json(e.to_string())
    }
}

impl From<std::io::Error> for ConclaveError {
    fn from(e: std::io::Error) -> Self {
        ConclaveError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for ConclaveError {
    fn from(e: toml::de::Error) -> Self {
        ConclaveError::Config(e.to_string())
    }
}
