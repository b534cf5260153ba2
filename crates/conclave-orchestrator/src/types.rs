use chrono::{DateTime, Utc};
use conclave_core::{AgentId, LockMode, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a task ended up terminally `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The last attempt failed with no retries left.
    MaxRetriesExceeded,
    /// A dependency failed terminally.
    DependencyFailed,
    /// A caller cancelled the task (or one of its dependencies).
    Cancelled,
    /// The failure was structural and not worth retrying.
    NonRetryable,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MaxRetriesExceeded => write!(f, "max_retries_exceeded"),
            FailureReason::DependencyFailed => write!(f, "dependency_failed"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::NonRetryable => write!(f, "non_retryable"),
        }
    }
}

/// Status of a task in the scheduler.
///
/// `created → ready → running → completed | failed`, with
/// `running → retrying → ready` while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Created,
    /// Eligible for assignment.
    Ready,
    /// Assigned and handed to the executor.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; never retried again.
    Failed {
        /// Why the task gave up.
        reason: FailureReason,
    },
    /// Waiting out a backoff delay.
    Retrying,
}

impl TaskStatus {
    /// `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

/// A named resource a task must hold while it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// Resource name.
    pub resource_id: String,
    /// Lock mode to hold it in.
    pub mode: LockMode,
}

/// What a caller submits. Unset limits fall back to the engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Pre-assigned so that tasks in one batch can reference each other.
    pub id: TaskId,
    /// Caller-defined kind of work, passed to the executor.
    pub task_type: String,
    /// Free text for logs and reports.
    pub description: String,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Optional due time; nearer deadlines raise the score.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Capabilities the assigned agent must have.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Locks taken before execution, in this order.
    #[serde(default)]
    pub resources: Vec<ResourceClaim>,
    /// Opaque executor input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides `retry.max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides `orchestrator.default_task_timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    /// A spec with a fresh id and every option unset.
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            description: description.into(),
            priority: 0,
            deadline: None,
            dependencies: Vec::new(),
            required_capabilities: BTreeSet::new(),
            resources: Vec::new(),
            payload: serde_json::Value::Null,
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Set the base priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Replace the required capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Append a resource claim.
    pub fn with_resource(mut self, resource_id: impl Into<String>, mode: LockMode) -> Self {
        self.resources.push(ResourceClaim {
            resource_id: resource_id.into(),
            mode,
        });
        self
    }

    /// Set the executor payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Override the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the execution timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A task tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Caller-defined kind of work.
    pub task_type: String,
    /// Free text.
    pub description: String,
    /// Base priority.
    pub priority: i32,
    /// Optional due time.
    pub deadline: Option<DateTime<Utc>>,
    /// Tasks that must complete first.
    pub dependencies: Vec<TaskId>,
    /// Capabilities the assigned agent must have.
    pub required_capabilities: BTreeSet<String>,
    /// Locks held while executing.
    pub resources: Vec<ResourceClaim>,
    /// Opaque executor input.
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Retries consumed; never exceeds `max_retries`.
    pub retry_count: u32,
    /// Retry limit after defaults were applied.
    pub max_retries: u32,
    /// Execution timeout after defaults were applied.
    pub timeout_ms: u64,
    /// Agent of the current or last attempt.
    pub assigned_agent: Option<AgentId>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the task last became `ready`; the age bonus counts from here.
    pub ready_since: Option<DateTime<Utc>>,
    /// Start of the current or last attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a `retrying` task may return to `ready`.
    pub retry_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Executor output of the successful attempt.
    pub output: Option<serde_json::Value>,
}

impl Task {
    /// Resolve a submission against the configured defaults.
    pub fn from_spec(
        spec: TaskSpec,
        default_max_retries: u32,
        default_timeout_ms: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: spec.id,
            task_type: spec.task_type,
            description: spec.description,
            priority: spec.priority,
            deadline: spec.deadline,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            resources: spec.resources,
            payload: spec.payload,
            status: TaskStatus::Created,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            timeout_ms: spec.timeout_ms.unwrap_or(default_timeout_ms),
            assigned_agent: None,
            created_at: now,
            ready_since: None,
            started_at: None,
            completed_at: None,
            retry_at: None,
            last_error: None,
            output: None,
        }
    }

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal failure reason, if any.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.status {
            TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered, not yet activated.
    Creating,
    /// Accepting work, nothing running.
    Idle,
    /// Running at least one task.
    Busy,
    /// Reported when an assignment is rejected at capacity; never stored.
    Overloaded,
    /// Faulted; takes no work until reactivated.
    Error,
    /// Removed from the registry.
    Terminated,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Creating => write!(f, "creating"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Overloaded => write!(f, "overloaded"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// What a caller provides to register an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Caller-defined agent kind.
    pub agent_type: String,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Tasks the agent may run at once, at least 1.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

fn default_max_concurrent_tasks() -> usize {
    1
}

impl AgentDescriptor {
    /// No capabilities, one task at a time.
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }

    /// Replace the advertised capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the concurrency limit (clamped to at least 1).
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }
}

/// Real-time state of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Agent id.
    pub id: AgentId,
    /// Caller-defined agent kind.
    pub agent_type: String,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<String>,
    /// Stored lifecycle state.
    pub status: AgentStatus,
    /// Concurrency limit.
    pub max_concurrent_tasks: usize,
    /// Tasks currently assigned.
    pub current_tasks: BTreeSet<TaskId>,
    /// Registration time; breaks selection ties.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat or activation.
    pub last_heartbeat: DateTime<Utc>,
    /// Attempts that succeeded.
    pub tasks_completed: u64,
    /// Attempts that failed.
    pub tasks_failed: u64,
    /// Reason of the last fault.
    pub last_error: Option<String>,
}

impl Agent {
    /// A freshly registered agent in `creating`.
    pub fn new(id: AgentId, descriptor: AgentDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            agent_type: descriptor.agent_type,
            capabilities: descriptor.capabilities,
            status: AgentStatus::Creating,
            max_concurrent_tasks: descriptor.max_concurrent_tasks.max(1),
            current_tasks: BTreeSet::new(),
            registered_at: now,
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            last_error: None,
        }
    }

    /// Capabilities ⊇ `required`.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Idle or busy below its concurrency limit.
    pub fn can_accept_task(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Busy)
            && self.current_tasks.len() < self.max_concurrent_tasks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_from_spec_defaults() {
        let spec = TaskSpec::new("build", "Compile the workspace");
        let id = spec.id;
        let task = Task::from_spec(spec, 3, 1_000, Utc::now());
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.timeout_ms, 1_000);
        assert!(task.assigned_agent.is_none());
    }

    #[test]
    fn test_task_spec_overrides() {
        let dep = TaskId::new();
        let spec = TaskSpec::new("test", "Run tests")
            .with_priority(7)
            .with_dependencies(vec![dep])
            .with_capabilities(["rust"])
            .with_resource("db", LockMode::Shared)
            .with_max_retries(0)
            .with_timeout_ms(50);
        let task = Task::from_spec(spec, 3, 1_000, Utc::now());
        assert_eq!(task.priority, 7);
        assert_eq!(task.dependencies, vec![dep]);
        assert!(task.required_capabilities.contains("rust"));
        assert_eq!(task.resources[0].mode, LockMode::Shared);
        assert_eq!(task.max_retries, 0);
        assert_eq!(task.timeout_ms, 50);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed {
            reason: FailureReason::Cancelled
        }
        .is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_agent_capability_match() {
        let agent = Agent::new(
            AgentId::new(),
            AgentDescriptor::new("coder").with_capabilities(["rust", "python"]),
            Utc::now(),
        );
        let required: BTreeSet<String> = ["rust".to_string()].into_iter().collect();
        assert!(agent.has_capabilities(&required));
        assert!(agent.has_capabilities(&BTreeSet::new()));
        let missing: BTreeSet<String> = ["go".to_string()].into_iter().collect();
        assert!(!agent.has_capabilities(&missing));
    }

    #[test]
    fn test_creating_agent_does_not_accept() {
        let mut agent = Agent::new(AgentId::new(), AgentDescriptor::new("coder"), Utc::now());
        assert!(!agent.can_accept_task());
        agent.status = AgentStatus::Idle;
        assert!(agent.can_accept_task());
    }

    #[test]
    fn test_failure_reason_serialization() {
        let status = TaskStatus::Failed {
            reason: FailureReason::DependencyFailed,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("dependency_failed"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
