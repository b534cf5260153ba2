use crate::{AgentId, LockMode, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every lifecycle event the engine produces or accepts from collaborators.
///
/// The set is closed so that consumers handle each case exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// A task entered the graph.
    TaskCreated {
        /// New task.
        task_id: TaskId,
        /// Caller-defined kind of work.
        task_type: String,
        /// Base priority.
        priority: i32,
    },
    /// All dependencies completed (or a retry delay elapsed).
    TaskReady {
        /// Task that became ready.
        task_id: TaskId,
    },
    /// A ready task found no agent to run it. Published once per ready
    /// period; the task stays ready and is not counted as failed.
    TaskAwaitingAgent {
        /// Task left waiting.
        task_id: TaskId,
        /// `false` when no live agent has the required capabilities at all,
        /// `true` when capable agents exist but are all busy.
        any_capable: bool,
    },
    /// The task was assigned and handed to the execution collaborator.
    TaskStarted {
        /// Dispatched task.
        task_id: TaskId,
        /// Agent running it.
        agent_id: AgentId,
        /// 0 for the first attempt, `retry_count` afterwards.
        attempt: u32,
    },
    /// The task finished successfully.
    TaskCompleted {
        /// Finished task.
        task_id: TaskId,
        /// Agent that ran it.
        agent_id: AgentId,
        /// Wall time of the final attempt.
        duration_ms: u64,
    },
    /// An attempt failed. `will_retry == false` means the failure is terminal.
    TaskFailed {
        /// Failed task.
        task_id: TaskId,
        /// Agent the attempt ran on; `None` for cascaded failures.
        agent_id: Option<AgentId>,
        /// Human-readable cause.
        reason: String,
        /// [`ConclaveError::kind`](crate::ConclaveError::kind) of the error
        /// behind the failure; `None` when a dependency failed.
        #[serde(default)]
        error_kind: Option<String>,
        /// Whether the task goes back to the retry queue.
        will_retry: bool,
        /// Retries consumed so far.
        retry_count: u32,
    },
    /// A failed task is waiting out its backoff delay.
    TaskRetrying {
        /// Task waiting to retry.
        task_id: TaskId,
        /// Retries consumed, including this one.
        retry_count: u32,
        /// Backoff before the task is ready again.
        delay_ms: u64,
    },

    /// An agent was registered (status `creating`).
    AgentSpawned {
        /// New agent.
        agent_id: AgentId,
        /// Caller-defined agent kind.
        agent_type: String,
    },
    /// An agent took on a task.
    AgentActive {
        /// Agent that took the task.
        agent_id: AgentId,
        /// Task it took.
        task_id: TaskId,
    },
    /// An agent has no tasks and accepts work.
    AgentIdle {
        /// Idle agent.
        agent_id: AgentId,
    },
    /// An assignment was rejected because the agent is at capacity.
    AgentOverloaded {
        /// Agent at capacity.
        agent_id: AgentId,
        /// Task that was refused.
        task_id: TaskId,
    },
    /// An agent failed a health check or reported a fault.
    AgentError {
        /// Faulty agent.
        agent_id: AgentId,
        /// What went wrong.
        reason: String,
    },
    /// An agent was shut down.
    AgentTerminated {
        /// Removed agent.
        agent_id: AgentId,
    },

    /// A lock request was queued behind an incompatible holder.
    ResourceWaiting {
        /// Contended resource.
        resource_id: String,
        /// Waiting agent.
        agent_id: AgentId,
        /// Requested mode.
        mode: LockMode,
    },
    /// A lock was granted.
    ResourceAcquired {
        /// Locked resource.
        resource_id: String,
        /// New holder.
        agent_id: AgentId,
        /// Granted mode.
        mode: LockMode,
        /// Time spent queued; 0 for immediate grants.
        waited_ms: u64,
    },
    /// A lock was released.
    ResourceReleased {
        /// Released resource.
        resource_id: String,
        /// Former holder.
        agent_id: AgentId,
    },
    /// A queued request gave up after its timeout.
    ResourceTimeout {
        /// Resource that was requested.
        resource_id: String,
        /// Agent that gave up.
        agent_id: AgentId,
    },

    /// An inter-agent message was sent.
    MessageSent {
        /// Sender.
        from: AgentId,
        /// Recipient; `None` for a broadcast.
        to: Option<AgentId>,
        /// Message topic.
        topic: String,
    },
    /// An inter-agent message was delivered.
    MessageReceived {
        /// Recipient.
        agent_id: AgentId,
        /// Message topic.
        topic: String,
    },

    /// A wait-for cycle was found.
    ConflictDetected {
        /// Agents on the cycle.
        agents: Vec<AgentId>,
        /// Resources the cycle waits on.
        resources: Vec<String>,
    },
    /// A wait-for cycle was broken by aborting one waiter.
    ConflictResolved {
        /// Agent whose request was aborted.
        victim_agent: AgentId,
        /// Task whose request was aborted, if any.
        victim_task: Option<TaskId>,
        /// Resource the aborted request was queued on.
        resource_id: String,
    },
}

impl CoordinationEvent {
    /// Dotted topic name, e.g. `task:completed`.
    pub fn topic(&self) -> &'static str {
        match self {
            CoordinationEvent::TaskCreated { .. } => "task:created",
            CoordinationEvent::TaskReady { .. } => "task:ready",
            CoordinationEvent::TaskAwaitingAgent { .. } => "task:awaiting_agent",
            CoordinationEvent::TaskStarted { .. } => "task:started",
            CoordinationEvent::TaskCompleted { .. } => "task:completed",
            CoordinationEvent::TaskFailed { .. } => "task:failed",
            CoordinationEvent::TaskRetrying { .. } => "task:retrying",
            CoordinationEvent::AgentSpawned { .. } => "agent:spawned",
            CoordinationEvent::AgentActive { .. } => "agent:active",
            CoordinationEvent::AgentIdle { .. } => "agent:idle",
            CoordinationEvent::AgentOverloaded { .. } => "agent:overloaded",
            CoordinationEvent::AgentError { .. } => "agent:error",
            CoordinationEvent::AgentTerminated { .. } => "agent:terminated",
            CoordinationEvent::ResourceWaiting { .. } => "resource:waiting",
            CoordinationEvent::ResourceAcquired { .. } => "resource:acquired",
            CoordinationEvent::ResourceReleased { .. } => "resource:released",
            CoordinationEvent::ResourceTimeout { .. } => "resource:timeout",
            CoordinationEvent::MessageSent { .. } => "message:sent",
            CoordinationEvent::MessageReceived { .. } => "message:received",
            CoordinationEvent::ConflictDetected { .. } => "conflict:detected",
            CoordinationEvent::ConflictResolved { .. } => "conflict:resolved",
        }
    }

    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            CoordinationEvent::TaskCreated { task_id, .. }
            | CoordinationEvent::TaskReady { task_id }
            | CoordinationEvent::TaskAwaitingAgent { task_id, .. }
            | CoordinationEvent::TaskStarted { task_id, .. }
            | CoordinationEvent::TaskCompleted { task_id, .. }
            | CoordinationEvent::TaskFailed { task_id, .. }
            | CoordinationEvent::TaskRetrying { task_id, .. }
            | CoordinationEvent::AgentActive { task_id, .. }
            | CoordinationEvent::AgentOverloaded { task_id, .. } => Some(*task_id),
            CoordinationEvent::ConflictResolved { victim_task, .. } => *victim_task,
            _ => None,
        }
    }
}

/// An event stamped by the bus with a sequence number and publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per-bus sequence number, starting at 1.
    pub seq: u64,
    /// UTC time of publication.
    pub at: DateTime<Utc>,
    /// The event itself.
    pub event: CoordinationEvent,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let event = CoordinationEvent::TaskReady {
            task_id: TaskId::new(),
        };
        assert_eq!(event.topic(), "task:ready");
        assert!(event.task_id().is_some());
        let event = CoordinationEvent::ConflictDetected {
            agents: vec![],
            resources: vec![],
        };
        assert_eq!(event.topic(), "conflict:detected");
        assert!(event.task_id().is_none());
    }

    #[test]
    fn test_failure_without_kind_deserializes() {
        let task_id = TaskId::new();
        let json = serde_json::json!({
            "type": "task_failed",
            "task_id": task_id,
            "agent_id": null,
            "reason": "dependency_failed",
            "will_retry": false,
            "retry_count": 0,
        });
        let event: CoordinationEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(
            event,
            CoordinationEvent::TaskFailed { error_kind: None, .. }
        ));
        assert_eq!(event.task_id(), Some(task_id));
    }

    #[test]
    fn test_event_is_tagged() {
        let event = CoordinationEvent::ResourceAcquired {
            resource_id: "db".into(),
            agent_id: AgentId::new(),
            mode: LockMode::Exclusive,
            waited_ms: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "resource_acquired");
        assert_eq!(json["mode"], "exclusive");
    }
}
