use crate::scheduler::Dispatch;
use async_trait::async_trait;
use conclave_core::{AgentId, ConclaveResult, TaskId};
use serde::{Deserialize, Serialize};

/// What the execution collaborator receives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Task being executed.
    pub task_id: TaskId,
    /// Agent the attempt runs on.
    pub agent_id: AgentId,
    /// 0 for the first attempt, the retry count afterwards.
    pub attempt: u32,
    /// Caller-defined kind of work.
    pub task_type: String,
    /// Opaque input from the task spec.
    pub payload: serde_json::Value,
}

impl From<&Dispatch> for ExecutionRequest {
    fn from(dispatch: &Dispatch) -> Self {
        Self {
            task_id: dispatch.task_id,
            agent_id: dispatch.agent_id,
            attempt: dispatch.attempt,
            task_type: dispatch.task_type.clone(),
            payload: dispatch.payload.clone(),
        }
    }
}

/// Result of a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Stored on the task as its output.
    pub output: serde_json::Value,
}

impl ExecutionOutput {
    /// Wrap an output value.
    pub fn new(output: serde_json::Value) -> Self {
        Self { output }
    }
}

/// Carries out the work of a task on behalf of an agent.
///
/// The engine wraps every call in the task timeout; an `Err` is handled as a
/// failed attempt and retried according to [`ConclaveError::is_retryable`].
///
/// [`ConclaveError::is_retryable`]: conclave_core::ConclaveError::is_retryable
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt.
    async fn execute(&self, request: ExecutionRequest) -> ConclaveResult<ExecutionOutput>;
}
