use crate::priority::PriorityPolicy;
use crate::registry::AgentRegistry;
use crate::task_graph::{FailureOutcome, StatusCounts, TaskGraph, Transition};
use crate::types::{FailureReason, ResourceClaim, Task, TaskSpec};
use chrono::Utc;
use conclave_core::{
    AgentId, ConclaveError, ConclaveResult, CoordinationEvent, EngineConfig, EventBus,
    RetryPolicy, TaskId,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A task assigned to an agent, ready to hand to the execution collaborator.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Task being dispatched.
    pub task_id: TaskId,
    /// Agent it was assigned to.
    pub agent_id: AgentId,
    /// 0 for the first attempt, the retry count afterwards.
    pub attempt: u32,
    /// Caller-defined kind of work.
    pub task_type: String,
    /// Base priority, used for deadlock victim selection.
    pub priority: i32,
    /// Opaque input for the executor.
    pub payload: serde_json::Value,
    /// Locks to take before executing, in declaration order.
    pub resources: Vec<ResourceClaim>,
    /// Execution timeout.
    pub timeout: Duration,
}

/// Owns the task graph and decides what runs where.
///
/// The scheduler never writes agent state itself: it asks the
/// [`AgentRegistry`] to reserve and release and reacts to the answer.
pub struct TaskScheduler {
    graph: Mutex<TaskGraph>,
    policy: PriorityPolicy,
    retry: RetryPolicy,
    queue_limit: usize,
    default_timeout_ms: u64,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    /// Ready tasks already reported as waiting for an agent.
    awaiting_agent: Mutex<HashSet<TaskId>>,
}

impl TaskScheduler {
    /// A scheduler with an empty graph, assigning through `registry`.
    pub fn new(config: &EngineConfig, registry: Arc<AgentRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            graph: Mutex::new(TaskGraph::new()),
            policy: PriorityPolicy::new(&config.scheduler),
            retry: config.retry.clone(),
            queue_limit: config.orchestrator.task_queue_size,
            default_timeout_ms: config.orchestrator.default_task_timeout_ms,
            registry,
            bus,
            awaiting_agent: Mutex::new(HashSet::new()),
        }
    }

    /// Submit a single task.
    pub fn submit(&self, spec: TaskSpec) -> ConclaveResult<TaskId> {
        let id = spec.id;
        self.submit_batch(vec![spec])?;
        Ok(id)
    }

    /// Submit tasks atomically; they may depend on each other.
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> ConclaveResult<Vec<TaskId>> {
        let mut graph = self.graph.lock();
        if graph.active_count() + specs.len() > self.queue_limit {
            warn!(limit = self.queue_limit, batch = specs.len(), "task submission rejected: queue full");
            return Err(ConclaveError::QueueFull {
                limit: self.queue_limit,
            });
        }

        let now = Utc::now();
        let tasks: Vec<Task> = specs
            .into_iter()
            .map(|spec| Task::from_spec(spec, self.retry.max_retries, self.default_timeout_ms, now))
            .collect();
        let created: Vec<(TaskId, String, i32)> = tasks
            .iter()
            .map(|t| (t.id, t.task_type.clone(), t.priority))
            .collect();

        let transitions = graph.insert_batch(tasks, now).map_err(|e| {
            warn!(error = %e, "task submission rejected");
            e
        })?;

        let ids = created.iter().map(|(id, _, _)| *id).collect();
        for (task_id, task_type, priority) in created {
            info!(task_id = %task_id, task_type = %task_type, priority, "task created");
            self.bus.publish(CoordinationEvent::TaskCreated {
                task_id,
                task_type,
                priority,
            });
        }
        for transition in transitions {
            match transition {
                Transition::Ready(task_id) => {
                    self.bus.publish(CoordinationEvent::TaskReady { task_id });
                }
                Transition::Failed { task_id, reason } => {
                    self.publish_terminal(&graph, task_id, None, reason.to_string(), None);
                }
            }
        }
        Ok(ids)
    }

    /// Promote due retries, then assign ready tasks in priority order.
    ///
    /// A task with no eligible agent stays `ready` for the next tick and is
    /// reported once with a `TaskAwaitingAgent` event.
    pub fn tick(&self) -> Vec<Dispatch> {
        let mut graph = self.graph.lock();
        let now = Utc::now();

        for task_id in graph.promote_due_retries(now) {
            debug!(task_id = %task_id, "retry delay elapsed");
            self.bus.publish(CoordinationEvent::TaskReady { task_id });
        }

        let ready = graph.ready_in_order(&self.policy, now);
        let mut awaiting = self.awaiting_agent.lock();
        awaiting.retain(|id| ready.contains(id));

        let mut dispatches = Vec::new();
        for task_id in ready {
            let Some(task) = graph.get(task_id) else {
                continue;
            };
            let agent_id = match self.assign(task) {
                Ok(agent_id) => agent_id,
                Err(e) => {
                    if awaiting.insert(task_id) {
                        self.report_awaiting(task, &e);
                    }
                    continue;
                }
            };
            awaiting.remove(&task_id);
            if let Err(e) = self.registry.reserve(agent_id, task_id) {
                debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "reservation rejected");
                continue;
            }
            let task = match graph.mark_running(task_id, agent_id, now) {
                Ok(task) => task,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "dispatch refused");
                    let _ = self.registry.release(agent_id, task_id, false);
                    continue;
                }
            };
            let dispatch = Dispatch {
                task_id,
                agent_id,
                attempt: task.retry_count,
                task_type: task.task_type.clone(),
                priority: task.priority,
                payload: task.payload.clone(),
                resources: task.resources.clone(),
                timeout: Duration::from_millis(task.timeout_ms),
            };
            info!(task_id = %task_id, agent_id = %agent_id, attempt = dispatch.attempt, "task started");
            self.bus.publish(CoordinationEvent::TaskStarted {
                task_id,
                agent_id,
                attempt: dispatch.attempt,
            });
            dispatches.push(dispatch);
        }
        dispatches
    }

    /// Pick the agent for `task`, or `NoEligibleAgent` when none can take it
    /// now.
    fn assign(&self, task: &Task) -> ConclaveResult<AgentId> {
        self.registry
            .select_agent(&task.required_capabilities)
            .ok_or(ConclaveError::NoEligibleAgent(task.id))
    }

    fn report_awaiting(&self, task: &Task, error: &ConclaveError) {
        let any_capable = self.registry.any_capable(&task.required_capabilities);
        if any_capable {
            debug!(task_id = %task.id, error = %error, "all capable agents busy");
        } else {
            warn!(
                task_id = %task.id,
                required = ?task.required_capabilities,
                error = %error,
                "no live agent has the required capabilities"
            );
        }
        self.bus.publish(CoordinationEvent::TaskAwaitingAgent {
            task_id: task.id,
            any_capable,
        });
    }

    /// Record a successful execution. Rejected unless the task is running on
    /// `agent_id`.
    pub fn complete(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        output: Option<serde_json::Value>,
    ) -> ConclaveResult<()> {
        let mut graph = self.graph.lock();
        let completion = graph
            .mark_completed(task_id, agent_id, output, Utc::now())
            .map_err(|e| {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "stale completion rejected");
                e
            })?;
        if let Err(e) = self.registry.release(agent_id, task_id, true) {
            debug!(agent_id = %agent_id, error = %e, "agent release skipped");
        }
        info!(task_id = %task_id, agent_id = %agent_id, duration_ms = completion.duration_ms, "task completed");
        self.bus.publish(CoordinationEvent::TaskCompleted {
            task_id,
            agent_id,
            duration_ms: completion.duration_ms,
        });
        for ready in completion.newly_ready {
            self.bus.publish(CoordinationEvent::TaskReady { task_id: ready });
        }
        Ok(())
    }

    /// Record a failed attempt. Retryable errors back off while retries
    /// remain; anything else fails the task and its dependents.
    pub fn fail(
        &self,
        task_id: TaskId,
        agent_id: Option<AgentId>,
        error: &ConclaveError,
    ) -> ConclaveResult<FailureOutcome> {
        let jitter: f64 = rand::thread_rng().gen();
        let retry = &self.retry;
        let mut graph = self.graph.lock();
        let outcome = graph
            .mark_failed(task_id, agent_id, error, Utc::now(), |n| {
                retry.delay_with_jitter(n, jitter)
            })
            .map_err(|e| {
                warn!(task_id = %task_id, error = %e, "stale failure rejected");
                e
            })?;
        if let Some(agent_id) = agent_id {
            if let Err(e) = self.registry.release(agent_id, task_id, false) {
                debug!(agent_id = %agent_id, error = %e, "agent release skipped");
            }
        }

        match &outcome {
            FailureOutcome::Retry {
                retry_count, delay, ..
            } => {
                warn!(task_id = %task_id, retry_count, delay_ms = delay.as_millis() as u64, error = %error, "task failed, retrying");
                self.bus.publish(CoordinationEvent::TaskFailed {
                    task_id,
                    agent_id,
                    reason: error.to_string(),
                    error_kind: Some(error.kind().to_string()),
                    will_retry: true,
                    retry_count: *retry_count,
                });
                self.bus.publish(CoordinationEvent::TaskRetrying {
                    task_id,
                    retry_count: *retry_count,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            FailureOutcome::Terminal { reason, cascaded } => {
                warn!(task_id = %task_id, reason = %reason, error = %error, cascaded = cascaded.len(), "task failed");
                self.publish_terminal(
                    &graph,
                    task_id,
                    agent_id,
                    format!("{reason}: {error}"),
                    Some(error.kind()),
                );
                for dependent in cascaded {
                    self.publish_terminal(
                        &graph,
                        *dependent,
                        None,
                        FailureReason::DependencyFailed.to_string(),
                        None,
                    );
                }
            }
        }
        Ok(outcome)
    }

    /// Cancel a non-terminal task. Returns the agent it was running on.
    pub fn cancel(&self, task_id: TaskId) -> ConclaveResult<Option<AgentId>> {
        let mut graph = self.graph.lock();
        let (agent_id, cascaded) = graph.cancel(task_id, Utc::now())?;
        if let Some(agent_id) = agent_id {
            if let Err(e) = self.registry.release(agent_id, task_id, false) {
                debug!(agent_id = %agent_id, error = %e, "agent release skipped");
            }
        }
        info!(task_id = %task_id, cascaded = cascaded.len(), "task cancelled");
        self.publish_terminal(
            &graph,
            task_id,
            agent_id,
            FailureReason::Cancelled.to_string(),
            Some(ConclaveError::Cancelled(task_id).kind()),
        );
        for dependent in cascaded {
            self.publish_terminal(
                &graph,
                dependent,
                None,
                FailureReason::DependencyFailed.to_string(),
                None,
            );
        }
        Ok(agent_id)
    }

    /// Drop terminal tasks that finished more than `ttl` ago.
    pub fn prune_finished(&self, ttl: Duration) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let pruned = self.graph.lock().prune_finished(cutoff);
        if pruned > 0 {
            debug!(pruned, "pruned finished tasks");
        }
        pruned
    }

    /// Snapshot of one task.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.graph.lock().get(task_id).cloned()
    }

    /// All tracked tasks, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        self.graph.lock().all_tasks().into_iter().cloned().collect()
    }

    /// Tracked tasks per status.
    pub fn status_counts(&self) -> StatusCounts {
        self.graph.lock().status_counts()
    }

    /// Every tracked task is terminal.
    pub fn is_drained(&self) -> bool {
        self.graph.lock().is_done()
    }

    fn publish_terminal(
        &self,
        graph: &TaskGraph,
        task_id: TaskId,
        agent_id: Option<AgentId>,
        reason: String,
        error_kind: Option<&str>,
    ) {
        let retry_count = graph.get(task_id).map(|t| t.retry_count).unwrap_or_default();
        self.bus.publish(CoordinationEvent::TaskFailed {
            task_id,
            agent_id,
            reason,
            error_kind: error_kind.map(str::to_string),
            will_retry: false,
            retry_count,
        });
    }
}
