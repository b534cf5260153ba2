use crate::priority::PriorityPolicy;
use crate::types::{FailureReason, Task, TaskStatus};
use chrono::{DateTime, Utc};
use conclave_core::{AgentId, ConclaveError, ConclaveResult, TaskId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// A side-effect transition produced while mutating the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The task moved to `ready`.
    Ready(TaskId),
    /// The task failed terminally as a consequence of another task.
    Failed {
        /// Task that failed.
        task_id: TaskId,
        /// Always a cascade reason.
        reason: FailureReason,
    },
}

/// Result of a successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Wall time of the final attempt.
    pub duration_ms: u64,
    /// Dependents that became `ready`.
    pub newly_ready: Vec<TaskId>,
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The task is `retrying` and returns to `ready` at `retry_at`.
    Retry {
        /// Retries consumed, including this one.
        retry_count: u32,
        /// Backoff applied.
        delay: Duration,
        /// When the task becomes ready again.
        retry_at: DateTime<Utc>,
    },
    /// The task failed for good; `cascaded` dependents failed with it.
    Terminal {
        /// Why the task gave up.
        reason: FailureReason,
        /// Dependents failed with `dependency_failed`.
        cascaded: Vec<TaskId>,
    },
}

/// Counts of tracked tasks by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Waiting on dependencies.
    pub created: usize,
    /// Eligible for assignment.
    pub ready: usize,
    /// Executing.
    pub running: usize,
    /// Backing off before another attempt.
    pub retrying: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Finished unsuccessfully.
    pub failed: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DepState {
    Completed,
    Failed,
    Pending,
}

/// The task dependency graph with readiness tracking.
///
/// Dependencies always form a DAG: every insertion is checked eagerly and
/// rejected if it would close a cycle.
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    // Outlive pruning so late dependents still resolve.
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
}

impl TaskGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            dependents: HashMap::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    /// Insert a batch of tasks atomically.
    ///
    /// Dependencies may point at tracked tasks (including finished ones) or
    /// at other tasks of the same batch. Returns the transitions the batch
    /// caused, in order.
    pub fn insert_batch(
        &mut self,
        batch: Vec<Task>,
        now: DateTime<Utc>,
    ) -> ConclaveResult<Vec<Transition>> {
        let mut incoming: HashMap<TaskId, &Task> = HashMap::with_capacity(batch.len());
        for task in &batch {
            if self.knows(task.id) || incoming.insert(task.id, task).is_some() {
                return Err(ConclaveError::DuplicateTask(task.id));
            }
        }

        for task in &batch {
            for dep in &task.dependencies {
                if *dep == task.id {
                    return Err(ConclaveError::InvalidDependency {
                        task_id: task.id,
                        reason: "task depends on itself".into(),
                    });
                }
                if !self.knows(*dep) && !incoming.contains_key(dep) {
                    return Err(ConclaveError::InvalidDependency {
                        task_id: task.id,
                        reason: format!("unknown dependency {dep}"),
                    });
                }
            }
        }

        // Tracked tasks already form a DAG, so any new cycle must pass
        // through an incoming task.
        let mut visited = HashMap::new();
        for task in &batch {
            if self.dfs_cycle(task.id, &incoming, &mut visited) {
                return Err(ConclaveError::InvalidDependency {
                    task_id: task.id,
                    reason: "dependency cycle".into(),
                });
            }
        }

        let ids: Vec<TaskId> = batch.iter().map(|t| t.id).collect();
        for task in batch {
            for dep in &task.dependencies {
                self.dependents.entry(*dep).or_default().push(task.id);
            }
            self.tasks.insert(task.id, task);
        }

        let mut transitions = Vec::new();
        for id in ids {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Created {
                // Already failed by an earlier cascade in this batch.
                continue;
            }
            let states: Vec<DepState> = task
                .dependencies
                .iter()
                .map(|d| self.dep_state(*d))
                .collect();
            if states.contains(&DepState::Failed) {
                self.fail_terminal(id, FailureReason::DependencyFailed, now);
                transitions.push(Transition::Failed {
                    task_id: id,
                    reason: FailureReason::DependencyFailed,
                });
                for cascaded in self.cascade_failure(id, now) {
                    transitions.push(Transition::Failed {
                        task_id: cascaded,
                        reason: FailureReason::DependencyFailed,
                    });
                }
            } else if states.iter().all(|s| *s == DepState::Completed) {
                self.set_ready(id, now);
                transitions.push(Transition::Ready(id));
            }
        }
        Ok(transitions)
    }

    /// Ready tasks in dispatch order.
    pub fn ready_in_order(&self, policy: &PriorityPolicy, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| policy.compare(a, b, now));
        ready.into_iter().map(|t| t.id).collect()
    }

    /// Move `retrying` tasks whose backoff has elapsed back to `ready`.
    pub fn promote_due_retries(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let due: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Retrying && t.retry_at.map_or(true, |at| at <= now))
            .map(|t| t.id)
            .collect();
        for id in &due {
            if let Some(task) = self.tasks.get_mut(id) {
                task.retry_at = None;
            }
            self.set_ready(*id, now);
        }
        due
    }

    /// `ready → running` on `agent_id`.
    pub fn mark_running(
        &mut self,
        id: TaskId,
        agent_id: AgentId,
        now: DateTime<Utc>,
    ) -> ConclaveResult<&Task> {
        let deps_completed = {
            let task = self.tasks.get(&id).ok_or(ConclaveError::TaskNotFound(id))?;
            if task.status != TaskStatus::Ready {
                return Err(ConclaveError::InvalidTransition(format!(
                    "task {id} is {:?}, expected ready",
                    task.status
                )));
            }
            task.dependencies.iter().all(|d| self.completed.contains(d))
        };
        if !deps_completed {
            return Err(ConclaveError::InvariantViolation(format!(
                "task {id} is ready with incomplete dependencies"
            )));
        }
        let task = self.tasks.get_mut(&id).ok_or(ConclaveError::TaskNotFound(id))?;
        task.status = TaskStatus::Running;
        task.assigned_agent = Some(agent_id);
        task.started_at = Some(now);
        Ok(task)
    }

    /// `running → completed`; dependents whose dependencies are now all
    /// completed become `ready`.
    pub fn mark_completed(
        &mut self,
        id: TaskId,
        agent_id: AgentId,
        output: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> ConclaveResult<Completion> {
        let task = self.running_task_mut(id, Some(agent_id))?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.output = output;
        let duration_ms = task
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        self.completed.insert(id);

        let mut newly_ready = Vec::new();
        for dependent in self.dependents.get(&id).cloned().unwrap_or_default() {
            let unblocked = self.tasks.get(&dependent).is_some_and(|t| {
                t.status == TaskStatus::Created
                    && t.dependencies.iter().all(|d| self.completed.contains(d))
            });
            if unblocked {
                self.set_ready(dependent, now);
                newly_ready.push(dependent);
            }
        }
        Ok(Completion {
            duration_ms,
            newly_ready,
        })
    }

    /// Record a failed attempt of a running task.
    ///
    /// Retryable errors move the task to `retrying` while
    /// `retry_count < max_retries`, incrementing `retry_count` once. Otherwise
    /// the task fails terminally and the failure cascades to dependents.
    /// `backoff` maps the pre-increment retry count to a delay.
    pub fn mark_failed(
        &mut self,
        id: TaskId,
        agent_id: Option<AgentId>,
        error: &ConclaveError,
        now: DateTime<Utc>,
        backoff: impl FnOnce(u32) -> Duration,
    ) -> ConclaveResult<FailureOutcome> {
        let task = self.running_task_mut(id, agent_id)?;
        task.last_error = Some(error.to_string());
        task.assigned_agent = None;

        let reason = if !error.is_retryable() {
            FailureReason::NonRetryable
        } else if task.retry_count < task.max_retries {
            let delay = backoff(task.retry_count);
            let retry_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            task.retry_count += 1;
            task.status = TaskStatus::Retrying;
            task.retry_at = Some(retry_at);
            task.ready_since = None;
            return Ok(FailureOutcome::Retry {
                retry_count: task.retry_count,
                delay,
                retry_at,
            });
        } else {
            FailureReason::MaxRetriesExceeded
        };

        self.fail_terminal(id, reason, now);
        let cascaded = self.cascade_failure(id, now);
        Ok(FailureOutcome::Terminal { reason, cascaded })
    }

    /// Fail any non-terminal task with `cancelled`. Returns the agent it was
    /// running on (if any) and the dependents that failed with it.
    pub fn cancel(
        &mut self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> ConclaveResult<(Option<AgentId>, Vec<TaskId>)> {
        let task = self.tasks.get_mut(&id).ok_or(ConclaveError::TaskNotFound(id))?;
        if task.is_terminal() {
            return Err(ConclaveError::InvalidTransition(format!(
                "task {id} is already {:?}",
                task.status
            )));
        }
        let agent = task.assigned_agent.take();
        task.last_error = Some(ConclaveError::Cancelled(id).to_string());
        self.fail_terminal(id, FailureReason::Cancelled, now);
        let cascaded = self.cascade_failure(id, now);
        Ok((agent, cascaded))
    }

    /// Drop terminal tasks finished before `cutoff` from lookup.
    pub fn prune_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff))
            .map(|t| t.id)
            .collect();
        for id in &stale {
            self.tasks.remove(id);
            let finished_dependents = self.dependents.get(id).is_some_and(|deps| {
                deps.iter()
                    .all(|d| self.tasks.get(d).map_or(true, Task::is_terminal))
            });
            if finished_dependents {
                self.dependents.remove(id);
            }
        }
        stale.len()
    }

    /// Look up a tracked task.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tracked tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    /// Number of non-terminal tasks.
    pub fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_terminal()).count()
    }

    /// Tracked tasks, terminal ones included.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Tracked tasks per status.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Created => counts.created += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Retrying => counts.retrying += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Check if all tasks are in a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(Task::is_terminal)
    }

    /// Check for cycles in the whole dependency graph.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        let none = HashMap::new();
        self.tasks
            .keys()
            .any(|id| self.dfs_cycle(*id, &none, &mut visited))
    }

    fn dfs_cycle(
        &self,
        id: TaskId,
        incoming: &HashMap<TaskId, &Task>,
        visited: &mut HashMap<TaskId, u8>,
    ) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        let deps = incoming
            .get(&id)
            .map(|t| t.dependencies.as_slice())
            .or_else(|| self.tasks.get(&id).map(|t| t.dependencies.as_slice()))
            .unwrap_or_default();
        for dep in deps {
            if self.dfs_cycle(*dep, incoming, visited) {
                return true;
            }
        }
        visited.insert(id, 2);
        false
    }

    fn knows(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id) || self.completed.contains(&id) || self.failed.contains(&id)
    }

    fn dep_state(&self, id: TaskId) -> DepState {
        if self.completed.contains(&id) {
            DepState::Completed
        } else if self.failed.contains(&id) {
            DepState::Failed
        } else {
            DepState::Pending
        }
    }

    fn running_task_mut(
        &mut self,
        id: TaskId,
        agent_id: Option<AgentId>,
    ) -> ConclaveResult<&mut Task> {
        let task = self.tasks.get_mut(&id).ok_or(ConclaveError::TaskNotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(ConclaveError::InvalidTransition(format!(
                "task {id} is {:?}, expected running",
                task.status
            )));
        }
        if let Some(agent_id) = agent_id {
            if task.assigned_agent != Some(agent_id) {
                return Err(ConclaveError::InvalidTransition(format!(
                    "task {id} is not assigned to agent {agent_id}"
                )));
            }
        }
        Ok(task)
    }

    fn set_ready(&mut self, id: TaskId, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Ready;
            task.ready_since = Some(now);
        }
    }

    fn fail_terminal(&mut self, id: TaskId, reason: FailureReason, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Failed { reason };
            task.completed_at = Some(now);
            task.assigned_agent = None;
            task.retry_at = None;
        }
        self.failed.insert(id);
    }

    /// Fail every non-terminal transitive dependent of `root`.
    fn cascade_failure(&mut self, root: TaskId, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut cascaded = Vec::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            for dependent in self.dependents.get(&id).cloned().unwrap_or_default() {
                let pending = self
                    .tasks
                    .get(&dependent)
                    .is_some_and(|t| !t.is_terminal());
                if !pending {
                    continue;
                }
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.last_error = Some(format!("dependency {id} failed"));
                }
                self.fail_terminal(dependent, FailureReason::DependencyFailed, now);
                cascaded.push(dependent);
                queue.push_back(dependent);
            }
        }
        cascaded
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}
