use crate::types::{Agent, AgentDescriptor, AgentStatus};
use chrono::{DateTime, Utc};
use conclave_core::{AgentId, ConclaveError, ConclaveResult, CoordinationEvent, EventBus, TaskId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Aggregate view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// Live agents.
    pub total: usize,
    /// Agents in `creating`.
    pub creating: usize,
    /// Agents in `idle`.
    pub idle: usize,
    /// Agents in `busy`.
    pub busy: usize,
    /// Agents in `error`.
    pub error: usize,
    /// busy / non-terminated, 0 when empty.
    pub utilization: f64,
}

/// Tracks identity, capabilities and lifecycle state of every live agent.
///
/// The registry is the only writer of agent state. Terminated agents are
/// removed immediately.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Agent>>,
    max_agents: usize,
    bus: Arc<EventBus>,
}

impl AgentRegistry {
    /// An empty registry admitting at most `max_agents` live agents.
    pub fn new(max_agents: usize, bus: Arc<EventBus>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            max_agents,
            bus,
        }
    }

    /// Register an agent in `creating` state.
    pub fn register(&self, descriptor: AgentDescriptor) -> ConclaveResult<AgentId> {
        let mut agents = self.agents.write();
        if agents.len() >= self.max_agents {
            warn!(limit = self.max_agents, "agent registration rejected");
            return Err(ConclaveError::AgentLimitReached {
                limit: self.max_agents,
            });
        }
        let id = AgentId::new();
        let agent = Agent::new(id, descriptor, Utc::now());
        info!(agent_id = %id, agent_type = %agent.agent_type, "agent registered");
        self.bus.publish(CoordinationEvent::AgentSpawned {
            agent_id: id,
            agent_type: agent.agent_type.clone(),
        });
        agents.insert(id, agent);
        Ok(id)
    }

    /// `creating → idle`, or `error → idle` once the agent holds no tasks.
    pub fn activate(&self, id: AgentId) -> ConclaveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents.get_mut(&id).ok_or(ConclaveError::AgentNotFound(id))?;
        match agent.status {
            AgentStatus::Creating | AgentStatus::Error if agent.current_tasks.is_empty() => {
                agent.status = AgentStatus::Idle;
                agent.last_heartbeat = Utc::now();
                info!(agent_id = %id, "agent activated");
                self.bus
                    .publish(CoordinationEvent::AgentIdle { agent_id: id });
                Ok(())
            }
            AgentStatus::Idle | AgentStatus::Busy => Ok(()),
            status => Err(ConclaveError::InvalidTransition(format!(
                "cannot activate agent {id} from {status}"
            ))),
        }
    }

    /// Pick the agent for a task: capabilities ⊇ `required`, able to accept
    /// work, fewest current tasks, then earliest registration.
    pub fn select_agent(&self, required: &BTreeSet<String>) -> Option<AgentId> {
        self.agents
            .read()
            .values()
            .filter(|a| a.can_accept_task() && a.has_capabilities(required))
            .min_by_key(|a| (a.current_tasks.len(), a.registered_at, a.id))
            .map(|a| a.id)
    }

    /// Whether any live agent could ever run a task with these requirements.
    pub fn any_capable(&self, required: &BTreeSet<String>) -> bool {
        self.agents.read().values().any(|a| a.has_capabilities(required))
    }

    /// Add `task_id` to the agent's current tasks (`idle → busy`).
    ///
    /// At capacity the reservation is rejected and an `AgentOverloaded` event
    /// is published; the agent keeps its stored status.
    pub fn reserve(&self, agent_id: AgentId, task_id: TaskId) -> ConclaveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(ConclaveError::AgentNotFound(agent_id))?;
        if !matches!(agent.status, AgentStatus::Idle | AgentStatus::Busy) {
            return Err(ConclaveError::AgentUnavailable(format!(
                "agent {agent_id} is {}",
                agent.status
            )));
        }
        if agent.current_tasks.len() >= agent.max_concurrent_tasks {
            debug!(agent_id = %agent_id, task_id = %task_id, "agent overloaded");
            self.bus
                .publish(CoordinationEvent::AgentOverloaded { agent_id, task_id });
            return Err(ConclaveError::AgentOverloaded(agent_id));
        }
        agent.current_tasks.insert(task_id);
        agent.status = AgentStatus::Busy;
        self.bus
            .publish(CoordinationEvent::AgentActive { agent_id, task_id });
        Ok(())
    }

    /// Remove `task_id` from the agent; `busy → idle` when nothing remains.
    pub fn release(&self, agent_id: AgentId, task_id: TaskId, succeeded: bool) -> ConclaveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(ConclaveError::AgentNotFound(agent_id))?;
        if !agent.current_tasks.remove(&task_id) {
            return Err(ConclaveError::InvalidTransition(format!(
                "agent {agent_id} is not running task {task_id}"
            )));
        }
        if succeeded {
            agent.tasks_completed += 1;
        } else {
            agent.tasks_failed += 1;
        }
        if agent.status == AgentStatus::Busy && agent.current_tasks.is_empty() {
            agent.status = AgentStatus::Idle;
            self.bus
                .publish(CoordinationEvent::AgentIdle { agent_id });
        }
        Ok(())
    }

    /// `* → error`. Returns the tasks the agent was running; the caller fails
    /// them with `AgentUnavailable`.
    pub fn mark_error(&self, agent_id: AgentId, reason: impl Into<String>) -> ConclaveResult<Vec<TaskId>> {
        let reason = reason.into();
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(ConclaveError::AgentNotFound(agent_id))?;
        agent.status = AgentStatus::Error;
        agent.last_error = Some(reason.clone());
        let orphaned: Vec<TaskId> = std::mem::take(&mut agent.current_tasks).into_iter().collect();
        agent.tasks_failed += orphaned.len() as u64;
        warn!(agent_id = %agent_id, reason = %reason, orphaned = orphaned.len(), "agent error");
        self.bus
            .publish(CoordinationEvent::AgentError { agent_id, reason });
        Ok(orphaned)
    }

    /// `* → terminated`. The agent leaves tracking; its tasks are returned.
    pub fn terminate(&self, agent_id: AgentId) -> ConclaveResult<Vec<TaskId>> {
        let agent = self
            .agents
            .write()
            .remove(&agent_id)
            .ok_or(ConclaveError::AgentNotFound(agent_id))?;
        info!(agent_id = %agent_id, "agent terminated");
        self.bus
            .publish(CoordinationEvent::AgentTerminated { agent_id });
        Ok(agent.current_tasks.into_iter().collect())
    }

    /// Record a liveness signal.
    pub fn heartbeat(&self, agent_id: AgentId) -> ConclaveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(ConclaveError::AgentNotFound(agent_id))?;
        agent.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Move every live agent silent for longer than `timeout` to `error`.
    /// Returns each affected agent with the tasks it was running.
    pub fn health_check(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Vec<(AgentId, Vec<TaskId>)> {
        let stale: Vec<AgentId> = self
            .agents
            .read()
            .values()
            .filter(|a| {
                matches!(
                    a.status,
                    AgentStatus::Creating | AgentStatus::Idle | AgentStatus::Busy
                ) && now - a.last_heartbeat > timeout
            })
            .map(|a| a.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.mark_error(id, "heartbeat timeout")
                    .ok()
                    .map(|orphaned| (id, orphaned))
            })
            .collect()
    }

    /// Snapshot of one agent.
    pub fn get(&self, id: AgentId) -> Option<Agent> {
        self.agents.read().get(&id).cloned()
    }

    /// Snapshot of all live agents, oldest registration first.
    pub fn snapshot(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().values().cloned().collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        agents
    }

    /// busy / non-terminated.
    pub fn utilization(&self) -> f64 {
        self.stats().utilization
    }

    /// Counts by state.
    pub fn stats(&self) -> AgentStats {
        let agents = self.agents.read();
        let mut stats = AgentStats {
            total: agents.len(),
            ..AgentStats::default()
        };
        for agent in agents.values() {
            match agent.status {
                AgentStatus::Creating => stats.creating += 1,
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Error => stats.error += 1,
                AgentStatus::Overloaded | AgentStatus::Terminated => {}
            }
        }
        if stats.total > 0 {
            stats.utilization = stats.busy as f64 / stats.total as f64;
        }
        stats
    }
}
