use chrono::{DateTime, Utc};
use conclave_core::{
    AgentId, ConclaveError, ConclaveResult, CoordinationEvent, EventBus, LockMode, TaskId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Who holds or waits for a lock: an agent, optionally on behalf of one task.
///
/// Two tasks running on the same agent are different owners, so an
/// exclusive claim made by one blocks the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwner {
    /// Agent making the request.
    pub agent_id: AgentId,
    /// Task the lock is held for; `None` for direct agent locks.
    pub task_id: Option<TaskId>,
}

impl LockOwner {
    /// A lock held by the agent itself.
    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            task_id: None,
        }
    }

    /// A lock held by `agent_id` while running `task_id`.
    pub fn task(agent_id: AgentId, task_id: TaskId) -> Self {
        Self {
            agent_id,
            task_id: Some(task_id),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task_id {
            Some(task_id) => write!(f, "{}/{task_id}", self.agent_id),
            None => write!(f, "{}", self.agent_id),
        }
    }
}

/// A lock request with the task context used for deadlock victim selection.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Resource to lock.
    pub resource_id: String,
    /// Requesting agent.
    pub agent_id: AgentId,
    /// Requested mode.
    pub mode: LockMode,
    /// Maximum time spent queued.
    pub timeout: Duration,
    /// Task the lock is for, if any.
    pub task_id: Option<TaskId>,
    /// Task priority; the lowest loses a deadlock.
    pub priority: i32,
}

impl LockRequest {
    /// A direct agent request with priority 0.
    pub fn new(
        resource_id: impl Into<String>,
        agent_id: AgentId,
        mode: LockMode,
        timeout: Duration,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            agent_id,
            mode,
            timeout,
            task_id: None,
            priority: 0,
        }
    }

    /// Attach the task the lock is acquired for.
    pub fn with_task(mut self, task_id: TaskId, priority: i32) -> Self {
        self.task_id = Some(task_id);
        self.priority = priority;
        self
    }

    /// The owner the granted hold will be recorded under.
    pub fn owner(&self) -> LockOwner {
        LockOwner {
            agent_id: self.agent_id,
            task_id: self.task_id,
        }
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    /// Agent holding the lock.
    pub agent_id: AgentId,
    /// Task the lock is held for, if any.
    pub task_id: Option<TaskId>,
    /// Granted mode.
    pub mode: LockMode,
    /// When the hold was granted.
    pub acquired_at: DateTime<Utc>,
}

impl Holder {
    /// Owner identity of this hold.
    pub fn owner(&self) -> LockOwner {
        LockOwner {
            agent_id: self.agent_id,
            task_id: self.task_id,
        }
    }
}

/// One edge of a deadlock cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLink {
    /// Agent that is waiting.
    pub agent: AgentId,
    /// Task the waiting agent is running, if any.
    pub task: Option<TaskId>,
    /// Agent holding the resource.
    pub waiting_for: AgentId,
    /// Task the holder is running, if any.
    pub waiting_for_task: Option<TaskId>,
    /// Resource the edge waits on.
    pub resource: String,
}

/// A detected and resolved wait-for cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockInfo {
    /// When the cycle was broken.
    pub detected_at: DateTime<Utc>,
    /// Distinct agents on the cycle.
    pub involved_agents: Vec<AgentId>,
    /// Resources the cycle waits on, sorted.
    pub involved_resources: Vec<String>,
    /// The cycle as waiter → holder edges.
    pub dependency_chain: Vec<DependencyLink>,
    /// Agent whose request was aborted.
    pub victim_agent: AgentId,
    /// Task whose request was aborted, if any.
    pub victim_task: Option<TaskId>,
    /// Resource the aborted request was queued on.
    pub victim_resource: String,
}

/// Point-in-time counts for metrics and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    /// Resources with at least one holder or waiter.
    pub tracked: usize,
    /// Resources with at least one holder.
    pub locked: usize,
    /// Live queued requests across all resources.
    pub waiting_requests: usize,
}

struct Waiter {
    ticket: u64,
    owner: LockOwner,
    priority: i32,
    mode: LockMode,
    requested: Instant,
    tx: oneshot::Sender<ConclaveResult<()>>,
}

impl Waiter {
    fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct ResourceState {
    holders: Vec<Holder>,
    waiters: VecDeque<Waiter>,
}

impl ResourceState {
    fn holder_mut(&mut self, owner: LockOwner) -> Option<&mut Holder> {
        self.holders.iter_mut().find(|h| h.owner() == owner)
    }

    /// Every other holder is compatible with `mode`.
    fn admits(&self, owner: LockOwner, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|h| h.owner() != owner)
            .all(|h| h.mode.is_compatible_with(mode))
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<String, ResourceState>,
    next_ticket: u64,
}

enum Admission {
    Granted,
    Queued {
        ticket: u64,
        rx: oneshot::Receiver<ConclaveResult<()>>,
    },
}

/// Exclusive/shared locks over named resources with FIFO queues and
/// wait-for-graph deadlock detection.
///
/// Holds are recorded per [`LockOwner`]. Re-acquiring is re-entrant only for
/// the same owner. Resources are created on first acquisition and reaped as
/// soon as they have no holder and no waiter.
pub struct ResourceCoordinator {
    table: Mutex<LockTable>,
    bus: Arc<EventBus>,
}

impl ResourceCoordinator {
    /// An empty lock table publishing to `bus`.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            bus,
        }
    }

    /// Acquire `resource_id` for `agent_id`, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        resource_id: &str,
        agent_id: AgentId,
        mode: LockMode,
        timeout: Duration,
    ) -> ConclaveResult<()> {
        self.acquire_with(LockRequest::new(resource_id, agent_id, mode, timeout))
            .await
    }

    /// Acquire with task context. Suspends until granted, timed out, or
    /// aborted by deadlock resolution.
    pub async fn acquire_with(&self, request: LockRequest) -> ConclaveResult<()> {
        let (ticket, mut rx) = match self.admit(&request) {
            Admission::Granted => return Ok(()),
            Admission::Queued { ticket, rx } => (ticket, rx),
        };

        match tokio::time::timeout(request.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConclaveError::Shutdown),
            Err(_) => {
                if self.withdraw(&request.resource_id, ticket) {
                    debug!(
                        resource_id = %request.resource_id,
                        owner = %request.owner(),
                        "lock wait timed out"
                    );
                    self.bus.publish(CoordinationEvent::ResourceTimeout {
                        resource_id: request.resource_id.clone(),
                        agent_id: request.agent_id,
                    });
                    Err(ConclaveError::AcquireTimeout {
                        resource_id: request.resource_id,
                        timeout_ms: request.timeout.as_millis() as u64,
                    })
                } else {
                    // Resolved concurrently with the timeout.
                    rx.try_recv().unwrap_or(Err(ConclaveError::AcquireTimeout {
                        resource_id: request.resource_id,
                        timeout_ms: request.timeout.as_millis() as u64,
                    }))
                }
            }
        }
    }

    fn admit(&self, request: &LockRequest) -> Admission {
        let mut table = self.table.lock();
        let ticket = table.next_ticket;
        table.next_ticket += 1;
        let state = table
            .resources
            .entry(request.resource_id.clone())
            .or_default();
        let owner = request.owner();

        let held = state.holders.iter().find(|h| h.owner() == owner).map(|h| h.mode);
        if let Some(held) = held {
            if held == LockMode::Exclusive || request.mode == LockMode::Shared {
                return Admission::Granted;
            }
        }

        // Upgrades by the sole holder jump the queue.
        let grant_now = if held.is_some() {
            state.admits(owner, request.mode)
        } else {
            state.waiters.is_empty() && state.admits(owner, request.mode)
        };
        if grant_now {
            grant_hold(state, owner, request.mode);
            self.bus.publish(CoordinationEvent::ResourceAcquired {
                resource_id: request.resource_id.clone(),
                agent_id: owner.agent_id,
                mode: request.mode,
                waited_ms: 0,
            });
            debug!(resource_id = %request.resource_id, owner = %owner, mode = %request.mode, "lock granted");
            return Admission::Granted;
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            ticket,
            owner,
            priority: request.priority,
            mode: request.mode,
            requested: Instant::now(),
            tx,
        });
        debug!(
            resource_id = %request.resource_id,
            owner = %owner,
            queue = state.waiters.len(),
            "lock request queued"
        );
        self.bus.publish(CoordinationEvent::ResourceWaiting {
            resource_id: request.resource_id.clone(),
            agent_id: owner.agent_id,
            mode: request.mode,
        });
        Admission::Queued { ticket, rx }
    }

    /// Remove a queued request. `false` if it was already granted or aborted.
    fn withdraw(&self, resource_id: &str, ticket: u64) -> bool {
        let mut table = self.table.lock();
        let Some(state) = table.resources.get_mut(resource_id) else {
            return false;
        };
        let Some(pos) = state.waiters.iter().position(|w| w.ticket == ticket) else {
            return false;
        };
        state.waiters.remove(pos);
        // The withdrawn request may have been blocking shared requests behind it.
        self.grant_waiters(resource_id, state);
        if state.is_unused() {
            table.resources.remove(resource_id);
        }
        true
    }

    /// Release the direct hold `agent_id` has on `resource_id`.
    pub fn release(&self, resource_id: &str, agent_id: AgentId) -> ConclaveResult<()> {
        self.release_owner(resource_id, LockOwner::agent(agent_id))
    }

    /// Release `owner`'s hold on `resource_id` and grant from the queue.
    pub fn release_owner(&self, resource_id: &str, owner: LockOwner) -> ConclaveResult<()> {
        let mut table = self.table.lock();
        let not_held = || ConclaveError::ResourceNotHeld {
            resource_id: resource_id.to_string(),
            agent_id: owner.agent_id,
        };
        let state = table.resources.get_mut(resource_id).ok_or_else(not_held)?;
        let pos = state
            .holders
            .iter()
            .position(|h| h.owner() == owner)
            .ok_or_else(not_held)?;
        state.holders.remove(pos);
        self.bus.publish(CoordinationEvent::ResourceReleased {
            resource_id: resource_id.to_string(),
            agent_id: owner.agent_id,
        });
        debug!(resource_id = %resource_id, owner = %owner, "lock released");
        self.grant_waiters(resource_id, state);
        if state.is_unused() {
            table.resources.remove(resource_id);
        }
        Ok(())
    }

    /// Drop every hold and pending request of `agent_id`, whatever task they
    /// belong to. Returns the number of holds released.
    pub fn release_all(&self, agent_id: AgentId) -> usize {
        let mut table = self.table.lock();
        let mut released = 0;
        let ids: Vec<String> = table.resources.keys().cloned().collect();
        for id in ids {
            let Some(state) = table.resources.get_mut(&id) else {
                continue;
            };
            let before = state.holders.len();
            state.holders.retain(|h| h.agent_id != agent_id);
            let dropped = before - state.holders.len();
            if dropped > 0 {
                released += dropped;
                self.bus.publish(CoordinationEvent::ResourceReleased {
                    resource_id: id.clone(),
                    agent_id,
                });
            }
            let mut kept = VecDeque::with_capacity(state.waiters.len());
            for waiter in state.waiters.drain(..) {
                if waiter.owner.agent_id == agent_id {
                    let _ = waiter.tx.send(Err(ConclaveError::AgentUnavailable(format!(
                        "agent {agent_id} released all resources"
                    ))));
                } else {
                    kept.push_back(waiter);
                }
            }
            state.waiters = kept;
            self.grant_waiters(&id, state);
            if state.is_unused() {
                table.resources.remove(&id);
            }
        }
        if released > 0 {
            info!(agent_id = %agent_id, released, "released all locks of agent");
        }
        released
    }

    /// Grant from the queue head: consecutive shared requests together, an
    /// exclusive request alone. Abandoned requests are skipped.
    fn grant_waiters(&self, resource_id: &str, state: &mut ResourceState) {
        while let Some(front) = state.waiters.front() {
            if front.is_abandoned() {
                state.waiters.pop_front();
                continue;
            }
            if !state.admits(front.owner, front.mode) {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            let previous = state.holder_mut(waiter.owner).map(|h| h.mode);
            grant_hold(state, waiter.owner, waiter.mode);
            if waiter.tx.send(Ok(())).is_err() {
                // Caller went away between the check and the grant.
                match previous {
                    Some(mode) => {
                        if let Some(h) = state.holder_mut(waiter.owner) {
                            h.mode = mode;
                        }
                    }
                    None => state.holders.retain(|h| h.owner() != waiter.owner),
                }
                continue;
            }
            self.bus.publish(CoordinationEvent::ResourceAcquired {
                resource_id: resource_id.to_string(),
                agent_id: waiter.owner.agent_id,
                mode: waiter.mode,
                waited_ms: waiter.requested.elapsed().as_millis() as u64,
            });
            debug!(resource_id = %resource_id, owner = %waiter.owner, "queued lock granted");
        }
    }

    /// Current wait-for graph: waiting owner → owners holding the resource
    /// it waits on.
    pub fn wait_for_graph(&self) -> BTreeMap<LockOwner, BTreeSet<LockOwner>> {
        let table = self.table.lock();
        build_wait_for(&table)
    }

    /// Find and break every wait-for cycle, one victim per cycle.
    pub fn detect_and_resolve(&self) -> Vec<DeadlockInfo> {
        let mut table = self.table.lock();
        let mut resolved = Vec::new();
        loop {
            let graph = build_wait_for(&table);
            let Some(cycle) = find_cycle(&graph) else {
                break;
            };
            match self.resolve_cycle(&mut table, cycle) {
                Some(info) => resolved.push(info),
                None => {
                    error!("wait-for cycle without an abortable request");
                    break;
                }
            }
        }
        resolved
    }

    fn resolve_cycle(&self, table: &mut LockTable, cycle: Vec<LockOwner>) -> Option<DeadlockInfo> {
        let members: HashSet<LockOwner> = cycle.iter().copied().collect();

        let mut chain = Vec::new();
        for (i, owner) in cycle.iter().enumerate() {
            let next = cycle[(i + 1) % cycle.len()];
            let link = table.resources.iter().find_map(|(id, state)| {
                let waits = state
                    .waiters
                    .iter()
                    .any(|w| w.owner == *owner && !w.is_abandoned());
                let held_by_next = state.holders.iter().any(|h| h.owner() == next);
                (waits && held_by_next).then(|| DependencyLink {
                    agent: owner.agent_id,
                    task: owner.task_id,
                    waiting_for: next.agent_id,
                    waiting_for_task: next.task_id,
                    resource: id.clone(),
                })
            });
            chain.extend(link);
        }

        // Requests from cycle members blocked by other cycle members.
        let members = &members;
        let (resource_id, ticket) = table
            .resources
            .iter()
            .flat_map(|(id, state)| {
                let blocked_by_cycle = move |w: &Waiter| {
                    state
                        .holders
                        .iter()
                        .any(|h| h.owner() != w.owner && members.contains(&h.owner()))
                };
                state
                    .waiters
                    .iter()
                    .filter(move |w| {
                        members.contains(&w.owner) && !w.is_abandoned() && blocked_by_cycle(w)
                    })
                    .map(move |w| (id, w))
            })
            .min_by_key(|(_, w)| (w.priority, w.owner.task_id, w.owner.agent_id, w.ticket))
            .map(|(id, w)| (id.clone(), w.ticket))?;

        let state = table.resources.get_mut(&resource_id)?;
        let pos = state.waiters.iter().position(|w| w.ticket == ticket)?;
        let victim = state.waiters.remove(pos)?;
        let _ = victim.tx.send(Err(ConclaveError::DeadlockDetected {
            resource_id: resource_id.clone(),
        }));
        self.grant_waiters(&resource_id, state);
        if state.is_unused() {
            table.resources.remove(&resource_id);
        }

        let mut involved_agents: Vec<AgentId> = Vec::with_capacity(cycle.len());
        for owner in &cycle {
            if !involved_agents.contains(&owner.agent_id) {
                involved_agents.push(owner.agent_id);
            }
        }
        let mut involved_resources: Vec<String> =
            chain.iter().map(|l| l.resource.clone()).collect();
        involved_resources.sort();
        involved_resources.dedup();

        warn!(
            owners = cycle.len(),
            victim = %victim.owner,
            resource_id = %resource_id,
            "deadlock resolved"
        );
        self.bus.publish(CoordinationEvent::ConflictDetected {
            agents: involved_agents.clone(),
            resources: involved_resources.clone(),
        });
        self.bus.publish(CoordinationEvent::ConflictResolved {
            victim_agent: victim.owner.agent_id,
            victim_task: victim.owner.task_id,
            resource_id: resource_id.clone(),
        });

        Some(DeadlockInfo {
            detected_at: Utc::now(),
            involved_agents,
            involved_resources,
            dependency_chain: chain,
            victim_agent: victim.owner.agent_id,
            victim_task: victim.owner.task_id,
            victim_resource: resource_id,
        })
    }

    /// Check mutual exclusion on every resource.
    pub fn verify(&self) -> ConclaveResult<()> {
        let table = self.table.lock();
        for (id, state) in &table.resources {
            let exclusive = state
                .holders
                .iter()
                .filter(|h| h.mode == LockMode::Exclusive)
                .count();
            if exclusive > 0 && state.holders.len() > 1 {
                return Err(ConclaveError::InvariantViolation(format!(
                    "resource '{id}' has an exclusive holder and {} holders in total",
                    state.holders.len()
                )));
            }
            let distinct: HashSet<LockOwner> = state.holders.iter().map(Holder::owner).collect();
            if distinct.len() != state.holders.len() {
                return Err(ConclaveError::InvariantViolation(format!(
                    "resource '{id}' lists an owner twice"
                )));
            }
        }
        Ok(())
    }

    /// Current holders of `resource_id`, in grant order.
    pub fn holders(&self, resource_id: &str) -> Vec<Holder> {
        self.table
            .lock()
            .resources
            .get(resource_id)
            .map(|s| s.holders.clone())
            .unwrap_or_default()
    }

    /// Live queued requests on `resource_id`.
    pub fn queue_len(&self, resource_id: &str) -> usize {
        self.table
            .lock()
            .resources
            .get(resource_id)
            .map(|s| s.waiters.iter().filter(|w| !w.is_abandoned()).count())
            .unwrap_or(0)
    }

    /// Tracked, locked and waiting counts.
    pub fn stats(&self) -> ResourceStats {
        let table = self.table.lock();
        ResourceStats {
            tracked: table.resources.len(),
            locked: table
                .resources
                .values()
                .filter(|s| !s.holders.is_empty())
                .count(),
            waiting_requests: table
                .resources
                .values()
                .map(|s| s.waiters.iter().filter(|w| !w.is_abandoned()).count())
                .sum(),
        }
    }
}

fn grant_hold(state: &mut ResourceState, owner: LockOwner, mode: LockMode) {
    match state.holder_mut(owner) {
        Some(holder) => {
            if mode == LockMode::Exclusive {
                holder.mode = LockMode::Exclusive;
            }
        }
        None => state.holders.push(Holder {
            agent_id: owner.agent_id,
            task_id: owner.task_id,
            mode,
            acquired_at: Utc::now(),
        }),
    }
}

fn build_wait_for(table: &LockTable) -> BTreeMap<LockOwner, BTreeSet<LockOwner>> {
    let mut graph: BTreeMap<LockOwner, BTreeSet<LockOwner>> = BTreeMap::new();
    for state in table.resources.values() {
        for waiter in state.waiters.iter().filter(|w| !w.is_abandoned()) {
            for holder in &state.holders {
                if holder.owner() != waiter.owner {
                    graph.entry(waiter.owner).or_default().insert(holder.owner());
                }
            }
        }
    }
    graph
}

/// First cycle found by DFS with recursion-stack marking, as an owner path.
fn find_cycle(graph: &BTreeMap<LockOwner, BTreeSet<LockOwner>>) -> Option<Vec<LockOwner>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();
    for node in graph.keys() {
        if !visited.contains(node) {
            if let Some(cycle) = dfs_cycle(*node, graph, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    node: LockOwner,
    graph: &BTreeMap<LockOwner, BTreeSet<LockOwner>>,
    visited: &mut HashSet<LockOwner>,
    rec_stack: &mut HashSet<LockOwner>,
    path: &mut Vec<LockOwner>,
) -> Option<Vec<LockOwner>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(&node) {
        for neighbor in neighbors {
            if !visited.contains(neighbor) {
                if let Some(cycle) = dfs_cycle(*neighbor, graph, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(neighbor) {
                if let Some(start) = path.iter().position(|n| n == neighbor) {
                    return Some(path[start..].to_vec());
                }
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    None
}
