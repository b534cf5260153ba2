use chrono::{DateTime, Utc};
use conclave_core::{
    AgentId, BusMessage, CoordinationEvent, EventEnvelope, EventSubscription, MetricsConfig,
    TaskId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// One sample of a named series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Sample time.
    pub at: DateTime<Utc>,
    /// Sampled value.
    pub value: f64,
}

/// Task throughput and latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Tasks created.
    pub total: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed terminally.
    pub failed: u64,
    /// Tasks neither completed nor terminally failed.
    pub active: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Ready periods in which a task found no agent. Not failures.
    pub awaiting_agent: u64,
    /// completed / (completed + failed).
    pub success_rate: f64,
    /// Completed tasks per second of collector uptime.
    pub throughput_per_sec: f64,
    /// Mean over the retained duration samples.
    pub avg_duration_ms: f64,
    /// Median duration.
    pub p50_duration_ms: u64,
    /// 95th percentile duration.
    pub p95_duration_ms: u64,
    /// 99th percentile duration.
    pub p99_duration_ms: u64,
}

/// Agent population by lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Live (non-terminated) agents.
    pub live: u64,
    /// Agents registered but not yet activated.
    pub creating: u64,
    /// Agents accepting work with nothing to do.
    pub idle: u64,
    /// Agents running at least one task.
    pub busy: u64,
    /// Agents in the error state.
    pub error: u64,
    /// Agents removed since the last clear.
    pub terminated: u64,
    /// Assignments refused at capacity.
    pub overload_rejections: u64,
    /// busy / live.
    pub utilization: f64,
}

/// Lock contention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Resources seen since the last clear.
    pub observed: u64,
    /// Resources with at least one holder.
    pub locked: u64,
    /// Queued lock requests.
    pub waiting_requests: u64,
    /// Grants, immediate or queued.
    pub acquisitions: u64,
    /// Requests that gave up waiting.
    pub timeouts: u64,
    /// Mean queue time per grant.
    pub avg_wait_ms: f64,
    /// locked / observed.
    pub utilization: f64,
}

/// Inter-agent message traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetrics {
    /// Messages sent (a broadcast counts once).
    pub sent: u64,
    /// Messages delivered to a recipient.
    pub received: u64,
}

/// Deadlock activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictMetrics {
    /// Wait-for cycles found.
    pub detected: u64,
    /// Cycles broken by aborting a waiter.
    pub resolved: u64,
}

/// Error counts and rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    /// Errors since the last clear.
    pub total: u64,
    /// Errors within the trailing window.
    pub recent: u64,
    /// `recent` scaled to one minute.
    pub rate_per_minute: f64,
    /// Counts by event topic.
    pub by_topic: BTreeMap<String, u64>,
    /// Task failures by error kind, e.g. `acquire_timeout`.
    pub by_kind: BTreeMap<String, u64>,
}

/// Collector memory indicators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorMemory {
    /// Retained task duration samples.
    pub duration_samples: u64,
    /// Points across every history series.
    pub history_points: u64,
    /// Flushed snapshots kept for history queries.
    pub snapshots_retained: u64,
    /// Events lost to subscriber lag.
    pub dropped_events: u64,
}

/// Immutable point-in-time view of coordination health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Collector uptime.
    pub uptime_ms: u64,
    /// Events applied.
    pub events_processed: u64,
    /// Highest bus sequence number seen.
    pub last_seq: u64,
    /// Task counters.
    pub tasks: TaskMetrics,
    /// Agent counters.
    pub agents: AgentMetrics,
    /// Resource counters.
    pub resources: ResourceMetrics,
    /// Message counters.
    pub messages: MessageMetrics,
    /// Conflict counters.
    pub conflicts: ConflictMetrics,
    /// Error counters.
    pub errors: ErrorMetrics,
    /// Collector footprint.
    pub memory: CollectorMemory,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AgentPhase {
    Creating,
    Idle,
    Busy,
    Error,
}

struct CollectorState {
    started: Instant,
    events_processed: u64,
    last_seq: u64,
    dropped_events: u64,

    total_tasks: u64,
    completed: u64,
    failed: u64,
    retries: u64,
    awaiting_agent: u64,
    active: HashSet<TaskId>,
    durations: VecDeque<u64>,

    agents: HashMap<AgentId, AgentPhase>,
    terminated: u64,
    overloads: u64,

    observed: HashSet<String>,
    holders: HashMap<String, HashSet<AgentId>>,
    waiting: HashSet<(String, AgentId)>,
    acquisitions: u64,
    wait_total_ms: u64,
    timeouts: u64,

    sent: u64,
    received: u64,
    detected: u64,
    resolved: u64,

    error_total: u64,
    error_times: VecDeque<DateTime<Utc>>,
    errors_by_topic: BTreeMap<String, u64>,
    errors_by_kind: BTreeMap<String, u64>,

    history: HashMap<String, VecDeque<MetricPoint>>,
    snapshots: VecDeque<CoordinationSnapshot>,
}

impl CollectorState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            events_processed: 0,
            last_seq: 0,
            dropped_events: 0,
            total_tasks: 0,
            completed: 0,
            failed: 0,
            retries: 0,
            awaiting_agent: 0,
            active: HashSet::new(),
            durations: VecDeque::new(),
            agents: HashMap::new(),
            terminated: 0,
            overloads: 0,
            observed: HashSet::new(),
            holders: HashMap::new(),
            waiting: HashSet::new(),
            acquisitions: 0,
            wait_total_ms: 0,
            timeouts: 0,
            sent: 0,
            received: 0,
            detected: 0,
            resolved: 0,
            error_total: 0,
            error_times: VecDeque::new(),
            errors_by_topic: BTreeMap::new(),
            errors_by_kind: BTreeMap::new(),
            history: HashMap::new(),
            snapshots: VecDeque::new(),
        }
    }

    fn record_error(&mut self, topic: &str, at: DateTime<Utc>) {
        self.error_total += 1;
        self.error_times.push_back(at);
        *self.errors_by_topic.entry(topic.to_string()).or_default() += 1;
    }
}

/// Subscribes to the event bus and aggregates rolling coordination metrics.
///
/// The collector only observes; it never feeds back into scheduling.
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
    config: MetricsConfig,
}

impl MetricsCollector {
    /// An empty collector.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            state: Mutex::new(CollectorState::new()),
            config,
        }
    }

    /// Apply one event.
    pub fn record_event(&self, envelope: &EventEnvelope) {
        let mut s = self.state.lock();
        s.events_processed += 1;
        s.last_seq = s.last_seq.max(envelope.seq);
        let at = envelope.at;

        match &envelope.event {
            CoordinationEvent::TaskCreated { task_id, .. } => {
                if s.active.insert(*task_id) {
                    s.total_tasks += 1;
                }
            }
            CoordinationEvent::TaskReady { .. } | CoordinationEvent::TaskStarted { .. } => {}
            CoordinationEvent::TaskAwaitingAgent { .. } => s.awaiting_agent += 1,
            CoordinationEvent::TaskCompleted {
                task_id,
                duration_ms,
                ..
            } => {
                if s.active.remove(task_id) {
                    s.completed += 1;
                    s.durations.push_back(*duration_ms);
                    while s.durations.len() > self.config.max_duration_samples {
                        s.durations.pop_front();
                    }
                }
            }
            CoordinationEvent::TaskFailed {
                task_id,
                will_retry,
                error_kind,
                ..
            } => {
                s.record_error(envelope.event.topic(), at);
                if let Some(kind) = error_kind {
                    *s.errors_by_kind.entry(kind.clone()).or_default() += 1;
                }
                if !will_retry && s.active.remove(task_id) {
                    s.failed += 1;
                }
            }
            CoordinationEvent::TaskRetrying { .. } => s.retries += 1,

            CoordinationEvent::AgentSpawned { agent_id, .. } => {
                s.agents.insert(*agent_id, AgentPhase::Creating);
            }
            CoordinationEvent::AgentActive { agent_id, .. } => {
                s.agents.insert(*agent_id, AgentPhase::Busy);
            }
            CoordinationEvent::AgentIdle { agent_id } => {
                s.agents.insert(*agent_id, AgentPhase::Idle);
            }
            CoordinationEvent::AgentOverloaded { .. } => s.overloads += 1,
            CoordinationEvent::AgentError { agent_id, .. } => {
                s.agents.insert(*agent_id, AgentPhase::Error);
                s.waiting.retain(|(_, a)| a != agent_id);
                s.record_error(envelope.event.topic(), at);
            }
            CoordinationEvent::AgentTerminated { agent_id } => {
                if s.agents.remove(agent_id).is_some() {
                    s.terminated += 1;
                }
                s.waiting.retain(|(_, a)| a != agent_id);
            }

            CoordinationEvent::ResourceWaiting {
                resource_id,
                agent_id,
                ..
            } => {
                s.observed.insert(resource_id.clone());
                s.waiting.insert((resource_id.clone(), *agent_id));
            }
            CoordinationEvent::ResourceAcquired {
                resource_id,
                agent_id,
                waited_ms,
                ..
            } => {
                s.observed.insert(resource_id.clone());
                s.waiting.remove(&(resource_id.clone(), *agent_id));
                s.holders
                    .entry(resource_id.clone())
                    .or_default()
                    .insert(*agent_id);
                s.acquisitions += 1;
                s.wait_total_ms += waited_ms;
            }
            CoordinationEvent::ResourceReleased {
                resource_id,
                agent_id,
            } => {
                let emptied = s.holders.get_mut(resource_id).is_some_and(|h| {
                    h.remove(agent_id);
                    h.is_empty()
                });
                if emptied {
                    s.holders.remove(resource_id);
                }
            }
            CoordinationEvent::ResourceTimeout {
                resource_id,
                agent_id,
            } => {
                s.waiting.remove(&(resource_id.clone(), *agent_id));
                s.timeouts += 1;
                s.record_error(envelope.event.topic(), at);
            }

            CoordinationEvent::MessageSent { .. } => s.sent += 1,
            CoordinationEvent::MessageReceived { .. } => s.received += 1,

            CoordinationEvent::ConflictDetected { .. } => s.detected += 1,
            CoordinationEvent::ConflictResolved {
                victim_agent,
                resource_id,
                ..
            } => {
                s.resolved += 1;
                s.waiting.remove(&(resource_id.clone(), *victim_agent));
            }
        }
    }

    /// Append a sample to the named series.
    pub fn record_metric(&self, name: &str, value: f64) {
        let now = Utc::now();
        let mut s = self.state.lock();
        self.push_point(&mut s, name, MetricPoint { at: now, value });
    }

    fn push_point(&self, s: &mut CollectorState, name: &str, point: MetricPoint) {
        let series = s.history.entry(name.to_string()).or_default();
        series.push_back(point);
        while series.len() > self.config.max_history_points {
            series.pop_front();
        }
    }

    /// Account for events lost to subscriber lag.
    pub fn record_dropped(&self, count: u64) {
        self.state.lock().dropped_events += count;
    }

    /// Consistent snapshot taken under the collector lock.
    pub fn current_metrics(&self) -> CoordinationSnapshot {
        let mut s = self.state.lock();
        self.snapshot_locked(&mut s, Utc::now())
    }

    fn snapshot_locked(&self, s: &mut CollectorState, now: DateTime<Utc>) -> CoordinationSnapshot {
        let window = chrono::Duration::milliseconds(
            i64::try_from(self.config.error_window_ms).unwrap_or(i64::MAX),
        );
        while s.error_times.front().is_some_and(|t| now - *t > window) {
            s.error_times.pop_front();
        }

        let uptime = s.started.elapsed();
        let uptime_secs = uptime.as_secs_f64();

        let mut sorted: Vec<u64> = s.durations.iter().copied().collect();
        sorted.sort_unstable();
        let avg_duration_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };
        let finished = s.completed + s.failed;

        let tasks = TaskMetrics {
            total: s.total_tasks,
            completed: s.completed,
            failed: s.failed,
            active: s.active.len() as u64,
            retries: s.retries,
            awaiting_agent: s.awaiting_agent,
            success_rate: ratio(s.completed, finished),
            throughput_per_sec: if uptime_secs > 0.0 {
                s.completed as f64 / uptime_secs
            } else {
                0.0
            },
            avg_duration_ms,
            p50_duration_ms: percentile(&sorted, 50.0),
            p95_duration_ms: percentile(&sorted, 95.0),
            p99_duration_ms: percentile(&sorted, 99.0),
        };

        let mut agents = AgentMetrics {
            live: s.agents.len() as u64,
            terminated: s.terminated,
            overload_rejections: s.overloads,
            ..AgentMetrics::default()
        };
        for phase in s.agents.values() {
            match phase {
                AgentPhase::Creating => agents.creating += 1,
                AgentPhase::Idle => agents.idle += 1,
                AgentPhase::Busy => agents.busy += 1,
                AgentPhase::Error => agents.error += 1,
            }
        }
        agents.utilization = ratio(agents.busy, agents.live);

        let locked = s.holders.len() as u64;
        let observed = s.observed.len() as u64;
        let resources = ResourceMetrics {
            observed,
            locked,
            waiting_requests: s.waiting.len() as u64,
            acquisitions: s.acquisitions,
            timeouts: s.timeouts,
            avg_wait_ms: if s.acquisitions == 0 {
                0.0
            } else {
                s.wait_total_ms as f64 / s.acquisitions as f64
            },
            utilization: ratio(locked, observed),
        };

        let recent = s.error_times.len() as u64;
        let errors = ErrorMetrics {
            total: s.error_total,
            recent,
            rate_per_minute: recent as f64 * 60_000.0 / self.config.error_window_ms.max(1) as f64,
            by_topic: s.errors_by_topic.clone(),
            by_kind: s.errors_by_kind.clone(),
        };

        CoordinationSnapshot {
            timestamp: now,
            uptime_ms: uptime.as_millis() as u64,
            events_processed: s.events_processed,
            last_seq: s.last_seq,
            tasks,
            agents,
            resources,
            messages: MessageMetrics {
                sent: s.sent,
                received: s.received,
            },
            conflicts: ConflictMetrics {
                detected: s.detected,
                resolved: s.resolved,
            },
            errors,
            memory: CollectorMemory {
                duration_samples: s.durations.len() as u64,
                history_points: s.history.values().map(|h| h.len() as u64).sum(),
                snapshots_retained: s.snapshots.len() as u64,
                dropped_events: s.dropped_events,
            },
        }
    }

    /// Sample derived gauges into history, retain the snapshot, and evict
    /// anything older than the retention window.
    pub fn flush(&self) -> CoordinationSnapshot {
        let now = Utc::now();
        let mut s = self.state.lock();
        let snapshot = self.snapshot_locked(&mut s, now);

        let gauges = [
            ("tasks.active", snapshot.tasks.active as f64),
            ("tasks.success_rate", snapshot.tasks.success_rate),
            ("tasks.throughput_per_sec", snapshot.tasks.throughput_per_sec),
            ("tasks.p95_duration_ms", snapshot.tasks.p95_duration_ms as f64),
            ("agents.utilization", snapshot.agents.utilization),
            ("resources.utilization", snapshot.resources.utilization),
            ("errors.rate_per_minute", snapshot.errors.rate_per_minute),
        ];
        for (name, value) in gauges {
            self.push_point(&mut s, name, MetricPoint { at: now, value });
        }

        s.snapshots.push_back(snapshot.clone());
        while s.snapshots.len() > self.config.max_history_points {
            s.snapshots.pop_front();
        }

        let retention = chrono::Duration::milliseconds(
            i64::try_from(self.config.retention_window_ms).unwrap_or(i64::MAX),
        );
        let cutoff = now - retention;
        for series in s.history.values_mut() {
            while series.front().is_some_and(|p| p.at < cutoff) {
                series.pop_front();
            }
        }
        s.history.retain(|_, series| !series.is_empty());
        while s.snapshots.front().is_some_and(|snap| snap.timestamp < cutoff) {
            s.snapshots.pop_front();
        }
        debug!(events = snapshot.events_processed, "metrics flushed");
        snapshot
    }

    /// Retained samples of `name`, oldest first.
    pub fn metric_history(&self, name: &str) -> Vec<MetricPoint> {
        self.state
            .lock()
            .history
            .get(name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained flushed snapshots, oldest first.
    pub fn snapshot_history(&self) -> Vec<CoordinationSnapshot> {
        self.state.lock().snapshots.iter().cloned().collect()
    }

    /// Reset every counter and all history.
    pub fn clear(&self) {
        *self.state.lock() = CollectorState::new();
    }

    /// Consume the bus until it closes or `shutdown` flips.
    pub async fn consume(&self, mut subscription: EventSubscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(BusMessage::Event(envelope)) => self.record_event(&envelope),
                    Some(BusMessage::Lagged(n)) => {
                        warn!(dropped = n, "metrics subscriber lagged");
                        self.record_dropped(n);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Apply whatever is already buffered.
        while let Some(message) = subscription.try_recv() {
            match message {
                BusMessage::Event(envelope) => self.record_event(&envelope),
                BusMessage::Lagged(n) => self.record_dropped(n),
            }
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
