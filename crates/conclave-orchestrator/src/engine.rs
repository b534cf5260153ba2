use crate::executor::{ExecutionOutput, ExecutionRequest, TaskExecutor};
use crate::mailbox::{AgentMessage, Mailbox};
use crate::metrics::{CoordinationSnapshot, MetricsCollector};
use crate::registry::AgentRegistry;
use crate::resources::{LockOwner, LockRequest, ResourceCoordinator};
use crate::scheduler::{Dispatch, TaskScheduler};
use crate::types::{Agent, AgentDescriptor, ResourceClaim, Task, TaskSpec};
use chrono::Utc;
use conclave_core::{
    AgentId, ConclaveError, ConclaveResult, EngineConfig, EventBus, EventSubscription, LockMode,
    TaskId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

struct RunningTask {
    agent_id: AgentId,
    abort: AbortHandle,
    resources: Vec<ResourceClaim>,
}

struct EngineInner {
    config: EngineConfig,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    resources: Arc<ResourceCoordinator>,
    scheduler: Arc<TaskScheduler>,
    metrics: Arc<MetricsCollector>,
    mailbox: Mailbox,
    executor: Arc<dyn TaskExecutor>,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    wake: Notify,
    fatal: Mutex<Option<ConclaveError>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

/// The coordination engine: scheduler, registry, resource coordinator and
/// metrics collector wired to one event bus and driven by background loops.
pub struct CoordinationEngine {
    inner: Arc<EngineInner>,
    metrics_subscription: Mutex<Option<EventSubscription>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationEngine {
    /// Validate `config` and build every component. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: EngineConfig, executor: Arc<dyn TaskExecutor>) -> ConclaveResult<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new(config.event_bus.capacity));
        // Subscribed before anything can publish.
        let metrics_subscription = bus.subscribe();
        let registry = Arc::new(AgentRegistry::new(
            config.orchestrator.max_concurrent_agents,
            bus.clone(),
        ));
        let resources = Arc::new(ResourceCoordinator::new(bus.clone()));
        let scheduler = Arc::new(TaskScheduler::new(&config, registry.clone(), bus.clone()));
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let mailbox = Mailbox::new(config.coordination.mailbox_capacity, bus.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                bus,
                registry,
                resources,
                scheduler,
                metrics,
                mailbox,
                executor,
                running: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                fatal: Mutex::new(None),
                shutdown_tx,
                stopped: AtomicBool::new(false),
            }),
            metrics_subscription: Mutex::new(Some(metrics_subscription)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background loops: scheduler tick, deadlock scan, metrics
    /// consumption and flush, health check and pruning.
    pub fn start(&self) -> ConclaveResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ConclaveError::Shutdown);
        }
        let Some(subscription) = self.metrics_subscription.lock().take() else {
            return Err(ConclaveError::InvalidTransition(
                "engine already started".into(),
            ));
        };
        let inner = &self.inner;
        let mut handles = self.handles.lock();

        handles.push(tokio::spawn(tick_loop(
            inner.clone(),
            inner.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(deadlock_loop(
            inner.clone(),
            inner.shutdown_tx.subscribe(),
        )));
        {
            let metrics = inner.metrics.clone();
            let shutdown = inner.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                metrics.consume(subscription, shutdown).await;
            }));
        }
        handles.push(tokio::spawn(flush_loop(
            inner.clone(),
            inner.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(health_loop(
            inner.clone(),
            inner.shutdown_tx.subscribe(),
        )));

        info!(
            max_agents = inner.config.orchestrator.max_concurrent_agents,
            tick_ms = inner.config.scheduler.tick_interval_ms,
            "coordination engine started"
        );
        Ok(())
    }

    /// Stop every loop, abort in-flight executions and wait for the loops
    /// to finish.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        let running: Vec<RunningTask> = self.inner.running.lock().drain().map(|(_, r)| r).collect();
        for task in running {
            task.abort.abort();
            self.inner.resources.release_all(task.agent_id);
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("coordination engine stopped");
    }

    /// The invariant violation that stopped the engine, if any.
    pub fn fatal_error(&self) -> Option<ConclaveError> {
        self.inner.fatal.lock().clone()
    }

    fn ensure_running(&self) -> ConclaveResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) || self.inner.fatal.lock().is_some() {
            return Err(ConclaveError::Shutdown);
        }
        Ok(())
    }

    // -- Submission interface --------------------------------------------

    /// Submit one task.
    pub fn submit_task(&self, spec: TaskSpec) -> ConclaveResult<TaskId> {
        self.ensure_running()?;
        let id = self.inner.scheduler.submit(spec)?;
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Submit tasks atomically; they may reference each other by id.
    pub fn submit_tasks(&self, specs: Vec<TaskSpec>) -> ConclaveResult<Vec<TaskId>> {
        self.ensure_running()?;
        let ids = self.inner.scheduler.submit_batch(specs)?;
        self.inner.wake.notify_one();
        Ok(ids)
    }

    /// Register and activate an agent.
    pub fn register_agent(&self, descriptor: AgentDescriptor) -> ConclaveResult<AgentId> {
        self.ensure_running()?;
        let id = self.inner.registry.register(descriptor)?;
        self.inner.registry.activate(id)?;
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Current coordination snapshot.
    pub fn query_metrics(&self) -> CoordinationSnapshot {
        self.inner.metrics.current_metrics()
    }

    /// Snapshot of one task.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.scheduler.task(task_id)
    }

    /// Every tracked task.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.scheduler.tasks()
    }

    /// Snapshot of one agent.
    pub fn agent(&self, agent_id: AgentId) -> Option<Agent> {
        self.inner.registry.get(agent_id)
    }

    /// Every live agent.
    pub fn agents(&self) -> Vec<Agent> {
        self.inner.registry.snapshot()
    }

    /// Cancel a task, aborting its execution if it is running.
    pub fn cancel_task(&self, task_id: TaskId) -> ConclaveResult<()> {
        let agent = self.inner.scheduler.cancel(task_id)?;
        if agent.is_some() {
            self.inner.abort_running(task_id);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Record that the agent is alive.
    pub fn heartbeat(&self, agent_id: AgentId) -> ConclaveResult<()> {
        self.inner.registry.heartbeat(agent_id)
    }

    /// Move an agent to `error`, failing its running tasks with
    /// `AgentUnavailable`.
    pub fn report_agent_error(&self, agent_id: AgentId, reason: &str) -> ConclaveResult<()> {
        let orphaned = self.inner.registry.mark_error(agent_id, reason)?;
        self.inner.handle_agent_loss(agent_id, orphaned, reason);
        Ok(())
    }

    /// `error → idle` once the agent has been drained.
    pub fn reactivate_agent(&self, agent_id: AgentId) -> ConclaveResult<()> {
        self.inner.registry.activate(agent_id)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove an agent, failing its running tasks and discarding its inbox.
    pub fn terminate_agent(&self, agent_id: AgentId) -> ConclaveResult<()> {
        let orphaned = self.inner.registry.terminate(agent_id)?;
        self.inner
            .handle_agent_loss(agent_id, orphaned, "agent terminated");
        let dropped = self.inner.mailbox.discard(agent_id);
        if dropped > 0 {
            debug!(agent_id = %agent_id, dropped, "undelivered messages discarded");
        }
        Ok(())
    }

    // -- Agent messaging -------------------------------------------------

    /// Send a message from one registered agent to another, or to every
    /// other registered agent when `to` is `None`. Returns the number of
    /// inboxes it was queued in.
    pub fn send_message(
        &self,
        from: AgentId,
        to: Option<AgentId>,
        topic: &str,
        payload: serde_json::Value,
    ) -> ConclaveResult<usize> {
        self.ensure_running()?;
        let registry = &self.inner.registry;
        if registry.get(from).is_none() {
            return Err(ConclaveError::AgentNotFound(from));
        }
        let recipients: Vec<AgentId> = match to {
            Some(to) => {
                if registry.get(to).is_none() {
                    return Err(ConclaveError::AgentNotFound(to));
                }
                vec![to]
            }
            None => registry
                .snapshot()
                .into_iter()
                .map(|a| a.id)
                .filter(|id| *id != from)
                .collect(),
        };
        self.inner
            .mailbox
            .send(from, to, &recipients, topic, payload);
        Ok(recipients.len())
    }

    /// Drain the agent's inbox, oldest message first.
    pub fn receive_messages(&self, agent_id: AgentId) -> ConclaveResult<Vec<AgentMessage>> {
        if self.inner.registry.get(agent_id).is_none() {
            return Err(ConclaveError::AgentNotFound(agent_id));
        }
        Ok(self.inner.mailbox.receive(agent_id))
    }

    /// Acquire a resource directly. `None` uses the configured default
    /// timeout.
    pub async fn acquire(
        &self,
        resource_id: &str,
        agent_id: AgentId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> ConclaveResult<()> {
        let timeout = timeout.unwrap_or_else(|| self.inner.acquire_timeout());
        self.inner
            .resources
            .acquire(resource_id, agent_id, mode, timeout)
            .await
    }

    /// Release a lock taken with [`acquire`](Self::acquire).
    pub fn release(&self, resource_id: &str, agent_id: AgentId) -> ConclaveResult<()> {
        self.inner.resources.release(resource_id, agent_id)
    }

    /// Completion reported by a collaborator that runs work outside the
    /// executor. Any in-flight execution of the task is aborted.
    pub fn report_completion(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        output: Option<serde_json::Value>,
    ) -> ConclaveResult<()> {
        self.inner.scheduler.complete(task_id, agent_id, output)?;
        self.inner.abort_running(task_id);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Failure reported by an external collaborator; retried like an
    /// executor failure.
    pub fn report_failure(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        error: ConclaveError,
    ) -> ConclaveResult<()> {
        self.inner.scheduler.fail(task_id, Some(agent_id), &error)?;
        self.inner.abort_running(task_id);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Poll until every tracked task is terminal or `timeout` elapses.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let poll = async {
            while !self.inner.scheduler.is_drained() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Validated configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The bus every component publishes to.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Underlying scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.inner.scheduler
    }

    /// Underlying agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    /// Underlying resource coordinator.
    pub fn resources(&self) -> &Arc<ResourceCoordinator> {
        &self.inner.resources
    }

    /// Underlying metrics collector.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }
}

impl Drop for CoordinationEngine {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send(true);
        for handle in self.handles.lock().iter() {
            handle.abort();
        }
    }
}

impl EngineInner {
    fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.config.coordination.default_acquire_timeout_ms)
    }

    fn spawn_dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        let task_id = dispatch.task_id;
        let agent_id = dispatch.agent_id;
        let resources = dispatch.resources.clone();
        // Held across the spawn so the task cannot unregister itself first.
        let mut running = self.running.lock();
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.run_dispatch(dispatch).await });
        running.insert(
            task_id,
            RunningTask {
                agent_id,
                abort: handle.abort_handle(),
                resources,
            },
        );
    }

    async fn run_dispatch(self: Arc<Self>, dispatch: Dispatch) {
        let task_id = dispatch.task_id;
        let agent_id = dispatch.agent_id;

        let mut held: Vec<&ResourceClaim> = Vec::with_capacity(dispatch.resources.len());
        let mut result: ConclaveResult<ExecutionOutput> = Ok(ExecutionOutput::default());
        for claim in &dispatch.resources {
            let request = LockRequest::new(
                claim.resource_id.clone(),
                agent_id,
                claim.mode,
                self.acquire_timeout(),
            )
            .with_task(task_id, dispatch.priority);
            match self.resources.acquire_with(request).await {
                Ok(()) => held.push(claim),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() {
            let request = ExecutionRequest::from(&dispatch);
            result = match tokio::time::timeout(dispatch.timeout, self.executor.execute(request))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ConclaveError::ExecutionTimeout(
                    dispatch.timeout.as_millis() as u64,
                )),
            };
        }

        for claim in held.iter().rev() {
            let owner = LockOwner::task(agent_id, task_id);
            if let Err(e) = self.resources.release_owner(&claim.resource_id, owner) {
                debug!(task_id = %task_id, error = %e, "claim already released");
            }
        }

        if self.running.lock().remove(&task_id).is_none() {
            // Cancelled or orphaned while finishing; the scheduler already knows.
            return;
        }

        let reported = match result {
            Ok(output) => self
                .scheduler
                .complete(task_id, agent_id, Some(output.output)),
            Err(e) => self.scheduler.fail(task_id, Some(agent_id), &e).map(|_| ()),
        };
        if let Err(e) = reported {
            warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "execution result discarded");
        }
        self.wake.notify_one();
    }

    /// Abort an in-flight execution and release the locks it declared.
    fn abort_running(&self, task_id: TaskId) {
        let Some(running) = self.running.lock().remove(&task_id) else {
            return;
        };
        running.abort.abort();
        let owner = LockOwner::task(running.agent_id, task_id);
        for claim in &running.resources {
            let _ = self.resources.release_owner(&claim.resource_id, owner);
        }
    }

    fn handle_agent_loss(&self, agent_id: AgentId, orphaned: Vec<TaskId>, reason: &str) {
        for task_id in orphaned {
            if let Some(running) = self.running.lock().remove(&task_id) {
                running.abort.abort();
            }
            let error = ConclaveError::AgentUnavailable(format!("{agent_id}: {reason}"));
            if let Err(e) = self.scheduler.fail(task_id, Some(agent_id), &error) {
                debug!(task_id = %task_id, error = %e, "orphaned task not running");
            }
        }
        self.resources.release_all(agent_id);
        self.wake.notify_one();
    }

    fn halt(&self, error: ConclaveError) {
        error!(error = %error, "invariant violated; stopping engine");
        *self.fatal.lock() = Some(error);
        let _ = self.shutdown_tx.send(true);
    }
}

fn stop_requested(changed: Result<(), watch::error::RecvError>, shutdown: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *shutdown.borrow()
}

fn interval(ms: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(inner.config.scheduler.tick_interval_ms);
    loop {
        for dispatch in inner.scheduler.tick() {
            inner.spawn_dispatch(dispatch);
        }
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(period) => {}
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
            }
        }
    }
    debug!("scheduler tick loop stopped");
}

async fn deadlock_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.coordination.deadlock_detection_interval_ms);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
        }
        let resolved = inner.resources.detect_and_resolve();
        if !resolved.is_empty() {
            info!(count = resolved.len(), "deadlocks resolved");
            inner.wake.notify_one();
        }
        if let Err(e) = inner.resources.verify() {
            inner.halt(e);
            break;
        }
    }
    debug!("deadlock detection loop stopped");
}

async fn flush_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.metrics.flush_interval_ms);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.metrics.flush();
            }
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
            }
        }
    }
}

async fn health_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.orchestrator.health_check_interval_ms);
    let ttl = Duration::from_millis(inner.config.orchestrator.finished_task_ttl_ms);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
        }
        if let Some(timeout_ms) = inner.config.orchestrator.heartbeat_timeout_ms {
            let timeout = chrono::Duration::milliseconds(i64::try_from(timeout_ms).unwrap_or(i64::MAX));
            for (agent_id, orphaned) in inner.registry.health_check(Utc::now(), timeout) {
                inner.handle_agent_loss(agent_id, orphaned, "heartbeat timeout");
            }
        }
        inner.scheduler.prune_finished(ttl);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, request: ExecutionRequest) -> ConclaveResult<ExecutionOutput> {
            Ok(ExecutionOutput::new(request.payload))
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scheduler.tick_interval_ms = 5;
        config.coordination.deadlock_detection_interval_ms = 10;
        config.metrics.flush_interval_ms = 20;
        config
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.orchestrator.max_concurrent_agents = 0;
        let err = CoordinationEngine::new(config, Arc::new(Echo)).err().unwrap();
        assert!(matches!(err, ConclaveError::Config(_)));
    }

    #[tokio::test]
    async fn test_runs_task_to_completion() {
        let engine = CoordinationEngine::new(fast_config(), Arc::new(Echo)).unwrap();
        engine.start().unwrap();
        engine.register_agent(AgentDescriptor::new("worker")).unwrap();
        let id = engine
            .submit_task(TaskSpec::new("echo", "echo payload").with_payload(serde_json::json!({"n": 1})))
            .unwrap();
        assert!(engine.wait_until_drained(Duration::from_secs(2)).await);
        let task = engine.task(id).unwrap();
        assert_eq!(task.output, Some(serde_json::json!({"n": 1})));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_messages_need_registered_agents() {
        let engine = CoordinationEngine::new(fast_config(), Arc::new(Echo)).unwrap();
        engine.start().unwrap();
        let a = engine.register_agent(AgentDescriptor::new("planner")).unwrap();
        let stranger = AgentId::new();
        assert!(matches!(
            engine.send_message(a, Some(stranger), "plan", serde_json::Value::Null),
            Err(ConclaveError::AgentNotFound(id)) if id == stranger
        ));
        assert!(matches!(
            engine.receive_messages(stranger),
            Err(ConclaveError::AgentNotFound(_))
        ));
        // Alone in the fleet, a broadcast reaches nobody.
        assert_eq!(engine.send_message(a, None, "hello", serde_json::Value::Null).unwrap(), 0);

        let b = engine.register_agent(AgentDescriptor::new("worker")).unwrap();
        engine.send_message(a, Some(b), "plan", serde_json::json!([1, 2])).unwrap();
        engine.terminate_agent(b).unwrap();
        assert_eq!(engine.inner.mailbox.pending(b), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let engine = CoordinationEngine::new(fast_config(), Arc::new(Echo)).unwrap();
        engine.start().unwrap();
        assert!(matches!(
            engine.start(),
            Err(ConclaveError::InvalidTransition(_))
        ));
        engine.shutdown().await;
        assert!(matches!(
            engine.submit_task(TaskSpec::new("a", "late")),
            Err(ConclaveError::Shutdown)
        ));
    }
}
