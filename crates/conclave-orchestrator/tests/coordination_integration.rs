//! End-to-end coordination tests.
//!
//! Drives a started [`CoordinationEngine`] with a scripted executor and real
//! (short) timers: dispatch order, lock handoff, deadlock resolution, retries
//! with dependency failure, dependency safety, metrics consistency under load,
//! starvation prevention, agent failure handling, per-task lock ownership and
//! agent messaging.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conclave_core::*;
use conclave_orchestrator::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Behaviour by task type: `fail` always errors, `hang` never finishes in
/// time, anything else sleeps `payload.sleep_ms` and echoes the payload.
#[derive(Default)]
struct ScriptedExecutor {
    started: Mutex<Vec<TaskId>>,
    spans: Mutex<HashMap<TaskId, (Instant, Instant)>>,
    attempts: AtomicU32,
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ConclaveResult<ExecutionOutput> {
        let begin = Instant::now();
        self.started.lock().push(request.task_id);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match request.task_type.as_str() {
            "fail" => return Err(ConclaveError::Execution("scripted failure".into())),
            "hang" => tokio::time::sleep(Duration::from_secs(60)).await,
            _ => {
                let ms = request.payload["sleep_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        self.spans
            .lock()
            .insert(request.task_id, (begin, Instant::now()));
        Ok(ExecutionOutput::new(request.payload))
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.tick_interval_ms = 5;
    config.coordination.deadlock_detection_interval_ms = 10;
    config.coordination.default_acquire_timeout_ms = 5_000;
    config.metrics.flush_interval_ms = 50;
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 5;
    config.retry.jitter_ratio = 0.0;
    config
}

fn engine_with(config: EngineConfig) -> (CoordinationEngine, Arc<ScriptedExecutor>) {
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = CoordinationEngine::new(config, executor.clone()).unwrap();
    engine.start().unwrap();
    (engine, executor)
}

fn sleeping(task_type: &str, ms: u64) -> TaskSpec {
    TaskSpec::new(task_type, format!("{task_type} ({ms}ms)"))
        .with_payload(serde_json::json!({ "sleep_ms": ms }))
}

async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// 1. Priority order with a single eligible agent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_order_with_single_agent() {
    let (engine, executor) = engine_with(fast_config());

    let mut ids = Vec::new();
    for p in [1, 5, 3, 5, 2] {
        ids.push(engine.submit_task(sleeping("job", 2).with_priority(p)).unwrap());
    }
    // Registered after submission so every task competes from the start.
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    let order = executor.started.lock().clone();
    assert_eq!(order, vec![ids[1], ids[3], ids[2], ids[4], ids[0]]);
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Exclusive handoff on "db"
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exclusive_lock_handoff() {
    let (engine, _executor) = engine_with(fast_config());
    let engine = Arc::new(engine);
    let (a, b) = (AgentId::new(), AgentId::new());

    engine
        .acquire("db", a, LockMode::Exclusive, None)
        .await
        .unwrap();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .acquire("db", b, LockMode::Exclusive, Some(Duration::from_secs(5)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    assert_eq!(engine.resources().holders("db")[0].agent_id, a);

    engine.release("db", a).unwrap();
    waiter.await.unwrap().unwrap();
    let holders = engine.resources().holders("db");
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].agent_id, b);
    engine.resources().verify().unwrap();
}

// ---------------------------------------------------------------------------
// 3. Deadlock detection and resolution
// ---------------------------------------------------------------------------

async fn run_cycle(agents: usize) {
    let (engine, _executor) = engine_with(fast_config());
    let engine = Arc::new(engine);
    let ids: Vec<AgentId> = (0..agents).map(|_| AgentId::new()).collect();
    let names: Vec<String> = (0..agents).map(|i| format!("r{i}")).collect();

    for (agent, name) in ids.iter().zip(&names) {
        engine
            .acquire(name, *agent, LockMode::Exclusive, None)
            .await
            .unwrap();
    }

    let mut waits = Vec::new();
    for i in 0..agents {
        let engine = engine.clone();
        let agent = ids[i];
        let next = names[(i + 1) % agents].clone();
        waits.push(tokio::spawn(async move {
            let result = engine
                .acquire(&next, agent, LockMode::Exclusive, Some(Duration::from_secs(5)))
                .await;
            (agent, result)
        }));
    }

    let aborted = eventually(Duration::from_secs(2), || {
        waits.iter().any(|w| w.is_finished())
    })
    .await;
    assert!(aborted, "cycle of {agents} was not resolved");
    // Several more scan intervals must not claim a second victim.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut victims = Vec::new();
    let mut pending = Vec::new();
    for wait in waits {
        if wait.is_finished() {
            let (agent, result) = wait.await.unwrap();
            assert!(matches!(result, Err(ConclaveError::DeadlockDetected { .. })));
            victims.push(agent);
        } else {
            pending.push(wait);
        }
    }
    assert_eq!(victims.len(), 1, "exactly one participant is aborted");
    engine.resources().release_all(victims[0]);

    // The agent blocked on the victim proceeds.
    let (_, first) = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Some(pos) = pending.iter().position(|w| w.is_finished()) {
                return pending.remove(pos).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    first.unwrap();

    assert!(
        eventually(Duration::from_secs(1), || {
            engine.query_metrics().conflicts.resolved == 1
        })
        .await
    );
    assert_eq!(engine.query_metrics().conflicts.detected, 1);
    engine.resources().verify().unwrap();
}

#[tokio::test]
async fn two_agent_deadlock_is_resolved() {
    run_cycle(2).await;
}

#[tokio::test]
async fn three_agent_deadlock_is_resolved() {
    run_cycle(3).await;
}

// ---------------------------------------------------------------------------
// 4. Retries exhausted, dependent fails with dependency_failed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_then_dependency_failed() {
    let (engine, executor) = engine_with(fast_config());
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();

    let parent = TaskSpec::new("fail", "always fails").with_max_retries(2);
    let parent_id = parent.id;
    let child = sleeping("job", 1).with_dependencies(vec![parent_id]);
    let ids = engine.submit_tasks(vec![parent, child]).unwrap();

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    let parent = engine.task(parent_id).unwrap();
    assert_eq!(parent.retry_count, 2);
    assert_eq!(parent.failure_reason(), Some(FailureReason::MaxRetriesExceeded));
    assert!(parent.last_error.unwrap().contains("scripted failure"));
    let child = engine.task(ids[1]).unwrap();
    assert_eq!(child.failure_reason(), Some(FailureReason::DependencyFailed));
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);

    assert!(
        eventually(Duration::from_secs(1), || {
            let m = engine.query_metrics();
            m.tasks.failed == 2 && m.tasks.retries == 2
        })
        .await
    );
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Dependency safety over a diamond
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependents_start_after_dependencies_finish() {
    let (engine, executor) = engine_with(fast_config());
    for _ in 0..3 {
        engine
            .register_agent(AgentDescriptor::new("worker").with_max_concurrent_tasks(2))
            .unwrap();
    }

    let root = sleeping("job", 10);
    let left = sleeping("job", 15).with_dependencies(vec![root.id]);
    let right = sleeping("job", 5).with_dependencies(vec![root.id]);
    let join = sleeping("job", 1).with_dependencies(vec![left.id, right.id]);
    let deps: Vec<(TaskId, Vec<TaskId>)> = [&root, &left, &right, &join]
        .iter()
        .map(|t| (t.id, t.dependencies.clone()))
        .collect();
    // Submitted join-first to exercise forward references.
    engine
        .submit_tasks(vec![join, right, left, root])
        .unwrap();

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    let spans = executor.spans.lock();
    for (task, task_deps) in deps {
        let (start, _) = spans[&task];
        for dep in task_deps {
            let (_, dep_end) = spans[&dep];
            assert!(start >= dep_end, "task started before its dependency finished");
        }
    }
    drop(spans);
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Metrics stay consistent under concurrent load
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_consistent_under_load() {
    let (engine, _executor) = engine_with(fast_config());
    let engine = Arc::new(engine);
    for _ in 0..4 {
        engine
            .register_agent(AgentDescriptor::new("worker").with_max_concurrent_tasks(2))
            .unwrap();
    }

    let mut producers = Vec::new();
    for p in 0..4 {
        let engine = engine.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..15 {
                let spec = if i % 5 == 4 {
                    TaskSpec::new("fail", "fails").with_max_retries(0)
                } else {
                    sleeping("job", (p + i) % 4)
                };
                engine.submit_task(spec.with_priority(i as i32)).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }

    let observer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut checks = 0;
            while !engine.scheduler().is_drained() || checks < 10 {
                let m = engine.query_metrics();
                assert_eq!(
                    m.tasks.total,
                    m.tasks.completed + m.tasks.failed + m.tasks.active
                );
                checks += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            checks
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    assert!(engine.wait_until_drained(Duration::from_secs(10)).await);
    assert!(observer.await.unwrap() >= 10);

    assert!(
        eventually(Duration::from_secs(2), || {
            let m = engine.query_metrics();
            m.tasks.total == 60 && m.tasks.completed == 48 && m.tasks.failed == 12
        })
        .await
    );
    let m = engine.query_metrics();
    assert_eq!(m.tasks.active, 0);
    assert_eq!(m.memory.dropped_events, 0);
    assert!((m.tasks.success_rate - 0.8).abs() < 1e-9);
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. A starved low-priority task overtakes a stream of fresh high-priority work
// ---------------------------------------------------------------------------

#[tokio::test]
async fn starved_task_eventually_runs() {
    let mut config = fast_config();
    config.scheduler.aging_rate_per_sec = 0.0;
    config.scheduler.starvation_threshold_ms = 60;
    config.scheduler.starvation_boost = 100.0;
    let (engine, executor) = engine_with(config);

    let low = engine.submit_task(sleeping("low", 5).with_priority(1)).unwrap();
    engine
        .submit_task(sleeping("high", 15).with_priority(10))
        .unwrap();
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();

    // Keep exactly one fresh high-priority task waiting at all times.
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut highs = 1;
    while Instant::now() < deadline {
        if engine.task(low).is_some_and(|t| t.is_terminal()) {
            break;
        }
        let waiting_high = engine.tasks().iter().any(|t| {
            t.task_type == "high" && matches!(t.status, TaskStatus::Created | TaskStatus::Ready)
        });
        if !waiting_high {
            engine
                .submit_task(sleeping("high", 15).with_priority(10))
                .unwrap();
            highs += 1;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let low_task = engine.task(low).unwrap();
    assert_eq!(low_task.status, TaskStatus::Completed);
    assert!(highs >= 3, "high-priority work kept arriving");
    let position = executor
        .started
        .lock()
        .iter()
        .position(|id| *id == low)
        .unwrap();
    assert!(position >= 2, "low-priority task ran before it starved");
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Agent failures, cancellation and heartbeats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_error_requeues_running_task() {
    let (engine, _executor) = engine_with(fast_config());
    let flaky = engine
        .register_agent(AgentDescriptor::new("flaky").with_capabilities(["gpu"]))
        .unwrap();

    let task = engine
        .submit_task(
            sleeping("job", 200)
                .with_capabilities(["gpu"])
                .with_resource("model", LockMode::Exclusive),
        )
        .unwrap();
    assert!(
        eventually(Duration::from_secs(1), || {
            !engine.resources().holders("model").is_empty()
        })
        .await
    );

    engine.report_agent_error(flaky, "process crashed").unwrap();
    assert_eq!(engine.agent(flaky).unwrap().status, AgentStatus::Error);
    assert!(engine.resources().holders("model").is_empty());
    assert!(matches!(
        engine.task(task).unwrap().status,
        TaskStatus::Retrying | TaskStatus::Ready
    ));

    let backup = engine
        .register_agent(AgentDescriptor::new("backup").with_capabilities(["gpu"]))
        .unwrap();

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    let task = engine.task(task).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(engine.agent(backup).unwrap().tasks_completed, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_aborts_running_task_and_fails_dependents() {
    let (engine, _executor) = engine_with(fast_config());
    let worker = engine
        .register_agent(AgentDescriptor::new("worker"))
        .unwrap();

    let stuck = TaskSpec::new("hang", "never returns").with_resource("lock", LockMode::Exclusive);
    let stuck_id = stuck.id;
    let after = sleeping("job", 1).with_dependencies(vec![stuck_id]);
    let ids = engine.submit_tasks(vec![stuck, after]).unwrap();

    assert!(
        eventually(Duration::from_secs(1), || {
            !engine.resources().holders("lock").is_empty()
        })
        .await
    );
    engine.cancel_task(stuck_id).unwrap();

    assert_eq!(
        engine.task(stuck_id).unwrap().failure_reason(),
        Some(FailureReason::Cancelled)
    );
    assert_eq!(
        engine.task(ids[1]).unwrap().failure_reason(),
        Some(FailureReason::DependencyFailed)
    );
    assert!(engine.resources().holders("lock").is_empty());
    assert_eq!(engine.agent(worker).unwrap().status, AgentStatus::Idle);
    assert!(matches!(
        engine.cancel_task(stuck_id),
        Err(ConclaveError::InvalidTransition(_))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn execution_timeout_is_retried() {
    let (engine, executor) = engine_with(fast_config());
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();
    let id = engine
        .submit_task(
            TaskSpec::new("hang", "too slow")
                .with_timeout_ms(20)
                .with_max_retries(1),
        )
        .unwrap();

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    let task = engine.task(id).unwrap();
    assert_eq!(task.failure_reason(), Some(FailureReason::MaxRetriesExceeded));
    assert!(task.last_error.unwrap().contains("timed out"));
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn silent_agent_fails_health_check() {
    let mut config = fast_config();
    config.orchestrator.health_check_interval_ms = 10;
    config.orchestrator.heartbeat_timeout_ms = Some(50);
    let (engine, _executor) = engine_with(config);
    let quiet = engine.register_agent(AgentDescriptor::new("quiet")).unwrap();
    let chatty = engine.register_agent(AgentDescriptor::new("chatty")).unwrap();

    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        engine.heartbeat(chatty).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.agent(quiet).unwrap().status, AgentStatus::Error);
    assert_eq!(engine.agent(chatty).unwrap().status, AgentStatus::Idle);

    engine.reactivate_agent(quiet).unwrap();
    assert_eq!(engine.agent(quiet).unwrap().status, AgentStatus::Idle);
    engine.shutdown().await;
}

#[tokio::test]
async fn submission_errors_surface_to_callers() {
    let (engine, _executor) = engine_with(fast_config());
    let missing = TaskId::new();
    let err = engine
        .submit_task(TaskSpec::new("job", "orphan").with_dependencies(vec![missing]))
        .unwrap_err();
    assert!(matches!(err, ConclaveError::InvalidDependency { .. }));

    let a = TaskSpec::new("job", "a");
    let b = TaskSpec::new("job", "b").with_dependencies(vec![a.id]);
    let a = a.with_dependencies(vec![b.id]);
    assert!(matches!(
        engine.submit_tasks(vec![a, b]),
        Err(ConclaveError::InvalidDependency { .. })
    ));
    assert!(engine.tasks().is_empty());
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 9. Journal captures the lifecycle from a live engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn journal_records_task_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let (engine, _executor) = engine_with(fast_config());
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let journal = EventJournal::spawn(
        engine.bus().subscribe(),
        Arc::new(JsonlEventSink::new(&path)),
        stop_rx,
    );

    engine.register_agent(AgentDescriptor::new("worker")).unwrap();
    let id = engine.submit_task(sleeping("job", 1)).unwrap();
    assert!(engine.wait_until_drained(Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    stop_tx.send(true).unwrap();
    let written = journal.await.unwrap();

    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    let envelopes: Vec<EventEnvelope> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(envelopes.len() as u64, written);
    assert!(envelopes.windows(2).all(|w| w[0].seq < w[1].seq));

    let topics: Vec<&str> = envelopes
        .iter()
        .filter(|e| e.event.task_id() == Some(id))
        .filter(|e| e.event.topic().starts_with("task:"))
        .map(|e| e.event.topic())
        .collect();
    assert_eq!(
        topics,
        vec!["task:created", "task:ready", "task:started", "task:completed"]
    );
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 10. Two tasks on one agent never share an exclusive lock
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sibling_tasks_on_one_agent_serialize_on_exclusive_claim() {
    let (engine, executor) = engine_with(fast_config());
    let agent = engine
        .register_agent(AgentDescriptor::new("worker").with_max_concurrent_tasks(2))
        .unwrap();
    let short = engine
        .submit_task(sleeping("job", 50).with_resource("db", LockMode::Exclusive))
        .unwrap();
    let long = engine
        .submit_task(sleeping("job", 300).with_resource("db", LockMode::Exclusive))
        .unwrap();

    // Both are running on the same agent, one of them queued on "db".
    assert!(
        eventually(Duration::from_secs(2), || {
            [short, long]
                .iter()
                .all(|id| engine.task(*id).unwrap().status == TaskStatus::Running)
                && engine.resources().queue_len("db") == 1
        })
        .await
    );
    let holders = engine.resources().holders("db");
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].agent_id, agent);
    assert!(holders[0].task_id.is_some());

    // Whichever task holds "db" now, an outsider cannot get in.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.resources().holders("db").len(), 1);
    let err = engine
        .acquire(
            "db",
            AgentId::new(),
            LockMode::Exclusive,
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConclaveError::AcquireTimeout { .. }));

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    let spans = executor.spans.lock().clone();
    let (s1, e1) = spans[&short];
    let (s2, e2) = spans[&long];
    assert!(e1 <= s2 || e2 <= s1, "executions inside \"db\" overlapped");
    assert!(engine.resources().holders("db").is_empty());
    engine.resources().verify().unwrap();
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 11. Agent messages reach inboxes and the metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_messages_are_delivered_and_counted() {
    let (engine, _executor) = engine_with(fast_config());
    let planner = engine.register_agent(AgentDescriptor::new("planner")).unwrap();
    let b = engine.register_agent(AgentDescriptor::new("worker")).unwrap();
    let c = engine.register_agent(AgentDescriptor::new("worker")).unwrap();

    assert_eq!(
        engine
            .send_message(planner, Some(b), "plan", serde_json::json!({ "step": 1 }))
            .unwrap(),
        1
    );
    assert_eq!(
        engine
            .send_message(planner, None, "status", serde_json::Value::Null)
            .unwrap(),
        2
    );

    let inbox = engine.receive_messages(b).unwrap();
    let topics: Vec<&str> = inbox.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(topics, vec!["plan", "status"]);
    assert!(inbox.iter().all(|m| m.from == planner));
    assert_eq!(inbox[0].to, Some(b));
    assert_eq!(inbox[0].payload["step"], 1);
    assert_eq!(engine.receive_messages(c).unwrap().len(), 1);
    assert!(engine.receive_messages(planner).unwrap().is_empty());

    assert!(
        eventually(Duration::from_secs(2), || {
            let messages = engine.query_metrics().messages;
            messages.sent == 2 && messages.received == 3
        })
        .await
    );
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 12. Lock timeouts retry the same task, one count per attempt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acquire_timeouts_retry_same_task_up_to_limit() {
    let mut config = fast_config();
    config.coordination.default_acquire_timeout_ms = 20;
    let (engine, executor) = engine_with(config);
    let outsider = AgentId::new();
    engine
        .acquire("db", outsider, LockMode::Exclusive, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let mut sub = engine.bus().subscribe();
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();
    let id = engine
        .submit_task(
            sleeping("job", 1)
                .with_resource("db", LockMode::Exclusive)
                .with_max_retries(2),
        )
        .unwrap();
    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);

    let task = engine.task(id).unwrap();
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.failure_reason(), Some(FailureReason::MaxRetriesExceeded));
    assert!(task
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("waiting for resource 'db'"));
    // The executor never ran: every attempt died in the lock queue.
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 0);

    let mut started = Vec::new();
    let mut retrying = Vec::new();
    let mut failed = Vec::new();
    while let Some(BusMessage::Event(env)) = sub.try_recv() {
        match env.event {
            CoordinationEvent::TaskStarted {
                task_id, attempt, ..
            } if task_id == id => started.push(attempt),
            CoordinationEvent::TaskRetrying {
                task_id,
                retry_count,
                ..
            } if task_id == id => retrying.push(retry_count),
            CoordinationEvent::TaskFailed {
                task_id,
                retry_count,
                will_retry,
                error_kind,
                ..
            } if task_id == id => failed.push((retry_count, will_retry, error_kind)),
            _ => {}
        }
    }
    assert_eq!(started, vec![0, 1, 2]);
    assert_eq!(retrying, vec![1, 2]);
    let kind = Some("acquire_timeout".to_string());
    assert_eq!(
        failed,
        vec![(1, true, kind.clone()), (2, true, kind.clone()), (2, false, kind)]
    );
    // The outsider's hold is untouched by the failed claims.
    assert_eq!(engine.resources().holders("db")[0].agent_id, outsider);

    assert!(
        eventually(Duration::from_secs(2), || {
            engine.query_metrics().errors.by_kind.get("acquire_timeout") == Some(&3)
        })
        .await
    );
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 13. Engine-level deadlock aborts the lowest-priority task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_deadlock_retries_lowest_priority_task() {
    let (engine, _executor) = engine_with(fast_config());
    let gate = AgentId::new();
    for resource in ["r1", "r2"] {
        engine
            .acquire(resource, gate, LockMode::Exclusive, None)
            .await
            .unwrap();
    }
    let mut sub = engine.bus().subscribe();
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();
    engine.register_agent(AgentDescriptor::new("worker")).unwrap();

    let hi = engine
        .submit_task(
            sleeping("job", 5)
                .with_priority(9)
                .with_resource("r1", LockMode::Exclusive)
                .with_resource("r2", LockMode::Exclusive),
        )
        .unwrap();
    let lo = engine
        .submit_task(
            sleeping("job", 5)
                .with_priority(1)
                .with_resource("r2", LockMode::Exclusive)
                .with_resource("r1", LockMode::Exclusive),
        )
        .unwrap();

    assert!(
        eventually(Duration::from_secs(2), || {
            engine.resources().queue_len("r1") == 1 && engine.resources().queue_len("r2") == 1
        })
        .await
    );
    // Each task gets its first claim, then waits for the other's.
    engine.release("r1", gate).unwrap();
    engine.release("r2", gate).unwrap();

    assert!(engine.wait_until_drained(Duration::from_secs(5)).await);
    assert_eq!(engine.task(hi).unwrap().status, TaskStatus::Completed);
    assert_eq!(engine.task(lo).unwrap().status, TaskStatus::Completed);
    assert_eq!(engine.task(hi).unwrap().retry_count, 0);
    assert_eq!(engine.task(lo).unwrap().retry_count, 1);

    let mut victims = Vec::new();
    while let Some(BusMessage::Event(env)) = sub.try_recv() {
        if let CoordinationEvent::ConflictResolved { victim_task, .. } = env.event {
            victims.push(victim_task);
        }
    }
    assert_eq!(victims, vec![Some(lo)]);
    assert!(
        eventually(Duration::from_secs(2), || {
            engine.query_metrics().conflicts.resolved == 1
        })
        .await
    );
    engine.shutdown().await;
}
