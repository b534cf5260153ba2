//! Coordination and scheduling engine for many autonomous agents.
//!
//! Tasks form a dependency DAG and are dispatched by weighted priority to
//! capable agents. Named resources are locked exclusively or shared, with a
//! periodic wait-for-graph scan that breaks deadlocks. Every lifecycle change
//! is published on the event bus, from which the metrics collector and the
//! event journal derive their views.
//!
//! # Main types
//!
//! - [`CoordinationEngine`] - Wires the components together and runs the background loops.
//! - [`TaskScheduler`] - Task graph, priority ordering, retries and dispatch.
//! - [`AgentRegistry`] - Agent identity, capabilities and lifecycle state.
//! - [`ResourceCoordinator`] - Exclusive/shared locks with deadlock detection.
//! - [`MetricsCollector`] - Rolling counters, percentiles and bounded history.
//! - [`TaskExecutor`] / [`EventSink`] - Collaborator seams for work execution and persistence.

/// Engine wiring and background loops.
pub mod engine;
/// Execution collaborator interface.
pub mod executor;
/// Event journal and sinks.
pub mod journal;
/// Inter-agent message inboxes.
pub mod mailbox;
/// Coordination metrics aggregation.
pub mod metrics;
/// Weighted priority scoring with aging.
pub mod priority;
/// Agent lifecycle tracking.
pub mod registry;
/// Resource locks and deadlock detection.
pub mod resources;
/// Task scheduling and dispatch.
pub mod scheduler;
/// Dependency graph of tasks.
pub mod task_graph;
/// Shared task and agent types.
pub mod types;

pub use engine::CoordinationEngine;
pub use executor::{ExecutionOutput, ExecutionRequest, TaskExecutor};
pub use journal::{EventJournal, EventSink, JsonlEventSink};
pub use mailbox::{AgentMessage, Mailbox};
pub use metrics::{CoordinationSnapshot, MetricPoint, MetricsCollector};
pub use priority::PriorityPolicy;
pub use registry::{AgentRegistry, AgentStats};
pub use resources::{
    DeadlockInfo, DependencyLink, Holder, LockOwner, LockRequest, ResourceCoordinator,
};
pub use scheduler::{Dispatch, TaskScheduler};
pub use task_graph::{FailureOutcome, TaskGraph};
pub use types::{
    Agent, AgentDescriptor, AgentStatus, FailureReason, ResourceClaim, Task, TaskSpec, TaskStatus,
};
