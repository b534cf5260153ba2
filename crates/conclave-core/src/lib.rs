//! Core types, error handling, configuration, and the event bus for Conclave.
//!
//! This crate provides the foundational types shared by the coordination
//! engine and its collaborators.
//!
//! # Main types
//!
//! - [`ConclaveError`] - Unified error enum for every engine component.
//! - [`ConclaveResult`] - Convenience alias for `Result<T, ConclaveError>`.
//! - [`TaskId`] / [`AgentId`] - Strongly typed identifiers.
//! - [`LockMode`] - Exclusive or shared resource lock.
//! - [`EngineConfig`] - Explicitly constructed engine configuration.
//! - [`CoordinationEvent`] / [`EventEnvelope`] - Closed set of lifecycle events.
//! - [`EventBus`] - Bounded, drop-oldest publish/subscribe channel.

/// In-process publish/subscribe bus.
pub mod bus;
/// Engine configuration and validation.
pub mod config;
/// Error types.
pub mod error;
/// Lifecycle event definitions.
pub mod event;

pub use bus::{BusMessage, EventBus, EventSubscription};
pub use config::{
    CoordinationConfig, EngineConfig, EventBusConfig, MetricsConfig, OrchestratorConfig,
    RetryPolicy, SchedulerConfig,
};
pub use error::{ConclaveError, ConclaveResult};
pub use event::{CoordinationEvent, EventEnvelope};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lock mode determining concurrency behavior on a named resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Only one holder at a time.
    Exclusive,
    /// Any number of shared holders, no exclusive holder.
    Shared,
}

impl LockMode {
    /// Whether a holder in `self` mode can coexist with one in `other` mode.
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Exclusive => write!(f, "exclusive"),
            LockMode::Shared => write!(f, "shared"),
        }
    }
}
