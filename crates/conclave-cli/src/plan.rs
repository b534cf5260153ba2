//! Plan files: agents to register and keyed tasks to submit.
//!
//! Tasks reference each other by `key`; keys are resolved to fresh task ids
//! before the whole plan is submitted as one batch.

use anyhow::{bail, Context};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult, TaskId};
use conclave_orchestrator::{
    AgentDescriptor, ExecutionOutput, ExecutionRequest, ResourceClaim, TaskExecutor, TaskSpec,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
pub struct AgentEntry {
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Register this many identical agents.
    #[serde(default = "default_count")]
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct TaskEntry {
    pub key: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceClaim>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    /// Simulated work time per attempt.
    #[serde(default)]
    pub duration_ms: u64,
    /// The first `fail_attempts` attempts fail.
    #[serde(default)]
    pub fail_attempts: u32,
}

fn default_max_concurrent() -> usize {
    1
}
fn default_count() -> usize {
    1
}
fn default_task_type() -> String {
    "simulated".to_string()
}

impl Plan {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file '{}'", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// One descriptor per registered agent (`count` expanded).
    pub fn agent_descriptors(&self) -> Vec<AgentDescriptor> {
        self.agents
            .iter()
            .flat_map(|entry| {
                (0..entry.count).map(move |_| {
                    AgentDescriptor::new(entry.agent_type.clone())
                        .with_capabilities(entry.capabilities.iter().cloned())
                        .with_max_concurrent_tasks(entry.max_concurrent_tasks)
                })
            })
            .collect()
    }

    /// Resolve keys to ids and build the task specs in plan order.
    pub fn task_specs(&self) -> anyhow::Result<(Vec<TaskSpec>, HashMap<TaskId, String>)> {
        let mut ids: HashMap<&str, TaskId> = HashMap::new();
        for entry in &self.tasks {
            if ids.insert(entry.key.as_str(), TaskId::new()).is_some() {
                bail!("duplicate task key '{}'", entry.key);
            }
        }

        let mut specs = Vec::with_capacity(self.tasks.len());
        let mut keys = HashMap::with_capacity(self.tasks.len());
        for entry in &self.tasks {
            let id = ids[entry.key.as_str()];
            let deps = entry
                .depends_on
                .iter()
                .map(|key| {
                    ids.get(key.as_str())
                        .copied()
                        .with_context(|| format!("task '{}' depends on unknown key '{key}'", entry.key))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let description = if entry.description.is_empty() {
                entry.key.clone()
            } else {
                entry.description.clone()
            };
            let mut spec = TaskSpec::new(entry.task_type.clone(), description)
                .with_id(id)
                .with_priority(entry.priority)
                .with_dependencies(deps)
                .with_capabilities(entry.capabilities.iter().cloned())
                .with_payload(serde_json::json!({
                    "duration_ms": entry.duration_ms,
                    "fail_attempts": entry.fail_attempts,
                }));
            for claim in &entry.resources {
                spec = spec.with_resource(claim.resource_id.clone(), claim.mode);
            }
            if let Some(max_retries) = entry.max_retries {
                spec = spec.with_max_retries(max_retries);
            }
            if let Some(timeout_ms) = entry.timeout_ms {
                spec = spec.with_timeout_ms(timeout_ms);
            }
            keys.insert(id, entry.key.clone());
            specs.push(spec);
        }
        Ok((specs, keys))
    }
}

/// Sleeps for `payload.duration_ms` and fails the first
/// `payload.fail_attempts` attempts.
pub struct SimulatedExecutor;

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ConclaveResult<ExecutionOutput> {
        let duration_ms = request.payload["duration_ms"].as_u64().unwrap_or(0);
        let fail_attempts = request.payload["fail_attempts"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        if u64::from(request.attempt) < fail_attempts {
            return Err(ConclaveError::Execution(format!(
                "simulated failure on attempt {}",
                request.attempt
            )));
        }
        Ok(ExecutionOutput::new(serde_json::json!({
            "agent": request.agent_id.to_string(),
            "attempt": request.attempt,
        })))
    }
}
