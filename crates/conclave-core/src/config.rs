//! Engine configuration.
//!
//! Every section is optional so that a partial config file (containing only
//! the sections the operator wants to tune) is accepted; missing sections and
//! fields fall back to the defaults below. [`EngineConfig::validate`] applies
//! explicit range checks and is called by the engine constructor.

use crate::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Full configuration handed to each engine component at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity limits and health checking.
    pub orchestrator: OrchestratorConfig,
    /// Tick cadence and priority scoring.
    pub scheduler: SchedulerConfig,
    /// Retry/backoff for failed tasks.
    pub retry: RetryPolicy,
    /// Resource locking and deadlock detection.
    pub coordination: CoordinationConfig,
    /// Metrics retention and flushing.
    pub metrics: MetricsConfig,
    /// Event bus sizing.
    pub event_bus: EventBusConfig,
}

/// Capacity limits and agent health checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of non-terminated agents (1–100).
    pub max_concurrent_agents: usize,
    /// Maximum number of non-terminal tasks (1–10000).
    pub task_queue_size: usize,
    /// How often agent heartbeats are checked.
    pub health_check_interval_ms: u64,
    /// Agents silent for longer than this move to `error`. `None` disables.
    pub heartbeat_timeout_ms: Option<u64>,
    /// Execution timeout for tasks that do not set one.
    pub default_task_timeout_ms: u64,
    /// Terminal tasks are pruned from lookup after this long.
    pub finished_task_ttl_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 10,
            task_queue_size: 1000,
            health_check_interval_ms: 30_000,
            heartbeat_timeout_ms: None,
            default_task_timeout_ms: 300_000,
            finished_task_ttl_ms: 3_600_000,
        }
    }
}

/// Tick cadence and the weights of the priority score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the background re-evaluation tick.
    pub tick_interval_ms: u64,
    /// Score added per second a task has been `ready`.
    pub aging_rate_per_sec: f64,
    /// Wait after which the flat starvation boost applies.
    pub starvation_threshold_ms: u64,
    /// Flat boost for tasks past the starvation threshold.
    pub starvation_boost: f64,
    /// Maximum bonus for a task whose deadline is due.
    pub deadline_weight: f64,
    /// Deadlines further away than this contribute nothing.
    pub deadline_horizon_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            aging_rate_per_sec: 0.01,
            starvation_threshold_ms: 60_000,
            starvation_boost: 100.0,
            deadline_weight: 50.0,
            deadline_horizon_ms: 60_000,
        }
    }
}

/// Configures retry behaviour for failed tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed for tasks that do not set their own limit.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
    /// Up to this fraction of the delay is added as random jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given retry count, capped at
    /// `backoff_max_ms`, before jitter.
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        delay.min(self.backoff_max_ms)
    }

    /// Backoff with `jitter` (a value in `[0, 1)`) scaled by `jitter_ratio`.
    pub fn delay_with_jitter(&self, retry_count: u32, jitter: f64) -> Duration {
        let base = self.base_delay_ms(retry_count);
        let extra = (base as f64 * self.jitter_ratio * jitter.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(base.saturating_add(extra).min(self.backoff_max_ms))
    }
}

/// Resource coordination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Period of the wait-for graph scan.
    pub deadlock_detection_interval_ms: u64,
    /// Timeout for resource claims acquired on behalf of a task.
    pub default_acquire_timeout_ms: u64,
    /// Undelivered messages kept per agent; the oldest are dropped beyond it.
    pub mailbox_capacity: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            deadlock_detection_interval_ms: 1_000,
            default_acquire_timeout_ms: 30_000,
            mailbox_capacity: 256,
        }
    }
}

/// Metrics collector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Points older than this are evicted from every history series.
    pub retention_window_ms: u64,
    /// Period at which derived gauges are sampled into history.
    pub flush_interval_ms: u64,
    /// Hard cap on points per series.
    pub max_history_points: usize,
    /// Number of task durations kept for averages and percentiles.
    pub max_duration_samples: usize,
    /// Window of the rolling error rate.
    pub error_window_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_window_ms: 3_600_000,
            flush_interval_ms: 5_000,
            max_history_points: 720,
            max_duration_samples: 1_000,
            error_window_ms: 60_000,
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Per-subscriber ring capacity; slow subscribers lose the oldest events.
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> ConclaveResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConclaveError::Config(format!(
            "{field} must be between {} and {} (got {value})",
            range.start(),
            range.end()
        )))
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(raw: &str) -> ConclaveResult<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConclaveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConclaveError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply explicit range checks to every section.
    pub fn validate(&self) -> ConclaveResult<()> {
        let o = &self.orchestrator;
        check_range("orchestrator.max_concurrent_agents", o.max_concurrent_agents, 1..=100)?;
        check_range("orchestrator.task_queue_size", o.task_queue_size, 1..=10_000)?;
        check_range(
            "orchestrator.health_check_interval_ms",
            o.health_check_interval_ms,
            10..=3_600_000,
        )?;
        if let Some(timeout) = o.heartbeat_timeout_ms {
            check_range("orchestrator.heartbeat_timeout_ms", timeout, 10..=86_400_000)?;
        }
        check_range(
            "orchestrator.default_task_timeout_ms",
            o.default_task_timeout_ms,
            1..=86_400_000,
        )?;

        let s = &self.scheduler;
        check_range("scheduler.tick_interval_ms", s.tick_interval_ms, 1..=60_000)?;
        check_range("scheduler.aging_rate_per_sec", s.aging_rate_per_sec, 0.0..=1_000.0)?;
        check_range("scheduler.starvation_boost", s.starvation_boost, 0.0..=1_000_000.0)?;
        check_range("scheduler.deadline_weight", s.deadline_weight, 0.0..=1_000_000.0)?;
        check_range("scheduler.deadline_horizon_ms", s.deadline_horizon_ms, 1..=86_400_000)?;

        let r = &self.retry;
        check_range("retry.max_retries", r.max_retries, 0..=100)?;
        check_range("retry.backoff_base_ms", r.backoff_base_ms, 0..=3_600_000)?;
        check_range("retry.backoff_max_ms", r.backoff_max_ms, 0..=3_600_000)?;
        check_range("retry.jitter_ratio", r.jitter_ratio, 0.0..=1.0)?;
        if r.backoff_base_ms > r.backoff_max_ms {
            return Err(ConclaveError::Config(
                "retry.backoff_base_ms must not exceed retry.backoff_max_ms".into(),
            ));
        }

        let c = &self.coordination;
        check_range(
            "coordination.deadlock_detection_interval_ms",
            c.deadlock_detection_interval_ms,
            1..=600_000,
        )?;
        check_range(
            "coordination.default_acquire_timeout_ms",
            c.default_acquire_timeout_ms,
            1..=3_600_000,
        )?;
        check_range("coordination.mailbox_capacity", c.mailbox_capacity, 1..=100_000)?;

        let m = &self.metrics;
        check_range("metrics.retention_window_ms", m.retention_window_ms, 1_000..=604_800_000)?;
        check_range("metrics.flush_interval_ms", m.flush_interval_ms, 1..=3_600_000)?;
        check_range("metrics.max_history_points", m.max_history_points, 1..=1_000_000)?;
        check_range("metrics.max_duration_samples", m.max_duration_samples, 1..=1_000_000)?;
        check_range("metrics.error_window_ms", m.error_window_ms, 1_000..=86_400_000)?;

        check_range("event_bus.capacity", self.event_bus.capacity, 16..=1_000_000)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_section() {
        let config = EngineConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 5

            [coordination]
            deadlock_detection_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_base_ms, 500);
        assert_eq!(config.coordination.deadlock_detection_interval_ms, 250);
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
    }

    #[test]
    fn test_concurrency_out_of_range() {
        let mut config = EngineConfig::default();
        config.orchestrator.max_concurrent_agents = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_agents"));

        config.orchestrator.max_concurrent_agents = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_size_out_of_range() {
        let mut config = EngineConfig::default();
        config.orchestrator.task_queue_size = 10_001;
        assert!(matches!(config.validate(), Err(ConclaveError::Config(_))));
    }

    #[test]
    fn test_backoff_base_above_cap_rejected() {
        let mut config = EngineConfig::default();
        config.retry.backoff_base_ms = 60_000;
        config.retry.backoff_max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.base_delay_ms(0), 100);
        assert_eq!(policy.base_delay_ms(1), 200);
        assert_eq!(policy.base_delay_ms(3), 800);
        assert_eq!(policy.base_delay_ms(4), 1_000);
        assert_eq!(policy.base_delay_ms(40), 1_000);
    }

    #[test]
    fn test_jitter_bounded_by_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 150,
            jitter_ratio: 1.0,
        };
        assert_eq!(policy.delay_with_jitter(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.delay_with_jitter(0, 0.99), Duration::from_millis(150));
        assert_eq!(policy.delay_with_jitter(0, 0.25), Duration::from_millis(125));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("[retry\nmax_retries = ").unwrap_err();
        assert!(matches!(err, ConclaveError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conclave.toml");
        std::fs::write(&path, "[orchestrator]\nmax_concurrent_agents = 4\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.orchestrator.max_concurrent_agents, 4);
    }
}
