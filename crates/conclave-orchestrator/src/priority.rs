use crate::types::Task;
use chrono::{DateTime, Utc};
use conclave_core::SchedulerConfig;
use std::cmp::Ordering;

/// Weighted priority score for ready tasks.
///
/// `score = priority + deadline bonus + age bonus`, where the age bonus grows
/// by `aging_rate_per_sec` for every second spent `ready` and jumps by
/// `starvation_boost` once the wait reaches `starvation_threshold_ms`.
#[derive(Debug, Clone)]
pub struct PriorityPolicy {
    aging_rate_per_sec: f64,
    starvation_threshold_ms: i64,
    starvation_boost: f64,
    deadline_weight: f64,
    deadline_horizon_ms: i64,
}

impl PriorityPolicy {
    /// Weights taken from the scheduler configuration.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            aging_rate_per_sec: config.aging_rate_per_sec,
            starvation_threshold_ms: i64::try_from(config.starvation_threshold_ms)
                .unwrap_or(i64::MAX),
            starvation_boost: config.starvation_boost,
            deadline_weight: config.deadline_weight,
            deadline_horizon_ms: i64::try_from(config.deadline_horizon_ms)
                .unwrap_or(i64::MAX)
                .max(1),
        }
    }

    /// Score of `task` at `now`.
    pub fn score(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        f64::from(task.priority) + self.deadline_bonus(task, now) + self.age_bonus(task, now)
    }

    fn age_bonus(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        let Some(since) = task.ready_since else {
            return 0.0;
        };
        let waited_ms = (now - since).num_milliseconds().max(0);
        let mut bonus = self.aging_rate_per_sec * waited_ms as f64 / 1000.0;
        if waited_ms >= self.starvation_threshold_ms {
            bonus += self.starvation_boost;
        }
        bonus
    }

    fn deadline_bonus(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        let Some(deadline) = task.deadline else {
            return 0.0;
        };
        let remaining_ms = (deadline - now).num_milliseconds();
        if remaining_ms <= 0 {
            self.deadline_weight
        } else if remaining_ms < self.deadline_horizon_ms {
            self.deadline_weight * (1.0 - remaining_ms as f64 / self.deadline_horizon_ms as f64)
        } else {
            0.0
        }
    }

    /// Dispatch order: higher score first, then earlier `created_at`, then
    /// lower id.
    pub fn compare(&self, a: &Task, b: &Task, now: DateTime<Utc>) -> Ordering {
        let (sa, sb) = (self.score(a, now), self.score(b, now));
        sb.partial_cmp(&sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}
