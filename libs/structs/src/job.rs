//! Jobs and task groups: the desired-state side of reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RescheduleEvent;

/// Scheduling flavor of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
    Sysbatch,
}

/// A job snapshot as seen by one reconcile pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// User-chosen identifier, unique within the namespace.
    pub id: String,
    pub namespace: String,
    pub job_type: JobType,
    pub version: u64,
    pub create_index: u64,
    pub modify_index: u64,
    /// Set when the job has been asked to stop.
    pub stop: bool,
    pub multiregion: bool,
    pub periodic: bool,
    pub parameterized: bool,
    pub task_groups: Vec<TaskGroup>,
}

impl Job {
    #[must_use]
    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }
}

/// A set of identical instances to keep running, with the policies that
/// govern how they are rolled, rescheduled and migrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: usize,
    pub update: Option<UpdateStrategy>,
    pub reschedule: Option<ReschedulePolicy>,
    pub migrate: Option<MigrateStrategy>,
    /// Stop allocations this long after their client disconnects.
    pub stop_after_client_disconnect: Option<Duration>,
    /// Keep allocations around this long waiting for their client to
    /// reconnect. Absent means disconnected clients lose their allocs.
    pub resume_after_client_reconnect: Option<Duration>,
}

impl TaskGroup {
    /// The update strategy, or `None` when rolling updates are disabled
    /// (absent strategy or `max_parallel == 0`).
    #[must_use]
    pub fn active_update(&self) -> Option<&UpdateStrategy> {
        self.update.as_ref().filter(|u| u.max_parallel > 0)
    }
}

/// Rolling-update strategy for a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    pub max_parallel: usize,
    /// Number of canary allocations to place ahead of a destructive
    /// rollout. Zero disables canarying.
    pub canary: usize,
    pub auto_revert: bool,
    pub auto_promote: bool,
    pub progress_deadline: Duration,
}

/// How a failed allocation's replacement is delayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayFunction {
    Constant,
    Exponential,
    Fibonacci,
}

/// Reschedule policy for failed allocations of a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    /// Attempts allowed within `interval`. Ignored when `unlimited`.
    pub attempts: u32,
    pub interval: Duration,
    /// Base delay before the first replacement.
    pub delay: Duration,
    pub delay_function: DelayFunction,
    /// Ceiling for grown delays. Zero means no ceiling.
    pub max_delay: Duration,
    pub unlimited: bool,
}

impl ReschedulePolicy {
    /// The delay to apply before the next reschedule, following the delay
    /// function over past events and clamping at `max_delay`. Once the
    /// last attempt is further in the past than the clamped delay the
    /// series starts over from `delay`.
    #[must_use]
    pub fn next_delay(&self, events: &[RescheduleEvent], fail_time: DateTime<Utc>) -> Duration {
        let Some(last) = events.last() else {
            return self.delay;
        };

        let mut delay = match self.delay_function {
            DelayFunction::Constant => return self.delay,
            DelayFunction::Exponential => last.delay.saturating_mul(2),
            DelayFunction::Fibonacci => {
                if events.len() >= 2 {
                    let n1 = last.delay;
                    let n2 = events[events.len() - 2].delay;
                    // A ceiling reset starts a fresh series.
                    if n2 == self.max_delay && n1 == self.delay {
                        n1
                    } else {
                        n1.saturating_add(n2)
                    }
                } else {
                    self.delay
                }
            }
        };

        if !self.max_delay.is_zero() && delay > self.max_delay {
            delay = self.max_delay;
            if let Ok(ceiling) = chrono::Duration::from_std(delay) {
                if fail_time.signed_duration_since(last.reschedule_time) > ceiling {
                    delay = self.delay;
                }
            }
        }

        delay
    }

    /// Reschedules already consumed within `interval` of the failure.
    #[must_use]
    pub fn attempts_within_interval(
        &self,
        events: &[RescheduleEvent],
        fail_time: DateTime<Utc>,
    ) -> u32 {
        let Ok(interval) = chrono::Duration::from_std(self.interval) else {
            return 0;
        };
        if interval.is_zero() {
            return 0;
        }
        events
            .iter()
            .filter(|ev| fail_time.signed_duration_since(ev.reschedule_time) < interval)
            .count() as u32
    }
}

/// Migration strategy for a task group. The reconciler only needs its
/// presence; pacing is enforced by the caller applying the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateStrategy {
    pub max_parallel: usize,
    pub min_healthy_time: Duration,
    pub healthy_deadline: Duration,
}
