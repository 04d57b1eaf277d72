//! Allocations: one instance of a task group placed on one node.

use chrono::{DateTime, Utc};
use flotilla_id::{AllocId, DeployId, EvalId, NodeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{deadline_after, ReschedulePolicy, TaskGroup};

/// Reasons attached to allocation stops. Callers match on these exact
/// strings, so they are part of the wire vocabulary.
pub mod stop_reasons {
    /// The group shrank or the allocation is surplus.
    pub const NOT_NEEDED: &str = "alloc-not-needed";
    /// The allocation's node is draining or ineligible.
    pub const MIGRATING: &str = "alloc-migrating";
    /// The allocation's node went down or stayed disconnected too long.
    pub const LOST: &str = "alloc-lost";
    /// The allocation is being replaced by a destructive update.
    pub const UPDATING: &str = "alloc-updating";
    /// The allocation failed and a replacement is being placed.
    pub const RESCHEDULED: &str = "alloc-rescheduled";
}

/// What the scheduler wants the allocation to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    Run,
    Stop,
    Evict,
}

/// What the client last reported the allocation to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    /// The allocation's node disconnected and its fate is not yet known.
    Unknown,
}

impl AllocClientStatus {
    /// True for statuses the client will never leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Lost)
    }
}

/// Operator- or scheduler-requested transitions for an allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTransition {
    pub migrate: Option<bool>,
    pub reschedule: Option<bool>,
    pub force_reschedule: Option<bool>,
}

impl DesiredTransition {
    #[must_use]
    pub fn should_migrate(&self) -> bool {
        self.migrate == Some(true)
    }

    #[must_use]
    pub fn should_reschedule(&self) -> bool {
        self.reschedule == Some(true)
    }

    #[must_use]
    pub fn should_force_reschedule(&self) -> bool {
        self.force_reschedule == Some(true)
    }
}

/// Health of an allocation with respect to its deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// `None` while health is still being determined.
    pub healthy: Option<bool>,
    pub canary: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AllocDeploymentStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy == Some(true)
    }

    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.healthy == Some(false)
    }
}

/// One past reschedule of a failed allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub reschedule_time: DateTime<Utc>,
    pub prev_alloc_id: AllocId,
    pub prev_node_id: NodeId,
    /// The delay that was applied before this attempt.
    pub delay: Duration,
}

/// Reschedule history for an allocation, with the delay policy it was
/// placed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleTracker {
    pub events: Vec<RescheduleEvent>,
    pub policy: ReschedulePolicy,
}

/// Normalized placement score for one candidate node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub norm_score: f64,
}

/// Placement metrics recorded when the allocation was scheduled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocMetrics {
    pub scores: Vec<NodeScore>,
}

impl AllocMetrics {
    /// The best normalized score across candidate nodes, if any were
    /// recorded.
    #[must_use]
    pub fn max_norm_score(&self) -> Option<&NodeScore> {
        self.scores.iter().max_by(|a, b| {
            a.norm_score
                .partial_cmp(&b.norm_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

/// Builds the positional allocation name `jobID.group[index]`.
#[must_use]
pub fn alloc_name(job_id: &str, group: &str, index: u64) -> String {
    format!("{job_id}.{group}[{index}]")
}

/// Extracts the positional index from an allocation name.
#[must_use]
pub fn name_index(name: &str) -> Option<u64> {
    let open = name.rfind('[')?;
    let close = name.rfind(']')?;
    name.get(open + 1..close)?.parse().ok()
}

/// An instance of a task group running (or intended to run) on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    /// Positional name `jobID.group[index]`; the index is stable for the
    /// allocation's lifetime.
    pub name: String,
    pub namespace: String,
    pub job_id: String,
    pub task_group: String,
    pub node_id: NodeId,

    /// Job version this allocation was placed from. Never changes;
    /// re-versioning requires a new allocation.
    pub job_version: u64,
    pub job_create_index: u64,
    pub create_index: u64,

    pub deployment_id: Option<DeployId>,
    pub desired_status: AllocDesiredStatus,
    pub client_status: AllocClientStatus,
    #[serde(default)]
    pub desired_transition: DesiredTransition,
    pub deployment_status: Option<AllocDeploymentStatus>,

    /// The allocation this one replaced, if any.
    pub previous_allocation: Option<AllocId>,
    /// The allocation that replaced this one, if any.
    pub next_allocation: Option<AllocId>,
    /// Follow-up evaluation that will revisit this allocation.
    pub followup_eval_id: Option<EvalId>,

    pub reschedule: Option<RescheduleTracker>,
    #[serde(default)]
    pub metrics: AllocMetrics,

    /// Time of the most recent client state transition; the basis for
    /// reschedule delay computation.
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Allocation {
    /// The positional index parsed from the allocation name.
    #[must_use]
    pub fn index(&self) -> Option<u64> {
        name_index(&self.name)
    }

    /// True once either the scheduler or the client has finished with the
    /// allocation.
    #[must_use]
    pub fn terminal_status(&self) -> bool {
        matches!(
            self.desired_status,
            AllocDesiredStatus::Stop | AllocDesiredStatus::Evict
        ) || self.client_status.is_terminal()
    }

    #[must_use]
    pub fn ran_successfully(&self) -> bool {
        self.client_status == AllocClientStatus::Complete
    }

    #[must_use]
    pub fn is_canary(&self) -> bool {
        self.deployment_status.is_some_and(|s| s.canary)
    }

    /// The reschedule policy governing this allocation: its own tracker's
    /// policy when it has rescheduled before, else the group's.
    #[must_use]
    pub fn reschedule_policy<'a>(
        &'a self,
        fallback: Option<&'a ReschedulePolicy>,
    ) -> Option<&'a ReschedulePolicy> {
        self.reschedule.as_ref().map(|t| &t.policy).or(fallback)
    }

    fn reschedule_events(&self) -> &[RescheduleEvent] {
        self.reschedule
            .as_ref()
            .map(|t| t.events.as_slice())
            .unwrap_or(&[])
    }

    /// When this failed allocation next becomes eligible for rescheduling,
    /// or `None` if it is not eligible at all.
    #[must_use]
    pub fn next_reschedule_time(
        &self,
        fallback: Option<&ReschedulePolicy>,
    ) -> Option<DateTime<Utc>> {
        let fail_time = self.last_event_at?;
        let policy = self.reschedule_policy(fallback)?;
        if self.desired_status == AllocDesiredStatus::Stop
            || self.client_status != AllocClientStatus::Failed
        {
            return None;
        }

        let events = self.reschedule_events();
        let next_delay = policy.next_delay(events, fail_time);
        let next_time = deadline_after(fail_time, next_delay);

        let mut eligible = policy.unlimited || (policy.attempts > 0 && events.is_empty());
        if policy.attempts > 0 && !events.is_empty() {
            let attempted = policy.attempts_within_interval(events, fail_time);
            eligible = attempted < policy.attempts && next_delay < policy.interval;
        }
        eligible.then_some(next_time)
    }

    /// `(attempted, limit)`: reschedules consumed within the policy
    /// interval and the configured attempt ceiling. Feeds metrics.
    #[must_use]
    pub fn reschedule_info(&self, fallback: Option<&ReschedulePolicy>) -> (u32, u32) {
        let Some(policy) = self.reschedule_policy(fallback) else {
            return (0, 0);
        };
        let attempted = match self.last_event_at {
            Some(fail_time) if policy.attempts > 0 => {
                policy.attempts_within_interval(self.reschedule_events(), fail_time)
            }
            _ => 0,
        };
        (attempted, policy.attempts)
    }

    /// The deadline at which a client-side stop takes effect for a group
    /// with `stop_after_client_disconnect`. An allocation is only marked
    /// lost once, so once that transition is recorded we count from it;
    /// before that we count from `now`.
    #[must_use]
    pub fn wait_client_stop(&self, group: &TaskGroup, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = group.stop_after_client_disconnect?;
        if window.is_zero() {
            return None;
        }
        let base = if self.client_status == AllocClientStatus::Lost {
            self.last_event_at.unwrap_or(now)
        } else {
            now
        };
        Some(deadline_after(base, window))
    }
}
