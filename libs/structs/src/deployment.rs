//! Deployments: rollout tracking from one job version to the next.

use std::collections::BTreeMap;
use std::time::Duration;

use flotilla_id::{AllocId, DeployId};
use serde::{Deserialize, Serialize};

use crate::Job;

/// Status descriptions attached to deployments and their updates.
/// Callers match on these exact strings.
pub mod status_descriptions {
    pub const RUNNING: &str = "running";
    pub const RUNNING_NEEDS_PROMOTION: &str = "running-needs-promotion";
    pub const RUNNING_AUTO_PROMOTION: &str = "running-auto-promotion";
    pub const PENDING_FOR_PEER: &str = "pending-for-peer";
    pub const STOPPED_JOB: &str = "stopped-job";
    pub const NEWER_JOB: &str = "newer-job";
    pub const BLOCKED: &str = "blocked";
    pub const SUCCESSFUL: &str = "successful";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Waiting on a peer region (multi-region jobs).
    Pending,
    Running,
    Paused,
    Blocked,
    Unblocking,
    Successful,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    /// True while the deployment can still make progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::Paused | Self::Blocked | Self::Unblocking
        )
    }
}

/// Per-task-group rollout progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub auto_revert: bool,
    pub auto_promote: bool,
    pub progress_deadline: Duration,
    /// Operator (or auto-promote) acknowledgement that canaries are good.
    pub promoted: bool,
    pub placed_canaries: Vec<AllocId>,
    pub desired_canaries: usize,
    pub desired_total: usize,
    pub healthy_allocs: usize,
}

/// A rollout record owned by the deployment watcher. The reconciler reads
/// it and proposes mutations through the plan; it never writes one back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeployId,
    pub namespace: String,
    pub job_id: String,
    pub job_version: u64,
    pub job_create_index: u64,
    pub job_modify_index: u64,
    pub task_groups: BTreeMap<String, DeploymentState>,
    pub status: DeploymentStatus,
    pub status_description: String,
    pub eval_priority: i32,
}

impl Deployment {
    /// A fresh running deployment for `job`. The ID is supplied by the
    /// caller so that ID generation stays injectable.
    #[must_use]
    pub fn new(id: DeployId, job: &Job, eval_priority: i32) -> Self {
        Self {
            id,
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            job_version: job.version,
            job_create_index: job.create_index,
            job_modify_index: job.modify_index,
            task_groups: BTreeMap::new(),
            status: DeploymentStatus::Running,
            status_description: status_descriptions::RUNNING.to_string(),
            eval_priority,
        }
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.status.is_active()
    }

    /// True when some group placed canaries that still await promotion.
    #[must_use]
    pub fn requires_promotion(&self) -> bool {
        self.task_groups
            .values()
            .any(|state| state.desired_canaries > 0 && !state.promoted)
    }

    /// True when every canarying group is configured to auto-promote.
    #[must_use]
    pub fn has_auto_promote(&self) -> bool {
        !self.task_groups.is_empty()
            && self
                .task_groups
                .values()
                .all(|state| state.desired_canaries == 0 || state.auto_promote)
    }
}

/// A status mutation the reconciler proposes for an existing deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeployId,
    pub status: DeploymentStatus,
    pub status_description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(canaries: usize, promoted: bool, auto_promote: bool) -> DeploymentState {
        DeploymentState {
            desired_canaries: canaries,
            promoted,
            auto_promote,
            ..DeploymentState::default()
        }
    }

    fn deployment(states: Vec<(&str, DeploymentState)>) -> Deployment {
        Deployment {
            id: DeployId::new(),
            namespace: "default".to_string(),
            job_id: "web".to_string(),
            job_version: 1,
            job_create_index: 10,
            job_modify_index: 10,
            task_groups: states
                .into_iter()
                .map(|(name, s)| (name.to_string(), s))
                .collect(),
            status: DeploymentStatus::Running,
            status_description: status_descriptions::RUNNING.to_string(),
            eval_priority: 50,
        }
    }

    #[test]
    fn test_requires_promotion() {
        let d = deployment(vec![("api", state(1, false, false))]);
        assert!(d.requires_promotion());

        let d = deployment(vec![("api", state(1, true, false))]);
        assert!(!d.requires_promotion());

        let d = deployment(vec![("api", state(0, false, false))]);
        assert!(!d.requires_promotion());
    }

    #[test]
    fn test_has_auto_promote_needs_every_canarying_group() {
        let d = deployment(vec![
            ("api", state(1, false, true)),
            ("worker", state(2, false, false)),
        ]);
        assert!(!d.has_auto_promote());

        let d = deployment(vec![
            ("api", state(1, false, true)),
            ("worker", state(0, false, false)),
        ]);
        assert!(d.has_auto_promote());
    }

    #[test]
    fn test_active_statuses() {
        assert!(DeploymentStatus::Paused.is_active());
        assert!(DeploymentStatus::Unblocking.is_active());
        assert!(!DeploymentStatus::Failed.is_active());
        assert!(!DeploymentStatus::Successful.is_active());
    }
}
