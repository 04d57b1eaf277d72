//! Evaluations: queued requests to run the scheduler for a job.

use chrono::{DateTime, Utc};
use flotilla_id::EvalId;
use serde::{Deserialize, Serialize};

use crate::JobType;

/// What caused an evaluation to be enqueued. Callers match on the
/// serialized kebab-case form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalTrigger {
    /// A failed allocation's reschedule delay elapsed.
    RetryFailedAlloc,
    /// A disconnected client's resume window elapsed.
    ResumeTimeout,
}

impl EvalTrigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryFailedAlloc => "retry-failed-alloc",
            Self::ResumeTimeout => "resume-timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Complete,
    Failed,
    Blocked,
    Cancelled,
}

/// A queued scheduler invocation, possibly delayed via `wait_until`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    pub namespace: String,
    pub priority: i32,
    pub eval_type: JobType,
    pub triggered_by: EvalTrigger,
    pub job_id: String,
    pub job_modify_index: u64,
    pub status: EvalStatus,
    pub status_description: String,
    /// Dequeue no earlier than this instant.
    pub wait_until: Option<DateTime<Utc>>,
}
