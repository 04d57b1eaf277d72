//! The plan: the reconciler's sole output.
//!
//! Built empty, mutated only during one `compute` call, returned by value.
//! Nothing mutates it afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use flotilla_id::{AllocId, EvalId};
use flotilla_structs::{
    AllocClientStatus, Allocation, Deployment, DeploymentStatusUpdate, DesiredUpdates, Evaluation,
    TaskGroup,
};

/// One allocation to place.
#[derive(Debug, Clone)]
pub struct AllocPlacement {
    /// Positional name the placement claims.
    pub name: String,
    pub task_group: TaskGroup,
    /// The allocation this placement replaces, if any.
    pub previous_alloc: Option<Arc<Allocation>>,
    /// Placement replaces a failed allocation.
    pub reschedule: bool,
    /// Placement backfills a lost allocation.
    pub lost: bool,
    pub canary: bool,
    /// While canarying, non-canary placements stay at the previous job
    /// version.
    pub downgrade_non_canary: bool,
    /// Lowest job version the placement may be created from.
    pub min_job_version: u64,
}

/// A destructive update: stop one allocation, place its successor.
#[derive(Debug, Clone)]
pub struct AllocDestructiveUpdate {
    pub place_name: String,
    pub place_task_group: TaskGroup,
    pub stop_alloc: Arc<Allocation>,
    pub stop_reason: &'static str,
}

/// One allocation to stop.
#[derive(Debug, Clone)]
pub struct AllocStop {
    pub alloc: Arc<Allocation>,
    /// Override for the client status recorded with the stop (lost allocs
    /// are stopped as lost).
    pub client_status: Option<AllocClientStatus>,
    pub reason: &'static str,
    /// Links the stop to the delayed evaluation that will replace it.
    pub followup_eval_id: Option<EvalId>,
}

/// Everything one reconcile pass wants changed.
#[derive(Debug, Default)]
pub struct ReconcileResult {
    /// A deployment to create, when this pass started one.
    pub deployment: Option<Deployment>,
    /// Status mutations for the existing deployment.
    pub deployment_updates: Vec<DeploymentStatusUpdate>,

    /// Placements, ordered: reschedule replacements, then lost backfills,
    /// then fresh names.
    pub place: Vec<AllocPlacement>,
    /// Destructive updates in name order.
    pub destructive_update: Vec<AllocDestructiveUpdate>,
    /// Rewritten allocations to apply in place.
    pub inplace_update: Vec<Allocation>,
    pub stop: Vec<AllocStop>,

    /// Allocation patches that only record a follow-up eval ID.
    pub attribute_updates: BTreeMap<AllocId, Allocation>,
    /// Allocations on disconnected nodes, patched to client-status unknown
    /// with their timeout eval attached.
    pub disconnect_updates: BTreeMap<AllocId, Allocation>,
    /// Non-destructive acknowledgements of reconnected allocations.
    pub reconnect_updates: BTreeMap<AllocId, Allocation>,

    /// Per-group change counters.
    pub desired_tg_updates: BTreeMap<String, DesiredUpdates>,
    /// Per-group delayed evaluations to enqueue.
    pub desired_followup_evals: BTreeMap<String, Vec<Evaluation>>,
}

impl ReconcileResult {
    /// Total number of capacity-affecting changes. Connectivity
    /// acknowledgements (attribute, disconnect and reconnect updates) are
    /// deliberately not counted: a pass that only re-labels connectivity
    /// must read as a no-op to callers that gate on zero.
    #[must_use]
    pub fn changes(&self) -> usize {
        self.place.len() + self.inplace_update.len() + self.stop.len()
    }
}

impl fmt::Display for ReconcileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total changes: (place {}) (destructive {}) (inplace {}) (stop {})",
            self.place.len(),
            self.destructive_update.len(),
            self.inplace_update.len(),
            self.stop.len()
        )?;
        if let Some(d) = &self.deployment {
            write!(f, "\nCreated deployment: {}", d.id)?;
        }
        for u in &self.deployment_updates {
            write!(
                f,
                "\nDeployment update for {}: status {:?}; description \"{}\"",
                u.deployment_id, u.status, u.status_description
            )?;
        }
        for (tg, u) in &self.desired_tg_updates {
            write!(
                f,
                "\nDesired changes for \"{tg}\": (place {}) (destructive {}) (inplace {}) \
                 (stop {}) (migrate {}) (canary {}) (ignore {})",
                u.place,
                u.destructive_update,
                u.in_place_update,
                u.stop,
                u.migrate,
                u.canary,
                u.ignore
            )?;
        }
        Ok(())
    }
}
