//! # flotilla-reconcile
//!
//! The allocation reconciler: a pure function from observed cluster state
//! to the minimal set of changes that converges it toward the job
//! specification.
//!
//! Given a job snapshot (or a tombstone), the live allocations, the current
//! deployment record and the tainted-nodes index, [`AllocReconciler::compute`]
//! returns a [`ReconcileResult`] describing placements, in-place updates,
//! destructive updates, stops, migrations, disconnect/reconnect transitions
//! and follow-up evaluations. The caller applies the plan atomically; the
//! reconciler itself performs no I/O, reads no clock, and keeps no state
//! between invocations.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs: set iteration is
//!   ordered by allocation ID, explicit comparators order every selection,
//!   and both time and ID generation are injected.
//! - The plan never exceeds group capacity, never mass-rolls ahead of
//!   unpromoted canaries, and never places net-new work on a paused or
//!   failed deployment.
//! - Irregular input degrades to a no-op for the affected subset; there is
//!   no fatal error path.

mod metrics;
mod names;
mod reconciler;
mod result;
mod set;

pub use names::AllocNameIndex;
pub use reconciler::AllocReconciler;
pub use result::{AllocDestructiveUpdate, AllocPlacement, AllocStop, ReconcileResult};
pub use set::{AllocSet, DelayedAlloc, DisconnectError, TaintPartition, TaintedNodes};

use flotilla_id::{DeployId, EvalId};
use flotilla_structs::{Allocation, Job, TaskGroup};
use std::time::Duration;

/// Maximum span of one follow-up evaluation batch. Failed allocations (and
/// disconnect timeouts) whose ready times fall within this window of the
/// batch start share a single evaluation.
pub const FAILED_ALLOC_WINDOW: Duration = Duration::from_secs(5);

/// Tolerance when deciding whether a failed allocation reschedules in this
/// pass or a later one. Absorbs small clock drift between servers.
pub const RESCHEDULE_WINDOW: Duration = Duration::from_secs(1);

/// Status description for follow-up evaluations created to retry failed
/// allocations.
pub const RESCHEDULING_FOLLOWUP_EVAL_DESC: &str = "created for delayed rescheduling";

/// Status description for follow-up evaluations created for disconnect
/// timeouts.
pub const DISCONNECT_TIMEOUT_FOLLOWUP_EVAL_DESC: &str = "created for delayed disconnect timeout";

/// What the update oracle decided for one allocation against the new job.
///
/// The oracle is injected so that batch- and service-flavored update
/// semantics (and driver-specific checks) live outside the reconciler.
#[derive(Debug, Clone)]
pub enum UpdateDecision {
    /// The allocation already matches the new job.
    Ignore,
    /// The allocation must be stopped and replaced.
    Destructive,
    /// The allocation can be rewritten in place; the payload is the
    /// rewritten allocation.
    Inplace(Box<Allocation>),
}

/// The injected update oracle.
pub type AllocUpdateFn<'a> = dyn Fn(&Allocation, &Job, &TaskGroup) -> UpdateDecision + 'a;

/// Source of fresh IDs. Injected so tests can fix the sequence.
pub trait IdSource {
    fn eval_id(&self) -> EvalId;
    fn deploy_id(&self) -> DeployId;
}

/// The production ID source: fresh ULIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidIdSource;

impl IdSource for UlidIdSource {
    fn eval_id(&self) -> EvalId {
        EvalId::new()
    }

    fn deploy_id(&self) -> DeployId {
        DeployId::new()
    }
}
