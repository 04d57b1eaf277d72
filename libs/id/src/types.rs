//! The ID types of the scheduler domain.
//!
//! Job IDs and task group names are deliberately absent: they are
//! user-chosen labels, not system identifiers.

use crate::define_id;

define_id!(AllocId, "alloc");
define_id!(EvalId, "eval");
define_id!(DeployId, "dep");
define_id!(NodeId, "node");
