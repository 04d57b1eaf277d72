//! # flotilla-structs
//!
//! The shared data model for the scheduler: allocations, jobs, deployments,
//! nodes and evaluations, plus the status vocabularies callers match on.
//!
//! Everything here is a plain value. The reconciler reads these types,
//! never mutates them in place, and emits fresh copies when it wants a
//! field changed; the state store owns durability.

mod alloc;
mod deployment;
mod eval;
mod job;
mod node;

pub use alloc::*;
pub use deployment::*;
pub use eval::*;
pub use job::*;
pub use node::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The desired changes for a task group computed by one reconcile pass.
///
/// Counters, not object lists: the annotated plan carries the objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUpdates {
    pub ignore: u64,
    pub place: u64,
    pub migrate: u64,
    pub stop: u64,
    pub in_place_update: u64,
    pub destructive_update: u64,
    pub canary: u64,
}

/// Adds a policy window to a timestamp, saturating instead of panicking
/// when the window is out of chrono's representable range.
#[must_use]
pub fn deadline_after(start: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
