//! Typed set operations and classifiers over allocations.
//!
//! An [`AllocSet`] is a mapping from allocation ID to allocation. Iteration
//! is ordered by ID so that every decision derived from a set is
//! deterministic; the handful of places that need a different order
//! (`name_order`, the name index) sort explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flotilla_id::{AllocId, DeployId, EvalId, NodeId};
use flotilla_structs::{
    deadline_after, AllocClientStatus, AllocDesiredStatus, Allocation, Deployment, Node,
    NodeStatus, ReschedulePolicy, TaskGroup,
};
use thiserror::Error;

use crate::RESCHEDULE_WINDOW;

/// The tainted-nodes index: only nodes in a non-ready state appear here.
pub type TaintedNodes = BTreeMap<NodeId, Node>;

/// Errors from the disconnect-timeout computation. The reconciler logs
/// these at debug and treats the affected group as having no disconnecting
/// allocations; a future evaluation picks them up.
#[derive(Debug, Error)]
pub enum DisconnectError {
    #[error("task group '{group}' has no resume_after_client_reconnect window")]
    NoResumeWindow { group: String },

    #[error("allocation {alloc} references node {node} absent from the tainted index")]
    UnknownNode { alloc: AllocId, node: NodeId },
}

/// An allocation paired with the future instant at which it becomes
/// actionable (reschedule, stop, or disconnect timeout).
#[derive(Debug, Clone)]
pub struct DelayedAlloc {
    pub alloc: Arc<Allocation>,
    pub ready_at: DateTime<Utc>,
}

/// The five-way partition of a set by allocation and node state.
#[derive(Debug, Default)]
pub struct TaintPartition {
    /// Node healthy, allocation in a workable state.
    pub untainted: AllocSet,
    /// Node draining or ineligible; the allocation moves elsewhere.
    pub migrate: AllocSet,
    /// Node down, or disconnected without a resume window.
    pub lost: AllocSet,
    /// Node disconnected and the group tolerates it, for now.
    pub disconnecting: AllocSet,
    /// Allocation marked unknown whose node is ready again.
    pub reconnecting: AllocSet,
}

/// A set of allocations keyed by ID.
#[derive(Debug, Default, Clone)]
pub struct AllocSet(BTreeMap<AllocId, Arc<Allocation>>);

impl AllocSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, alloc: Arc<Allocation>) {
        self.0.insert(alloc.id, alloc);
    }

    pub fn remove(&mut self, id: &AllocId) -> Option<Arc<Allocation>> {
        self.0.remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &AllocId) -> Option<&Arc<Allocation>> {
        self.0.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &AllocId) -> bool {
        self.0.contains_key(id)
    }

    /// Allocations in ID order.
    pub fn values(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.0.values()
    }

    /// IDs in order.
    #[must_use]
    pub fn ids(&self) -> Vec<AllocId> {
        self.0.keys().copied().collect()
    }

    /// The union of this set with `others`.
    #[must_use]
    pub fn union(&self, others: &[&AllocSet]) -> AllocSet {
        let mut out = self.clone();
        for other in others {
            for alloc in other.values() {
                out.insert(alloc.clone());
            }
        }
        out
    }

    /// This set minus every ID present in `others`.
    #[must_use]
    pub fn difference(&self, others: &[&AllocSet]) -> AllocSet {
        let mut out = AllocSet::new();
        'outer: for (id, alloc) in &self.0 {
            for other in others {
                if other.contains(id) {
                    continue 'outer;
                }
            }
            out.insert(alloc.clone());
        }
        out
    }

    /// The subset of this set with the given IDs.
    #[must_use]
    pub fn from_keys<'a, I>(&self, ids: I) -> AllocSet
    where
        I: IntoIterator<Item = &'a AllocId>,
    {
        let mut out = AllocSet::new();
        for id in ids {
            if let Some(alloc) = self.0.get(id) {
                out.insert(alloc.clone());
            }
        }
        out
    }

    /// The distinct allocation names in the set.
    #[must_use]
    pub fn name_set(&self) -> BTreeSet<String> {
        self.values().map(|a| a.name.clone()).collect()
    }

    /// Allocations ordered by `(name, create_index, id)`.
    #[must_use]
    pub fn name_order(&self) -> Vec<Arc<Allocation>> {
        let mut out: Vec<_> = self.values().cloned().collect();
        out.sort_by(|a, b| {
            (&a.name, a.create_index, a.id).cmp(&(&b.name, b.create_index, b.id))
        });
        out
    }

    /// Drops allocations that are already terminal, so they are not
    /// stopped a second time.
    #[must_use]
    pub fn filter_by_terminal(&self) -> AllocSet {
        let mut out = AllocSet::new();
        for alloc in self.values() {
            if !alloc.terminal_status() {
                out.insert(alloc.clone());
            }
        }
        out
    }

    /// Splits the set into allocations that are part of the given
    /// deployment and those that are not.
    #[must_use]
    pub fn filter_by_deployment(&self, id: DeployId) -> (AllocSet, AllocSet) {
        let mut part_of = AllocSet::new();
        let mut not_part_of = AllocSet::new();
        for alloc in self.values() {
            if alloc.deployment_id == Some(id) {
                part_of.insert(alloc.clone());
            } else {
                not_part_of.insert(alloc.clone());
            }
        }
        (part_of, not_part_of)
    }

    /// Partitions the set by allocation and node state.
    ///
    /// `reconnect_window` is the group's `resume_after_client_reconnect`;
    /// without one, allocations on disconnected nodes are lost rather than
    /// disconnecting.
    #[must_use]
    pub fn group_by_alloc_or_node_status(
        &self,
        nodes: &TaintedNodes,
        reconnect_window: Option<Duration>,
    ) -> TaintPartition {
        let mut p = TaintPartition::default();

        for alloc in self.values() {
            let node = nodes.get(&alloc.node_id);

            // Unknown allocs are waiting out a disconnect. Their fate is
            // decided by where their node ended up; while the node stays
            // disconnected they are left alone until their timeout eval
            // fires, so they drop out of the partition entirely.
            if alloc.client_status == AllocClientStatus::Unknown {
                match node {
                    None => p.reconnecting.insert(alloc.clone()),
                    Some(n) if n.status == NodeStatus::Ready => {
                        p.reconnecting.insert(alloc.clone())
                    }
                    Some(n) if n.status == NodeStatus::Down => p.lost.insert(alloc.clone()),
                    Some(_) => {}
                }
                continue;
            }

            // Terminal allocs are never migrated or re-labelled lost.
            if alloc.terminal_status() {
                p.untainted.insert(alloc.clone());
                continue;
            }

            if alloc.desired_transition.should_migrate() {
                p.migrate.insert(alloc.clone());
                continue;
            }

            let Some(node) = node else {
                p.untainted.insert(alloc.clone());
                continue;
            };

            match node.status {
                NodeStatus::Down => p.lost.insert(alloc.clone()),
                NodeStatus::Disconnected => {
                    let workable = matches!(
                        alloc.client_status,
                        AllocClientStatus::Running | AllocClientStatus::Pending
                    );
                    if reconnect_window.is_some() && workable {
                        p.disconnecting.insert(alloc.clone());
                    } else {
                        p.lost.insert(alloc.clone());
                    }
                }
                _ if node.draining_or_ineligible() => p.migrate.insert(alloc.clone()),
                _ => p.untainted.insert(alloc.clone()),
            }
        }

        p
    }

    /// Splits an untainted set into `(still untainted, reschedule now,
    /// reschedule later)`.
    ///
    /// Allocations that reschedule later stay in the untainted pool (they
    /// hold their slot until the follow-up evaluation fires).
    #[must_use]
    pub fn filter_by_rescheduleable(
        &self,
        is_batch: bool,
        now: DateTime<Utc>,
        eval_id: EvalId,
        deployment: Option<&Deployment>,
        policy: Option<&ReschedulePolicy>,
    ) -> (AllocSet, AllocSet, Vec<DelayedAlloc>) {
        let mut untainted = AllocSet::new();
        let mut reschedule_now = AllocSet::new();
        let mut reschedule_later = Vec::new();

        for alloc in self.values() {
            // Failing allocs that have already been replaced are dealt with.
            if alloc.next_allocation.is_some() && alloc.terminal_status() {
                continue;
            }

            let (is_untainted, ignore) = should_filter(alloc, is_batch);
            if is_untainted && !ignore {
                untainted.insert(alloc.clone());
            }
            if is_untainted || ignore {
                continue;
            }

            // Anything not filtered above reaches this point, including
            // healthy running/pending allocs; for those
            // update_by_reschedulable finds no reschedule time and they
            // land back in untainted.
            let (eligible_now, later_at) =
                update_by_reschedulable(alloc, now, eval_id, deployment, policy);
            if eligible_now {
                reschedule_now.insert(alloc.clone());
            } else {
                untainted.insert(alloc.clone());
                if let Some(ready_at) = later_at {
                    reschedule_later.push(DelayedAlloc {
                        alloc: alloc.clone(),
                        ready_at,
                    });
                }
            }
        }

        (untainted, reschedule_now, reschedule_later)
    }

    /// Delayed stops for lost allocations whose group sets
    /// `stop_after_client_disconnect`: the stop only takes effect once the
    /// deadline passes, so it becomes a follow-up evaluation.
    #[must_use]
    pub fn delay_by_stop_after_client_disconnect(
        &self,
        group: &TaskGroup,
        now: DateTime<Utc>,
    ) -> Vec<DelayedAlloc> {
        self.values()
            .filter_map(|alloc| {
                let ready_at = alloc.wait_client_stop(group, now)?;
                (ready_at > now).then(|| DelayedAlloc {
                    alloc: alloc.clone(),
                    ready_at,
                })
            })
            .collect()
    }

    /// Disconnect timeouts for allocations on disconnected nodes: each
    /// becomes actionable at
    /// `disconnect_observed_at + min(node limit, group resume window)`.
    /// A missing node limit means the group's window alone applies.
    pub fn delay_by_resume_after_client_reconnect(
        &self,
        nodes: &TaintedNodes,
        group: &TaskGroup,
        _now: DateTime<Utc>,
    ) -> Result<Vec<DelayedAlloc>, DisconnectError> {
        let Some(resume_window) = group.resume_after_client_reconnect else {
            return Err(DisconnectError::NoResumeWindow {
                group: group.name.clone(),
            });
        };

        let mut later = Vec::new();
        for alloc in self.values() {
            let node = nodes
                .get(&alloc.node_id)
                .ok_or(DisconnectError::UnknownNode {
                    alloc: alloc.id,
                    node: alloc.node_id,
                })?;
            let window = match node.max_client_disconnect {
                Some(node_limit) => node_limit.min(resume_window),
                None => resume_window,
            };
            later.push(DelayedAlloc {
                alloc: alloc.clone(),
                ready_at: deadline_after(node.status_updated_at, window),
            });
        }
        Ok(later)
    }
}

impl FromIterator<Arc<Allocation>> for AllocSet {
    fn from_iter<T: IntoIterator<Item = Arc<Allocation>>>(iter: T) -> Self {
        let mut set = AllocSet::new();
        for alloc in iter {
            set.insert(alloc);
        }
        set
    }
}

/// Batch/service-specific pre-filter for reschedule classification.
/// Returns `(untainted, ignore)`.
fn should_filter(alloc: &Allocation, is_batch: bool) -> (bool, bool) {
    if is_batch {
        // Terminal batch allocs that ran to completion are kept so they
        // are not replaced; ones that did not are dropped entirely.
        match alloc.desired_status {
            AllocDesiredStatus::Stop | AllocDesiredStatus::Evict => {
                return if alloc.ran_successfully() {
                    (true, false)
                } else {
                    (false, true)
                };
            }
            AllocDesiredStatus::Run => {}
        }
        return match alloc.client_status {
            AllocClientStatus::Failed => (false, false),
            _ => (true, false),
        };
    }

    // Service jobs: drop allocs the scheduler has finished with and ones
    // the client completed or lost.
    match alloc.desired_status {
        AllocDesiredStatus::Stop | AllocDesiredStatus::Evict => return (false, true),
        AllocDesiredStatus::Run => {}
    }
    match alloc.client_status {
        AllocClientStatus::Complete | AllocClientStatus::Lost => (false, true),
        _ => (false, false),
    }
}

/// Decides whether a failed allocation reschedules in this pass or later.
/// Returns `(reschedule now, reschedule-later time)`.
fn update_by_reschedulable(
    alloc: &Allocation,
    now: DateTime<Utc>,
    eval_id: EvalId,
    deployment: Option<&Deployment>,
    policy: Option<&ReschedulePolicy>,
) -> (bool, Option<DateTime<Utc>>) {
    // Allocs inside an active deployment only reschedule once marked
    // eligible by the deployment watcher.
    if let Some(d) = deployment {
        if alloc.deployment_id == Some(d.id)
            && d.active()
            && !alloc.desired_transition.should_reschedule()
        {
            return (false, None);
        }
    }

    let force = alloc.desired_transition.should_force_reschedule();

    match alloc.next_reschedule_time(policy) {
        Some(at) => {
            // Reschedule now when this eval is the alloc's follow-up or the
            // delay has (almost) elapsed.
            if alloc.followup_eval_id == Some(eval_id) || at <= deadline_after(now, RESCHEDULE_WINDOW)
            {
                (true, None)
            } else if force {
                (true, None)
            } else if alloc.followup_eval_id.is_none() {
                (false, Some(at))
            } else {
                (false, None)
            }
        }
        None => (force, None),
    }
}
