//! The per-job reconciler: one pass over every task group.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flotilla_id::{AllocId, EvalId};
use flotilla_structs::{
    deadline_after, status_descriptions, stop_reasons, AllocClientStatus, AllocDesiredStatus,
    Allocation, Deployment, DeploymentState, DeploymentStatus, DeploymentStatusUpdate,
    DesiredUpdates, EvalStatus, EvalTrigger, Evaluation, Job, NodeStatus, ReschedulePolicy,
    TaskGroup,
};
use tracing::debug;

use crate::metrics::emit_reschedule_info;
use crate::names::AllocNameIndex;
use crate::result::{AllocDestructiveUpdate, AllocPlacement, AllocStop, ReconcileResult};
use crate::set::{AllocSet, DelayedAlloc, TaintedNodes};
use crate::{
    AllocUpdateFn, IdSource, UlidIdSource, UpdateDecision,
    DISCONNECT_TIMEOUT_FOLLOWUP_EVAL_DESC, FAILED_ALLOC_WINDOW,
    RESCHEDULING_FOLLOWUP_EVAL_DESC,
};

/// Determines the set of placements, updates and stops required to bring
/// cluster state in line with the job specification. Only service and
/// batch jobs go through the reconciler.
///
/// One instance serves exactly one [`compute`](Self::compute) call.
pub struct AllocReconciler<'a> {
    alloc_update_fn: &'a AllocUpdateFn<'a>,

    /// Whether the job is a batch job.
    batch: bool,

    /// The job may be absent when it is being stopped via a purge, so the
    /// ID is carried separately.
    job_id: String,
    job: Option<Arc<Job>>,

    /// The previous deployment, detached by `cancel_unneeded_deployments`.
    old_deployment: Option<Deployment>,
    /// Our own deep copy of the current deployment; mutations land here
    /// and surface only through the returned plan.
    deployment: Option<Deployment>,
    created_deployment: bool,
    deployment_paused: bool,
    deployment_failed: bool,

    tainted_nodes: TaintedNodes,
    existing_allocs: Vec<Arc<Allocation>>,

    eval_id: EvalId,
    eval_priority: i32,

    /// Injected clock: the time used for reschedule eligibility.
    now: DateTime<Utc>,
    ids: Box<dyn IdSource + 'a>,

    result: ReconcileResult,
}

/// The sets `compute_stop` hands back besides the stop set itself.
struct StopOutcome {
    stop: AllocSet,
    migrate: AllocSet,
    reconnecting: AllocSet,
}

impl<'a> AllocReconciler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alloc_update_fn: &'a AllocUpdateFn<'a>,
        batch: bool,
        job_id: impl Into<String>,
        job: Option<Job>,
        deployment: Option<&Deployment>,
        existing_allocs: Vec<Allocation>,
        tainted_nodes: TaintedNodes,
        eval_id: EvalId,
        eval_priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            alloc_update_fn,
            batch,
            job_id: job_id.into(),
            job: job.map(Arc::new),
            old_deployment: None,
            deployment: deployment.cloned(),
            created_deployment: false,
            deployment_paused: false,
            deployment_failed: false,
            tainted_nodes,
            existing_allocs: existing_allocs.into_iter().map(Arc::new).collect(),
            eval_id,
            eval_priority,
            now,
            ids: Box::new(UlidIdSource),
            result: ReconcileResult::default(),
        }
    }

    /// Replaces the ID source. Tests use this to fix eval and deployment
    /// IDs.
    #[must_use]
    pub fn with_id_source(mut self, ids: Box<dyn IdSource + 'a>) -> Self {
        self.ids = ids;
        self
    }

    /// Reconciles the existing cluster state against the job and returns
    /// the set of changes required to converge.
    pub fn compute(mut self) -> ReconcileResult {
        debug!(job = %self.job_id, eval = %self.eval_id, "reconciling");

        let matrix = self.alloc_matrix();

        self.cancel_unneeded_deployments();

        // A stopped job reduces to stopping every running alloc.
        let Some(job) = self.job.clone().filter(|j| !j.stop) else {
            self.handle_stop(&matrix);
            return self.result;
        };

        self.compute_paused(&job);

        let mut deployment_complete = true;
        for (group, allocs) in &matrix {
            let group_complete = self.compute_group(&job, group, allocs);
            deployment_complete = deployment_complete && group_complete;
        }

        self.compute_deployment_updates(&job, deployment_complete);

        self.result
    }

    /// Groups the raw allocation list by task group, with empty sets for
    /// groups that exist in the job but have no allocations yet.
    fn alloc_matrix(&self) -> BTreeMap<String, AllocSet> {
        let mut matrix: BTreeMap<String, AllocSet> = BTreeMap::new();
        for alloc in &self.existing_allocs {
            matrix
                .entry(alloc.task_group.clone())
                .or_default()
                .insert(alloc.clone());
        }
        if let Some(job) = &self.job {
            for tg in &job.task_groups {
                matrix.entry(tg.name.clone()).or_default();
            }
        }
        matrix
    }

    fn job_stopped(&self) -> bool {
        self.job.as_ref().is_none_or(|j| j.stop)
    }

    /// Detaches deployments that no longer apply: the job stopped, the
    /// deployment references an older job version, or it already
    /// succeeded. The detached deployment moves to `old_deployment` so
    /// its unpromoted canaries can still be cleaned up.
    fn cancel_unneeded_deployments(&mut self) {
        if self.job_stopped() {
            if let Some(d) = &self.deployment {
                if d.active() {
                    self.result.deployment_updates.push(DeploymentStatusUpdate {
                        deployment_id: d.id,
                        status: DeploymentStatus::Cancelled,
                        status_description: status_descriptions::STOPPED_JOB.to_string(),
                    });
                }
                self.old_deployment = self.deployment.take();
            }
            return;
        }

        let Some(d) = &self.deployment else { return };

        let same_job = self
            .job
            .as_ref()
            .is_some_and(|j| j.create_index == d.job_create_index && j.version == d.job_version);
        if !same_job {
            if d.active() {
                self.result.deployment_updates.push(DeploymentStatusUpdate {
                    deployment_id: d.id,
                    status: DeploymentStatus::Cancelled,
                    status_description: status_descriptions::NEWER_JOB.to_string(),
                });
            }
            self.old_deployment = self.deployment.take();
            return;
        }

        if d.status == DeploymentStatus::Successful {
            self.old_deployment = self.deployment.take();
        }
    }

    fn compute_paused(&mut self, job: &Job) {
        match &self.deployment {
            Some(d) => {
                self.deployment_paused = matches!(
                    d.status,
                    DeploymentStatus::Paused | DeploymentStatus::Pending
                );
                self.deployment_failed = d.status == DeploymentStatus::Failed;
            }
            None => {
                // A multiregion deployment created later in this pass will
                // start out pending; treat the group as paused now so no
                // placements run ahead of the peer regions.
                if job.multiregion && !(job.periodic || job.parameterized) {
                    self.deployment_paused = true;
                }
            }
        }
    }

    /// Stops every non-terminal allocation of every observed group.
    fn handle_stop(&mut self, matrix: &BTreeMap<String, AllocSet>) {
        for (group, allocs) in matrix {
            let allocs = allocs.filter_by_terminal();
            let reconnect_window = self
                .job
                .as_ref()
                .and_then(|j| j.lookup_task_group(group))
                .and_then(|tg| tg.resume_after_client_reconnect);
            let p = allocs.group_by_alloc_or_node_status(&self.tainted_nodes, reconnect_window);

            self.mark_stop(&p.untainted, None, stop_reasons::NOT_NEEDED);
            self.mark_stop(&p.migrate, None, stop_reasons::NOT_NEEDED);
            self.mark_stop(&p.lost, Some(AllocClientStatus::Lost), stop_reasons::LOST);
            self.mark_stop(&p.disconnecting, None, stop_reasons::NOT_NEEDED);
            self.mark_stop(&p.reconnecting, None, stop_reasons::NOT_NEEDED);

            // Unknown allocs waiting out a disconnect drop out of the
            // partition; a purged job stops them all the same.
            let classified = p.untainted.union(&[
                &p.migrate,
                &p.lost,
                &p.disconnecting,
                &p.reconnecting,
            ]);
            let unclassified = allocs.difference(&[&classified]);
            self.mark_stop(&unclassified, None, stop_reasons::NOT_NEEDED);

            self.result.desired_tg_updates.insert(
                group.clone(),
                DesiredUpdates {
                    stop: allocs.len() as u64,
                    ..DesiredUpdates::default()
                },
            );
        }
    }

    fn mark_stop(
        &mut self,
        allocs: &AllocSet,
        client_status: Option<AllocClientStatus>,
        reason: &'static str,
    ) {
        for alloc in allocs.values() {
            self.result.stop.push(AllocStop {
                alloc: alloc.clone(),
                client_status,
                reason,
                followup_eval_id: None,
            });
        }
    }

    /// Like `mark_stop`, but records the follow-up eval that links a
    /// delayed reschedule to the stopped alloc.
    fn mark_delayed(
        &mut self,
        allocs: &AllocSet,
        client_status: AllocClientStatus,
        reason: &'static str,
        followup_evals: &BTreeMap<AllocId, EvalId>,
    ) {
        for alloc in allocs.values() {
            self.result.stop.push(AllocStop {
                alloc: alloc.clone(),
                client_status: Some(client_status),
                reason,
                followup_eval_id: followup_evals.get(&alloc.id).copied(),
            });
        }
    }

    /// Reconciles one task group. Returns whether the deployment is
    /// complete with regard to this group.
    fn compute_group(&mut self, job: &Job, group: &str, all: &AllocSet) -> bool {
        let mut desired_changes = DesiredUpdates::default();

        // A missing task group means it was removed from the job: stop
        // everything that remains.
        let Some(tg) = job.lookup_task_group(group) else {
            let all = all.filter_by_terminal();
            let p = all.group_by_alloc_or_node_status(&self.tainted_nodes, None);
            self.mark_stop(&p.untainted, None, stop_reasons::NOT_NEEDED);
            self.mark_stop(&p.migrate, None, stop_reasons::NOT_NEEDED);
            self.mark_stop(&p.lost, Some(AllocClientStatus::Lost), stop_reasons::LOST);
            self.mark_stop(&p.disconnecting, None, stop_reasons::NOT_NEEDED);
            self.mark_stop(&p.reconnecting, None, stop_reasons::NOT_NEEDED);
            let classified = p.untainted.union(&[
                &p.migrate,
                &p.lost,
                &p.disconnecting,
                &p.reconnecting,
            ]);
            let unclassified = all.difference(&[&classified]);
            self.mark_stop(&unclassified, None, stop_reasons::NOT_NEEDED);
            desired_changes.stop = all.len() as u64;
            self.result
                .desired_tg_updates
                .insert(group.to_string(), desired_changes);
            return true;
        };

        // The group's deployment state: the existing one, or a fresh one
        // carrying the group's update strategy settings.
        let existing_deployment_state = self
            .deployment
            .as_ref()
            .and_then(|d| d.task_groups.get(group))
            .cloned();
        let existing_deployment = existing_deployment_state.is_some();
        let mut deployment_state = existing_deployment_state.unwrap_or_else(|| {
            let mut state = DeploymentState::default();
            if let Some(update) = tg.active_update() {
                state.auto_revert = update.auto_revert;
                state.auto_promote = update.auto_promote;
                state.progress_deadline = update.progress_deadline;
            }
            state
        });

        // Terminal allocs from older job versions no longer matter.
        let (all, old_terminal) = self.filter_old_terminal_allocs(job, all);
        desired_changes.ignore += old_terminal.len() as u64;

        let (canaries, all) = self.handle_group_canaries(tg, all, &mut desired_changes);

        let p = all.group_by_alloc_or_node_status(
            &self.tainted_nodes,
            tg.resume_after_client_reconnect,
        );
        let (untainted, reschedule_now, reschedule_later) = p.untainted.filter_by_rescheduleable(
            self.batch,
            self.now,
            self.eval_id,
            self.deployment.as_ref(),
            tg.reschedule.as_ref(),
        );
        let mut migrate = p.migrate;
        let lost = p.lost;
        let disconnecting = p.disconnecting;
        let mut reconnecting = p.reconnecting;

        // Lost allocs with a client-side stop window become delayed stops.
        let lost_later = lost.delay_by_stop_after_client_disconnect(tg, self.now);
        let mut lost_later_evals =
            self.handle_delayed_lost(job, &lost_later, &tg.name, tg.reschedule.as_ref());

        // Disconnecting allocs get timeout evals and an unknown status.
        let timeout_later_evals = self.handle_disconnecting(job, &disconnecting, tg);
        lost_later_evals.extend(timeout_later_evals);

        self.handle_delayed_reschedules(job, &reschedule_later, &tg.name, tg.reschedule.as_ref());

        // Seed the name index with every name that is taken: untainted,
        // rescheduling, migrating and lost allocs (canaries included).
        let mut name_index = AllocNameIndex::new(
            &self.job_id,
            &tg.name,
            tg.count,
            &untainted.union(&[&migrate, &reschedule_now, &lost]),
        );

        let is_canarying = deployment_state.desired_canaries != 0 && !deployment_state.promoted;
        let stop_outcome = self.compute_stop(
            tg,
            &mut name_index,
            &untainted,
            migrate,
            &lost,
            &canaries,
            reconnecting,
            is_canarying,
            &lost_later_evals,
        );
        let stop = stop_outcome.stop;
        migrate = stop_outcome.migrate;
        reconnecting = stop_outcome.reconnecting;
        desired_changes.stop += stop.len() as u64;
        let mut untainted = untainted.difference(&[&stop]);

        self.handle_reconnecting(&reconnecting);

        let (ignore, inplace_count, destructive) = self.compute_updates(job, tg, &untainted);
        desired_changes.ignore += ignore.len() as u64;
        desired_changes.in_place_update += inplace_count as u64;
        if !existing_deployment {
            deployment_state.desired_total += destructive.len() + inplace_count;
        }

        // Canaries do not count toward the group count while canarying.
        if is_canarying {
            untainted = untainted.difference(&[&canaries]);
        }

        // Destructive updates with too few canaries means we need more.
        let strategy = tg.active_update();
        let canaries_promoted = deployment_state.promoted;
        let require_canary = !destructive.is_empty()
            && strategy.is_some_and(|s| canaries.len() < s.canary)
            && !canaries_promoted;
        if require_canary {
            if let Some(strategy) = strategy {
                deployment_state.desired_canaries = strategy.canary;
                if existing_deployment {
                    if let Some(d) = &mut self.deployment {
                        if let Some(state) = d.task_groups.get_mut(group) {
                            state.desired_canaries = strategy.canary;
                        }
                    }
                }
            }
            if !self.deployment_paused && !self.deployment_failed {
                if let Some(strategy) = strategy {
                    let number = strategy.canary - canaries.len();
                    desired_changes.canary += number as u64;
                    for name in name_index.next_canaries(number, &canaries, &destructive) {
                        self.result.place.push(AllocPlacement {
                            name,
                            task_group: tg.clone(),
                            previous_alloc: None,
                            reschedule: false,
                            lost: false,
                            canary: true,
                            downgrade_non_canary: false,
                            min_job_version: 0,
                        });
                    }
                }
            }
        }

        let is_canarying = deployment_state.desired_canaries != 0 && !deployment_state.promoted;
        let mut limit = self.compute_limit(tg, &untainted, &destructive, &migrate, is_canarying);

        // A pending delayed client-side stop holds back placements for the
        // whole group until its follow-up eval fires.
        let mut place = Vec::new();
        if lost_later.is_empty() {
            place = self.compute_placements(
                tg,
                &mut name_index,
                &untainted,
                &migrate,
                &reschedule_now,
                &reconnecting,
                is_canarying,
                &lost,
            );
            if !existing_deployment {
                deployment_state.desired_total += place.len();
            }
        }

        // deployment_place_ready: placements can be committed without any
        // other consideration.
        let deployment_place_ready =
            !self.deployment_paused && !self.deployment_failed && !is_canarying;

        if deployment_place_ready {
            desired_changes.place += place.len() as u64;
            self.result.place.extend(place.iter().cloned());

            self.mark_stop(&reschedule_now, None, stop_reasons::RESCHEDULED);
            desired_changes.stop += reschedule_now.len() as u64;

            let committed = place.len().min(limit);
            limit -= committed;
        } else {
            // No additional placements on a paused or failed deployment,
            // except backfills for lost allocs so capacity is not silently
            // eroded.
            if !lost.is_empty() {
                let backfill: Vec<AllocPlacement> = place
                    .iter()
                    .filter(|p| p.lost)
                    .take(lost.len())
                    .cloned()
                    .collect();
                desired_changes.place += backfill.len() as u64;
                self.result.place.extend(backfill);
            }

            // Failed allocs still make progress, unless they belong to the
            // failed deployment itself.
            for placement in place.iter().filter(|p| p.reschedule) {
                let Some(prev) = &placement.previous_alloc else {
                    continue;
                };
                let part_of_failed_deployment = self.deployment_failed
                    && prev.deployment_id.is_some()
                    && self.deployment.as_ref().map(|d| d.id) == prev.deployment_id;
                if !part_of_failed_deployment {
                    self.result.place.push(placement.clone());
                    desired_changes.place += 1;
                    self.result.stop.push(AllocStop {
                        alloc: prev.clone(),
                        client_status: None,
                        reason: stop_reasons::RESCHEDULED,
                        followup_eval_id: None,
                    });
                    desired_changes.stop += 1;
                }
            }
        }

        if deployment_place_ready {
            let committed = destructive.len().min(limit);
            desired_changes.destructive_update += committed as u64;
            desired_changes.ignore += (destructive.len() - committed) as u64;
            for alloc in destructive.name_order().into_iter().take(committed) {
                self.result.destructive_update.push(AllocDestructiveUpdate {
                    place_name: alloc.name.clone(),
                    place_task_group: tg.clone(),
                    stop_alloc: alloc,
                    stop_reason: stop_reasons::UPDATING,
                });
            }
        } else {
            desired_changes.ignore += destructive.len() as u64;
        }

        // Migrations are always one stop plus one placement inheriting the
        // name, canary flag and job version.
        desired_changes.migrate += migrate.len() as u64;
        for alloc in migrate.name_order() {
            self.result.stop.push(AllocStop {
                alloc: alloc.clone(),
                client_status: None,
                reason: stop_reasons::MIGRATING,
                followup_eval_id: None,
            });
            self.result.place.push(AllocPlacement {
                name: alloc.name.clone(),
                task_group: tg.clone(),
                canary: alloc.is_canary(),
                downgrade_non_canary: is_canarying && !alloc.is_canary(),
                min_job_version: alloc.job_version,
                previous_alloc: Some(alloc),
                reschedule: false,
                lost: false,
            });
        }

        // Create a deployment when the spec changed or the job is starting
        // for the first time.
        let updating_spec = !destructive.is_empty() || !self.result.inplace_update.is_empty();
        let had_running = all
            .values()
            .any(|a| a.job_version == job.version && a.job_create_index == job.create_index);
        if !existing_deployment
            && strategy.is_some()
            && deployment_state.desired_total != 0
            && (!had_running || updating_spec)
        {
            // A previous group may have created the deployment already.
            if self.deployment.is_none() {
                let mut d = Deployment::new(self.ids.deploy_id(), job, self.eval_priority);
                if job.multiregion && !(job.periodic || job.parameterized) {
                    d.status = DeploymentStatus::Pending;
                    d.status_description = status_descriptions::PENDING_FOR_PEER.to_string();
                }
                self.deployment = Some(d);
                self.created_deployment = true;
            }
            if let Some(d) = &mut self.deployment {
                d.task_groups
                    .insert(group.to_string(), deployment_state.clone());
            }
        }

        // Complete largely means no placements were made or desired.
        let mut deployment_complete = destructive.len()
            + inplace_count
            + place.len()
            + migrate.len()
            + reschedule_now.len()
            + reschedule_later.len()
            == 0
            && !require_canary;

        // And everything placed so far must be healthy and promoted.
        if deployment_complete {
            if let Some(d) = &self.deployment {
                if let Some(state) = d.task_groups.get(group) {
                    if state.healthy_allocs < state.desired_total.max(state.desired_canaries)
                        || (state.desired_canaries > 0 && !state.promoted)
                    {
                        deployment_complete = false;
                    }
                }
            }
        }

        self.result
            .desired_tg_updates
            .insert(group.to_string(), desired_changes);

        deployment_complete
    }

    /// Terminal allocations from older job versions of a batch job are
    /// ignored entirely.
    fn filter_old_terminal_allocs(&self, job: &Job, all: &AllocSet) -> (AllocSet, AllocSet) {
        if !self.batch {
            return (all.clone(), AllocSet::new());
        }

        let mut filtered = AllocSet::new();
        let mut ignored = AllocSet::new();
        for alloc in all.values() {
            let older =
                alloc.job_version < job.version || alloc.job_create_index < job.create_index;
            if older && alloc.terminal_status() {
                ignored.insert(alloc.clone());
            } else {
                filtered.insert(alloc.clone());
            }
        }
        (filtered, ignored)
    }

    /// Stops canaries that are superseded (old deployment) or doomed
    /// (failed deployment), handles tainted canaries, and returns the
    /// surviving canaries plus the updated total set.
    fn handle_group_canaries(
        &mut self,
        tg: &TaskGroup,
        all: AllocSet,
        desired_changes: &mut DesiredUpdates,
    ) -> (AllocSet, AllocSet) {
        let mut stop_ids: Vec<AllocId> = Vec::new();
        if let Some(old) = &self.old_deployment {
            for state in old.task_groups.values() {
                if !state.promoted {
                    stop_ids.extend(state.placed_canaries.iter().copied());
                }
            }
        }
        if let Some(d) = &self.deployment {
            if d.status == DeploymentStatus::Failed {
                for state in d.task_groups.values() {
                    if !state.promoted {
                        stop_ids.extend(state.placed_canaries.iter().copied());
                    }
                }
            }
        }

        let stop_set = all.from_keys(stop_ids.iter());
        self.mark_stop(&stop_set, None, stop_reasons::NOT_NEEDED);
        desired_changes.stop += stop_set.len() as u64;
        let mut all = all.difference(&[&stop_set]);

        let mut canaries = AllocSet::new();
        let canary_ids: Vec<AllocId> = self
            .deployment
            .as_ref()
            .map(|d| {
                d.task_groups
                    .values()
                    .flat_map(|state| state.placed_canaries.iter().copied())
                    .collect()
            })
            .unwrap_or_default();
        if self.deployment.is_some() {
            canaries = all.from_keys(canary_ids.iter());
            let p = canaries.group_by_alloc_or_node_status(
                &self.tainted_nodes,
                tg.resume_after_client_reconnect,
            );
            self.mark_stop(&p.migrate, None, stop_reasons::MIGRATING);
            self.mark_stop(&p.lost, Some(AllocClientStatus::Lost), stop_reasons::LOST);
            desired_changes.stop += (p.migrate.len() + p.lost.len()) as u64;
            canaries = p.untainted;
            all = all.difference(&[&p.migrate, &p.lost]);
        }

        (canaries, all)
    }

    /// The number of placements allowed this pass given the rollout
    /// strategy and the health of in-flight allocations.
    fn compute_limit(
        &self,
        tg: &TaskGroup,
        untainted: &AllocSet,
        destructive: &AllocSet,
        migrate: &AllocSet,
        canary_state: bool,
    ) -> usize {
        // Without a rollout or without churn the group count is the only
        // bound.
        let Some(strategy) = tg.active_update() else {
            return tg.count;
        };
        if destructive.is_empty() && migrate.is_empty() {
            return tg.count;
        }
        if self.deployment_paused || self.deployment_failed {
            return 0;
        }
        if canary_state {
            return 0;
        }

        let mut limit = strategy.max_parallel as isize;
        if let Some(d) = &self.deployment {
            let (part_of, _) = untainted.filter_by_deployment(d.id);
            for alloc in part_of.values() {
                match &alloc.deployment_status {
                    Some(status) if status.is_unhealthy() => return 0,
                    Some(status) if status.is_healthy() => {}
                    // In flight: consumes a rollout slot.
                    _ => limit -= 1,
                }
            }
        }

        // Scale-ups concurrent with destructive changes can drive this
        // negative.
        limit.max(0) as usize
    }

    /// The placements for a group: reschedule replacements first, then
    /// backfills for lost allocs up to the group count, then fresh names.
    #[allow(clippy::too_many_arguments)]
    fn compute_placements(
        &self,
        tg: &TaskGroup,
        name_index: &mut AllocNameIndex,
        untainted: &AllocSet,
        migrate: &AllocSet,
        reschedule: &AllocSet,
        reconnecting: &AllocSet,
        canary_state: bool,
        lost: &AllocSet,
    ) -> Vec<AllocPlacement> {
        let mut place = Vec::new();

        for alloc in reschedule.values() {
            place.push(AllocPlacement {
                name: alloc.name.clone(),
                task_group: tg.clone(),
                previous_alloc: Some(alloc.clone()),
                reschedule: true,
                lost: false,
                canary: alloc.is_canary(),
                downgrade_non_canary: canary_state && !alloc.is_canary(),
                min_job_version: alloc.job_version,
            });
        }

        let mut existing =
            untainted.len() + migrate.len() + reschedule.len() + reconnecting.len();

        for alloc in lost.values() {
            if existing >= tg.count {
                break;
            }
            existing += 1;
            place.push(AllocPlacement {
                name: alloc.name.clone(),
                task_group: tg.clone(),
                previous_alloc: Some(alloc.clone()),
                reschedule: false,
                lost: true,
                canary: alloc.is_canary(),
                downgrade_non_canary: canary_state && !alloc.is_canary(),
                min_job_version: alloc.job_version,
            });
        }

        if existing < tg.count {
            for name in name_index.next(tg.count - existing) {
                place.push(AllocPlacement {
                    name,
                    task_group: tg.clone(),
                    previous_alloc: None,
                    reschedule: false,
                    lost: false,
                    canary: false,
                    downgrade_non_canary: canary_state,
                    min_job_version: 0,
                });
            }
        }

        place
    }

    /// Selects the allocations to stop: every lost alloc, then, while the
    /// group is over count, canary-name matches, migrating allocs from
    /// the highest names down, losers of reconnect comparisons, and
    /// finally the highest-named untainted allocs.
    #[allow(clippy::too_many_arguments)]
    fn compute_stop(
        &mut self,
        tg: &TaskGroup,
        name_index: &mut AllocNameIndex,
        untainted: &AllocSet,
        mut migrate: AllocSet,
        lost: &AllocSet,
        canaries: &AllocSet,
        mut reconnecting: AllocSet,
        is_canarying: bool,
        followup_evals: &BTreeMap<AllocId, EvalId>,
    ) -> StopOutcome {
        let mut stop = lost.clone();
        self.mark_delayed(lost, AllocClientStatus::Lost, stop_reasons::LOST, followup_evals);

        // Canaries being evaluated do not count toward the group count.
        let mut untainted = if is_canarying {
            untainted.difference(&[canaries])
        } else {
            untainted.clone()
        };

        let over = (untainted.len() + migrate.len() + reconnecting.len()) as isize
            - tg.count as isize;
        if over <= 0 {
            return StopOutcome {
                stop,
                migrate,
                reconnecting,
            };
        }
        let mut remove = over as usize;

        // Do not double-stop allocs that are already terminal.
        untainted = untainted.filter_by_terminal();

        // After promotion, prefer stopping the old allocs that share a
        // canary's name so the canary keeps its index.
        if !is_canarying && !canaries.is_empty() {
            let canary_names = canaries.name_set();
            let matches: Vec<Arc<Allocation>> = untainted
                .difference(&[canaries])
                .values()
                .filter(|a| canary_names.contains(&a.name))
                .cloned()
                .collect();
            for alloc in matches {
                stop.insert(alloc.clone());
                self.result.stop.push(AllocStop {
                    alloc: alloc.clone(),
                    client_status: None,
                    reason: stop_reasons::NOT_NEEDED,
                    followup_eval_id: None,
                });
                untainted.remove(&alloc.id);
                remove -= 1;
                if remove == 0 {
                    return StopOutcome {
                        stop,
                        migrate,
                        reconnecting,
                    };
                }
            }
        }

        // Prefer converting migrations into stops; that releases their
        // indices instead of moving them.
        if !migrate.is_empty() {
            let migrating_names = AllocNameIndex::new(&self.job_id, &tg.name, tg.count, &migrate);
            let remove_names = migrating_names.highest(remove);
            let matches: Vec<Arc<Allocation>> = migrate
                .values()
                .filter(|a| remove_names.contains(&a.name))
                .cloned()
                .collect();
            for alloc in matches {
                self.result.stop.push(AllocStop {
                    alloc: alloc.clone(),
                    client_status: None,
                    reason: stop_reasons::NOT_NEEDED,
                    followup_eval_id: None,
                });
                migrate.remove(&alloc.id);
                if let Some(index) = alloc.index() {
                    name_index.unset_index(index);
                }
                stop.insert(alloc);
                remove -= 1;
                if remove == 0 {
                    return StopOutcome {
                        stop,
                        migrate,
                        reconnecting,
                    };
                }
            }
        }

        // Resolve reconnecting allocs against their replacements.
        if !reconnecting.is_empty() {
            for id in reconnecting.ids() {
                let Some(alloc) = reconnecting.get(&id).cloned() else {
                    continue;
                };

                // Stop allocs whose desired state or transition no longer
                // wants them running.
                if alloc.desired_status != AllocDesiredStatus::Run
                    || alloc.desired_transition.should_migrate()
                    || alloc.desired_transition.should_reschedule()
                    || alloc.desired_transition.should_force_reschedule()
                {
                    stop.insert(alloc.clone());
                    self.result.stop.push(AllocStop {
                        alloc,
                        client_status: None,
                        reason: stop_reasons::NOT_NEEDED,
                        followup_eval_id: None,
                    });
                    reconnecting.remove(&id);
                    remove -= 1;
                    if remove == 0 {
                        return StopOutcome {
                            stop,
                            migrate,
                            reconnecting,
                        };
                    }
                    continue;
                }

                // The node may have flapped to down between classification
                // and here; those allocs are lost after all.
                let node_down = self
                    .tainted_nodes
                    .get(&alloc.node_id)
                    .is_some_and(|n| n.status == NodeStatus::Down);
                if node_down {
                    stop.insert(alloc.clone());
                    self.result.stop.push(AllocStop {
                        alloc,
                        client_status: Some(AllocClientStatus::Lost),
                        reason: stop_reasons::NOT_NEEDED,
                        followup_eval_id: None,
                    });
                    reconnecting.remove(&id);
                    remove -= 1;
                    if remove == 0 {
                        return StopOutcome {
                            stop,
                            migrate,
                            reconnecting,
                        };
                    }
                    continue;
                }

                // Keep whichever of the reconnecting alloc and its
                // replacement scored higher at placement time; ties keep
                // the reconnecting one.
                let replacement = untainted
                    .values()
                    .find(|u| u.name == alloc.name)
                    .cloned();
                let Some(replacement) = replacement else {
                    continue;
                };
                let Some(replacement_score) = replacement.metrics.max_norm_score() else {
                    debug!(
                        name = %replacement.name,
                        "replacement allocation metrics not available, keeping both"
                    );
                    continue;
                };
                let Some(reconnecting_score) = alloc.metrics.max_norm_score() else {
                    debug!(
                        name = %alloc.name,
                        "reconnecting allocation metrics not available, keeping both"
                    );
                    continue;
                };

                let (loser, from_reconnecting) =
                    if replacement_score.norm_score > reconnecting_score.norm_score {
                        (alloc.clone(), true)
                    } else {
                        (replacement, false)
                    };
                stop.insert(loser.clone());
                self.result.stop.push(AllocStop {
                    alloc: loser.clone(),
                    client_status: None,
                    reason: stop_reasons::NOT_NEEDED,
                    followup_eval_id: None,
                });
                if from_reconnecting {
                    reconnecting.remove(&loser.id);
                } else {
                    untainted.remove(&loser.id);
                }
                remove -= 1;
                if remove == 0 {
                    return StopOutcome {
                        stop,
                        migrate,
                        reconnecting,
                    };
                }
            }
        }

        // Scale down from the highest names.
        let remove_names = name_index.highest(remove);
        let matches: Vec<Arc<Allocation>> = untainted
            .values()
            .filter(|a| remove_names.contains(&a.name))
            .cloned()
            .collect();
        for alloc in matches {
            stop.insert(alloc.clone());
            self.result.stop.push(AllocStop {
                alloc: alloc.clone(),
                client_status: None,
                reason: stop_reasons::NOT_NEEDED,
                followup_eval_id: None,
            });
            untainted.remove(&alloc.id);
            remove -= 1;
            if remove == 0 {
                return StopOutcome {
                    stop,
                    migrate,
                    reconnecting,
                };
            }
        }

        // Duplicate names can leave surplus behind; drain the remainder in
        // ID order.
        let rest: Vec<Arc<Allocation>> = untainted.values().cloned().collect();
        for alloc in rest {
            stop.insert(alloc.clone());
            self.result.stop.push(AllocStop {
                alloc: alloc.clone(),
                client_status: None,
                reason: stop_reasons::NOT_NEEDED,
                followup_eval_id: None,
            });
            untainted.remove(&alloc.id);
            remove -= 1;
            if remove == 0 {
                break;
            }
        }

        StopOutcome {
            stop,
            migrate,
            reconnecting,
        }
    }

    /// Queues reconnected allocations for the client to resume: client
    /// status unknown, desired status run, no pending transition.
    fn handle_reconnecting(&mut self, reconnecting: &AllocSet) {
        for alloc in reconnecting.values() {
            if alloc.client_status != AllocClientStatus::Unknown {
                debug!(alloc = %alloc.id, status = ?alloc.client_status, "skipping reconnect with unexpected client status");
                continue;
            }
            if alloc.desired_transition.should_migrate()
                || alloc.desired_transition.should_reschedule()
                || alloc.desired_transition.should_force_reschedule()
            {
                debug!(alloc = %alloc.id, "skipping reconnect with pending transition");
                continue;
            }
            if alloc.desired_status != AllocDesiredStatus::Run {
                debug!(alloc = %alloc.id, status = ?alloc.desired_status, "skipping reconnect with terminal desired status");
                continue;
            }
            if self.result.reconnect_updates.contains_key(&alloc.id) {
                continue;
            }
            self.result
                .reconnect_updates
                .insert(alloc.id, (**alloc).clone());
        }
    }

    /// Runs the update oracle over the untainted set. In-place updates are
    /// committed immediately; destructive ones are returned for the
    /// placement stage to pace.
    fn compute_updates(
        &mut self,
        job: &Job,
        tg: &TaskGroup,
        untainted: &AllocSet,
    ) -> (AllocSet, usize, AllocSet) {
        let mut ignore = AllocSet::new();
        let mut destructive = AllocSet::new();
        let mut inplace_count = 0;

        for alloc in untainted.values() {
            match (self.alloc_update_fn)(alloc, job, tg) {
                UpdateDecision::Ignore => ignore.insert(alloc.clone()),
                UpdateDecision::Destructive => destructive.insert(alloc.clone()),
                UpdateDecision::Inplace(updated) => {
                    inplace_count += 1;
                    self.result.inplace_update.push(*updated);
                }
            }
        }

        (ignore, inplace_count, destructive)
    }

    fn new_followup_eval(
        &self,
        job: &Job,
        trigger: EvalTrigger,
        description: &str,
        wait_until: DateTime<Utc>,
    ) -> Evaluation {
        Evaluation {
            id: self.ids.eval_id(),
            namespace: job.namespace.clone(),
            priority: self.eval_priority,
            eval_type: job.job_type,
            triggered_by: trigger,
            job_id: job.id.clone(),
            job_modify_index: job.modify_index,
            status: EvalStatus::Pending,
            status_description: description.to_string(),
            wait_until: Some(wait_until),
        }
    }

    /// Sorts delayed allocations by ready time and groups them into eval
    /// batches no wider than [`FAILED_ALLOC_WINDOW`]. Returns the evals
    /// and the alloc → eval assignment.
    fn batch_delayed_evals(
        &self,
        job: &Job,
        later: &[DelayedAlloc],
        trigger: EvalTrigger,
        description: &str,
    ) -> (Vec<Evaluation>, BTreeMap<AllocId, EvalId>) {
        let mut later: Vec<DelayedAlloc> = later.to_vec();
        later.sort_by(|a, b| (a.ready_at, a.alloc.id).cmp(&(b.ready_at, b.alloc.id)));

        let mut evals = Vec::new();
        let mut assignment = BTreeMap::new();
        let Some(first) = later.first() else {
            return (evals, assignment);
        };

        let mut batch_start = first.ready_at;
        let mut eval = self.new_followup_eval(job, trigger, description, batch_start);
        for info in &later {
            if info.ready_at >= deadline_after(batch_start, FAILED_ALLOC_WINDOW) {
                batch_start = info.ready_at;
                evals.push(eval);
                eval = self.new_followup_eval(job, trigger, description, batch_start);
            }
            assignment.insert(info.alloc.id, eval.id);
        }
        evals.push(eval);

        (evals, assignment)
    }

    /// Creates batched follow-up evaluations for allocations whose
    /// replacement is delayed, emitting the reschedule metrics for each.
    fn handle_delayed_lost(
        &mut self,
        job: &Job,
        later: &[DelayedAlloc],
        tg_name: &str,
        policy: Option<&ReschedulePolicy>,
    ) -> BTreeMap<AllocId, EvalId> {
        if later.is_empty() {
            return BTreeMap::new();
        }

        let (evals, assignment) = self.batch_delayed_evals(
            job,
            later,
            EvalTrigger::RetryFailedAlloc,
            RESCHEDULING_FOLLOWUP_EVAL_DESC,
        );
        for info in later {
            let eval = assignment
                .get(&info.alloc.id)
                .and_then(|id| evals.iter().find(|e| e.id == *id));
            emit_reschedule_info(&info.alloc, policy, eval);
        }

        self.append_followup_evals(tg_name, evals);
        assignment
    }

    /// Like `handle_delayed_lost`, plus an attribute update per alloc
    /// recording its follow-up eval without a restart.
    fn handle_delayed_reschedules(
        &mut self,
        job: &Job,
        later: &[DelayedAlloc],
        tg_name: &str,
        policy: Option<&ReschedulePolicy>,
    ) {
        let assignment = self.handle_delayed_lost(job, later, tg_name, policy);
        for info in later {
            if let Some(eval_id) = assignment.get(&info.alloc.id) {
                let mut updated = (*info.alloc).clone();
                updated.followup_eval_id = Some(*eval_id);
                self.result.attribute_updates.insert(updated.id, updated);
            }
        }
    }

    /// Computes disconnect timeouts for allocs on disconnected nodes,
    /// batches them into follow-up evaluations, and stages a disconnect
    /// update (client status unknown plus the eval link) for each.
    fn handle_disconnecting(
        &mut self,
        job: &Job,
        disconnecting: &AllocSet,
        tg: &TaskGroup,
    ) -> BTreeMap<AllocId, EvalId> {
        if disconnecting.is_empty() {
            return BTreeMap::new();
        }

        let timeout_later = match disconnecting.delay_by_resume_after_client_reconnect(
            &self.tainted_nodes,
            tg,
            self.now,
        ) {
            Ok(later) => later,
            Err(err) => {
                debug!(task_group = %tg.name, error = %err, "failed to compute disconnect timeouts");
                return BTreeMap::new();
            }
        };
        if timeout_later.is_empty() {
            debug!(task_group = %tg.name, "no disconnect timeouts to schedule");
            return BTreeMap::new();
        }

        let (evals, assignment) = self.batch_delayed_evals(
            job,
            &timeout_later,
            EvalTrigger::ResumeTimeout,
            DISCONNECT_TIMEOUT_FOLLOWUP_EVAL_DESC,
        );
        for info in &timeout_later {
            if let Some(eval_id) = assignment.get(&info.alloc.id) {
                let mut updated = (*info.alloc).clone();
                updated.client_status = AllocClientStatus::Unknown;
                updated.followup_eval_id = Some(*eval_id);
                self.result.disconnect_updates.insert(updated.id, updated);
            }
        }

        self.append_followup_evals(&tg.name, evals);
        assignment
    }

    fn append_followup_evals(&mut self, tg_name: &str, evals: Vec<Evaluation>) {
        self.result
            .desired_followup_evals
            .entry(tg_name.to_string())
            .or_default()
            .extend(evals);
    }

    /// Marks the deployment complete (or blocked, for multiregion) once
    /// every group reports complete, and sets the description of a
    /// deployment created this pass.
    fn compute_deployment_updates(&mut self, job: &Job, deployment_complete: bool) {
        if deployment_complete {
            if let Some(d) = &self.deployment {
                if job.multiregion {
                    // Unblocking and successful come after blocked; do not
                    // revert them.
                    if !matches!(
                        d.status,
                        DeploymentStatus::Unblocking | DeploymentStatus::Successful
                    ) {
                        self.result.deployment_updates.push(DeploymentStatusUpdate {
                            deployment_id: d.id,
                            status: DeploymentStatus::Blocked,
                            status_description: status_descriptions::BLOCKED.to_string(),
                        });
                    }
                } else {
                    self.result.deployment_updates.push(DeploymentStatusUpdate {
                        deployment_id: d.id,
                        status: DeploymentStatus::Successful,
                        status_description: status_descriptions::SUCCESSFUL.to_string(),
                    });
                }
            }
        }

        if self.created_deployment {
            if let Some(d) = &mut self.deployment {
                if d.requires_promotion() {
                    d.status_description = if d.has_auto_promote() {
                        status_descriptions::RUNNING_AUTO_PROMOTION
                    } else {
                        status_descriptions::RUNNING_NEEDS_PROMOTION
                    }
                    .to_string();
                }
            }
            self.result.deployment = self.deployment.clone();
        }
    }
}
