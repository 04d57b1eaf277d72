//! Integration tests for the allocation reconciler.
//!
//! Each test drives one observable scenario end to end: build the inputs,
//! run a single compute pass, and assert on the returned plan. Time and ID
//! generation are fixed so every assertion is deterministic.

use std::cell::Cell;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use flotilla_id::{AllocId, DeployId, EvalId, NodeId, Ulid};
use flotilla_reconcile::{
    AllocReconciler, AllocUpdateFn, IdSource, ReconcileResult, TaintedNodes, UpdateDecision,
    DISCONNECT_TIMEOUT_FOLLOWUP_EVAL_DESC, RESCHEDULING_FOLLOWUP_EVAL_DESC,
};
use flotilla_structs::{
    alloc_name, status_descriptions, stop_reasons, AllocClientStatus, AllocDesiredStatus,
    AllocMetrics, Allocation, DelayFunction, Deployment, DeploymentState, DeploymentStatus,
    DesiredTransition, DesiredUpdates, EvalTrigger, Job, JobType, Node, NodeScore, NodeStatus,
    ReschedulePolicy, TaskGroup, UpdateStrategy,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Deterministic ID source: ULIDs minted from a counter.
struct SeqIds(Cell<u64>);

impl SeqIds {
    fn new() -> Self {
        Self(Cell::new(0))
    }

    fn mint(&self) -> Ulid {
        let n = self.0.get() + 1;
        self.0.set(n);
        Ulid::from_parts(n, u128::from(n))
    }
}

impl IdSource for SeqIds {
    fn eval_id(&self) -> EvalId {
        EvalId::from_ulid(self.mint())
    }

    fn deploy_id(&self) -> DeployId {
        DeployId::from_ulid(self.mint())
    }
}

fn task_group(name: &str, count: usize) -> TaskGroup {
    TaskGroup {
        name: name.to_string(),
        count,
        update: None,
        reschedule: None,
        migrate: None,
        stop_after_client_disconnect: None,
        resume_after_client_reconnect: None,
    }
}

fn update_strategy(max_parallel: usize, canary: usize) -> UpdateStrategy {
    UpdateStrategy {
        max_parallel,
        canary,
        auto_revert: false,
        auto_promote: false,
        progress_deadline: Duration::from_secs(600),
    }
}

fn reschedule_policy(delay: Duration) -> ReschedulePolicy {
    ReschedulePolicy {
        attempts: 3,
        interval: Duration::from_secs(3600),
        delay,
        delay_function: DelayFunction::Constant,
        max_delay: Duration::from_secs(300),
        unlimited: false,
    }
}

fn job(id: &str, version: u64, task_groups: Vec<TaskGroup>) -> Job {
    Job {
        id: id.to_string(),
        namespace: "default".to_string(),
        job_type: JobType::Service,
        version,
        create_index: 1,
        modify_index: 1 + version,
        stop: false,
        multiregion: false,
        periodic: false,
        parameterized: false,
        task_groups,
    }
}

fn alloc(job: &Job, group: &str, index: u64) -> Allocation {
    Allocation {
        id: AllocId::new(),
        name: alloc_name(&job.id, group, index),
        namespace: job.namespace.clone(),
        job_id: job.id.clone(),
        task_group: group.to_string(),
        node_id: NodeId::new(),
        job_version: job.version,
        job_create_index: job.create_index,
        create_index: 10 + index,
        deployment_id: None,
        desired_status: AllocDesiredStatus::Run,
        client_status: AllocClientStatus::Running,
        desired_transition: DesiredTransition::default(),
        deployment_status: None,
        previous_allocation: None,
        next_allocation: None,
        followup_eval_id: None,
        reschedule: None,
        metrics: AllocMetrics::default(),
        last_event_at: None,
    }
}

fn tainted_node(status: NodeStatus, drain: bool, observed_at: DateTime<Utc>) -> Node {
    Node {
        id: NodeId::new(),
        status,
        drain,
        status_updated_at: observed_at,
        max_client_disconnect: None,
    }
}

fn ignore_all(_: &Allocation, _: &Job, _: &TaskGroup) -> UpdateDecision {
    UpdateDecision::Ignore
}

fn destructive_on_version_change(alloc: &Allocation, job: &Job, _: &TaskGroup) -> UpdateDecision {
    if alloc.job_version < job.version {
        UpdateDecision::Destructive
    } else {
        UpdateDecision::Ignore
    }
}

fn run(
    oracle: &AllocUpdateFn<'_>,
    job: &Job,
    deployment: Option<&Deployment>,
    allocs: Vec<Allocation>,
    nodes: TaintedNodes,
) -> ReconcileResult {
    AllocReconciler::new(
        oracle,
        job.job_type == JobType::Batch,
        job.id.clone(),
        Some(job.clone()),
        deployment,
        allocs,
        nodes,
        EvalId::from_ulid(Ulid::from_parts(999, 999)),
        50,
        now(),
    )
    .with_id_source(Box::new(SeqIds::new()))
    .compute()
}

fn desired<'a>(result: &'a ReconcileResult, group: &str) -> &'a DesiredUpdates {
    result
        .desired_tg_updates
        .get(group)
        .expect("desired changes recorded for group")
}

#[test]
fn test_fresh_deploy_places_all() {
    let job = job("web", 1, vec![task_group("api", 3)]);

    let result = run(&ignore_all, &job, None, vec![], TaintedNodes::new());

    let names: Vec<&str> = result.place.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["web.api[0]", "web.api[1]", "web.api[2]"]);
    assert!(result.place.iter().all(|p| p.previous_alloc.is_none()));
    assert!(result.stop.is_empty());
    assert!(result.deployment.is_none(), "no update strategy, no deployment");
    assert_eq!(desired(&result, "api").place, 3);
    assert_eq!(result.changes(), 3);
}

#[test]
fn test_scale_down_stops_highest_names() {
    let job = job("web", 1, vec![task_group("api", 2)]);
    let allocs: Vec<Allocation> = (0..3).map(|i| alloc(&job, "api", i)).collect();

    let result = run(&ignore_all, &job, None, allocs, TaintedNodes::new());

    assert!(result.place.is_empty());
    assert_eq!(result.stop.len(), 1);
    assert_eq!(result.stop[0].alloc.name, "web.api[2]");
    assert_eq!(result.stop[0].reason, stop_reasons::NOT_NEEDED);
    assert_eq!(result.stop[0].client_status, None);

    let changes = desired(&result, "api");
    assert_eq!(changes.stop, 1);
    assert_eq!(changes.ignore, 2);
}

#[test]
fn test_canary_rollout_waits_for_promotion() {
    let mut group = task_group("api", 4);
    group.update = Some(update_strategy(2, 1));
    let old_job = job("web", 1, vec![group.clone()]);
    let new_job = job("web", 2, vec![group]);
    let allocs: Vec<Allocation> = (0..4).map(|i| alloc(&old_job, "api", i)).collect();

    let result = run(
        &destructive_on_version_change,
        &new_job,
        None,
        allocs,
        TaintedNodes::new(),
    );

    // Exactly one canary, previewing the replacement of index 0.
    assert_eq!(result.place.len(), 1);
    assert!(result.place[0].canary);
    assert_eq!(result.place[0].name, "web.api[0]");

    // Nothing rolls until the canary is promoted.
    assert!(result.destructive_update.is_empty());
    assert!(result.stop.is_empty());

    let deployment = result.deployment.as_ref().expect("deployment created");
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(
        deployment.status_description,
        status_descriptions::RUNNING_NEEDS_PROMOTION
    );
    let state = deployment.task_groups.get("api").expect("group state");
    assert_eq!(state.desired_canaries, 1);
    assert_eq!(state.desired_total, 4);

    let changes = desired(&result, "api");
    assert_eq!(changes.canary, 1);
    assert_eq!(changes.ignore, 4);
    assert_eq!(changes.destructive_update, 0);
}

#[test]
fn test_paused_deployment_only_backfills_lost() {
    let mut group = task_group("api", 3);
    group.update = Some(update_strategy(2, 0));
    let job = job("web", 2, vec![group]);

    let mut deployment = Deployment::new(DeployId::new(), &job, 50);
    deployment.status = DeploymentStatus::Paused;
    deployment.task_groups.insert(
        "api".to_string(),
        DeploymentState {
            desired_total: 3,
            healthy_allocs: 2,
            ..DeploymentState::default()
        },
    );

    let down = tainted_node(NodeStatus::Down, false, now());
    let mut allocs: Vec<Allocation> = (0..3).map(|i| alloc(&job, "api", i)).collect();
    allocs[2].node_id = down.id;
    let nodes: TaintedNodes = [(down.id, down)].into_iter().collect();

    let result = run(&ignore_all, &job, Some(&deployment), allocs, nodes);

    assert_eq!(result.place.len(), 1, "only the lost alloc is backfilled");
    assert!(result.place[0].lost);
    assert_eq!(result.place[0].name, "web.api[2]");

    assert_eq!(result.stop.len(), 1);
    assert_eq!(result.stop[0].client_status, Some(AllocClientStatus::Lost));
    assert_eq!(result.stop[0].reason, stop_reasons::LOST);
    assert!(result.destructive_update.is_empty());

    let changes = desired(&result, "api");
    assert_eq!(changes.place, 1);
    assert_eq!(changes.stop, 1);
    assert_eq!(changes.ignore, 2);
}

#[test]
fn test_failed_alloc_reschedules_later_with_followup_eval() {
    let mut group = task_group("api", 1);
    group.reschedule = Some(reschedule_policy(Duration::from_secs(30)));
    let job = job("web", 1, vec![group]);

    let mut failed = alloc(&job, "api", 0);
    failed.client_status = AllocClientStatus::Failed;
    failed.last_event_at = Some(now());

    let result = run(&ignore_all, &job, None, vec![failed.clone()], TaintedNodes::new());

    assert!(result.place.is_empty());
    assert!(result.stop.is_empty());
    assert_eq!(result.changes(), 0);

    let evals = result
        .desired_followup_evals
        .get("api")
        .expect("followup evals for group");
    assert_eq!(evals.len(), 1);
    let eval = &evals[0];
    assert_eq!(eval.triggered_by, EvalTrigger::RetryFailedAlloc);
    assert_eq!(eval.wait_until, Some(now() + chrono::Duration::seconds(30)));
    assert_eq!(eval.status_description, RESCHEDULING_FOLLOWUP_EVAL_DESC);

    let patched = result
        .attribute_updates
        .get(&failed.id)
        .expect("attribute update carries the followup eval");
    assert_eq!(patched.followup_eval_id, Some(eval.id));
}

#[test]
fn test_failed_alloc_reschedules_now_when_delay_elapsed() {
    let mut group = task_group("api", 1);
    group.reschedule = Some(reschedule_policy(Duration::from_secs(30)));
    let job = job("web", 1, vec![group]);

    let mut failed = alloc(&job, "api", 0);
    failed.client_status = AllocClientStatus::Failed;
    failed.last_event_at = Some(now() - chrono::Duration::seconds(60));

    let result = run(&ignore_all, &job, None, vec![failed.clone()], TaintedNodes::new());

    assert_eq!(result.place.len(), 1);
    let placement = &result.place[0];
    assert!(placement.reschedule);
    assert_eq!(placement.name, "web.api[0]");
    assert_eq!(
        placement.previous_alloc.as_ref().map(|a| a.id),
        Some(failed.id)
    );
    assert_eq!(placement.min_job_version, 1);

    assert_eq!(result.stop.len(), 1);
    assert_eq!(result.stop[0].reason, stop_reasons::RESCHEDULED);

    let changes = desired(&result, "api");
    assert_eq!(changes.place, 1);
    assert_eq!(changes.stop, 1);
}

#[test]
fn test_reconnect_keeps_higher_scored_alloc() {
    let mut group = task_group("api", 1);
    group.resume_after_client_reconnect = Some(Duration::from_secs(300));
    let job = job("web", 1, vec![group]);

    let score = |node_id, norm| AllocMetrics {
        scores: vec![NodeScore {
            node_id,
            norm_score: norm,
        }],
    };

    // The original disconnected, got marked unknown, and its node is back.
    let mut original = alloc(&job, "api", 0);
    original.client_status = AllocClientStatus::Unknown;
    original.metrics = score(original.node_id, 0.9);

    // Its replacement was placed in the meantime, with a worse score.
    let mut replacement = alloc(&job, "api", 0);
    replacement.metrics = score(replacement.node_id, 0.7);

    let result = run(
        &ignore_all,
        &job,
        None,
        vec![original.clone(), replacement.clone()],
        TaintedNodes::new(),
    );

    assert_eq!(result.stop.len(), 1);
    assert_eq!(result.stop[0].alloc.id, replacement.id, "lower score loses");
    assert!(result.place.is_empty());

    assert!(result.reconnect_updates.contains_key(&original.id));
    assert!(!result.reconnect_updates.contains_key(&replacement.id));
}

#[test]
fn test_stopped_job_stops_everything_and_cancels_deployment() {
    let mut stopped = job("web", 2, vec![task_group("api", 3)]);
    stopped.stop = true;

    let deployment = Deployment::new(DeployId::new(), &stopped, 50);

    let down = tainted_node(NodeStatus::Down, false, now());
    let mut allocs: Vec<Allocation> = (0..3).map(|i| alloc(&stopped, "api", i)).collect();
    allocs[1].node_id = down.id;
    let nodes: TaintedNodes = [(down.id, down)].into_iter().collect();

    let result = run(&ignore_all, &stopped, Some(&deployment), allocs, nodes);

    assert!(result.place.is_empty());
    assert_eq!(result.stop.len(), 3);
    let lost: Vec<_> = result
        .stop
        .iter()
        .filter(|s| s.client_status == Some(AllocClientStatus::Lost))
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].reason, stop_reasons::LOST);

    assert_eq!(result.deployment_updates.len(), 1);
    assert_eq!(result.deployment_updates[0].status, DeploymentStatus::Cancelled);
    assert_eq!(
        result.deployment_updates[0].status_description,
        status_descriptions::STOPPED_JOB
    );

    assert_eq!(desired(&result, "api").stop, 3);
}

#[test]
fn test_removed_task_group_stops_all_allocs() {
    let job_without_group = job("web", 2, vec![task_group("worker", 1)]);
    let old_job = job("web", 1, vec![task_group("api", 2)]);
    let allocs: Vec<Allocation> = (0..2).map(|i| alloc(&old_job, "api", i)).collect();

    let result = run(
        &ignore_all,
        &job_without_group,
        None,
        allocs,
        TaintedNodes::new(),
    );

    let api_stops: Vec<_> = result
        .stop
        .iter()
        .filter(|s| s.alloc.task_group == "api")
        .collect();
    assert_eq!(api_stops.len(), 2);
    assert!(api_stops
        .iter()
        .all(|s| s.reason == stop_reasons::NOT_NEEDED));
    assert_eq!(desired(&result, "api").stop, 2);

    // The group that does exist gets its placement.
    assert_eq!(desired(&result, "worker").place, 1);
}

#[test]
fn test_draining_node_migrates_allocs() {
    let job = job("web", 1, vec![task_group("api", 2)]);
    let draining = tainted_node(NodeStatus::Ready, true, now());

    let mut allocs: Vec<Allocation> = (0..2).map(|i| alloc(&job, "api", i)).collect();
    allocs[0].node_id = draining.id;
    let nodes: TaintedNodes = [(draining.id, draining)].into_iter().collect();

    let result = run(&ignore_all, &job, None, allocs, nodes);

    assert_eq!(result.stop.len(), 1);
    assert_eq!(result.stop[0].reason, stop_reasons::MIGRATING);
    assert_eq!(result.place.len(), 1);
    let placement = &result.place[0];
    assert_eq!(placement.name, "web.api[0]", "migration keeps the name");
    assert_eq!(placement.min_job_version, 1);
    assert!(placement.previous_alloc.is_some());

    let changes = desired(&result, "api");
    assert_eq!(changes.migrate, 1);
    assert_eq!(changes.ignore, 1);
    assert_eq!(changes.place, 0, "migrations are counted as migrate, not place");
}

#[test]
fn test_destructive_updates_respect_max_parallel() {
    let mut group = task_group("api", 4);
    group.update = Some(update_strategy(2, 0));
    let old_job = job("web", 1, vec![group.clone()]);
    let new_job = job("web", 2, vec![group]);

    let mut deployment = Deployment::new(DeployId::new(), &new_job, 50);
    deployment.task_groups.insert(
        "api".to_string(),
        DeploymentState {
            desired_total: 4,
            ..DeploymentState::default()
        },
    );

    let allocs: Vec<Allocation> = (0..4).map(|i| alloc(&old_job, "api", i)).collect();

    let result = run(
        &destructive_on_version_change,
        &new_job,
        Some(&deployment),
        allocs,
        TaintedNodes::new(),
    );

    assert_eq!(result.destructive_update.len(), 2);
    let names: Vec<&str> = result
        .destructive_update
        .iter()
        .map(|d| d.place_name.as_str())
        .collect();
    assert_eq!(names, vec!["web.api[0]", "web.api[1]"], "name order");
    assert!(result
        .destructive_update
        .iter()
        .all(|d| d.stop_reason == stop_reasons::UPDATING));

    let changes = desired(&result, "api");
    assert_eq!(changes.destructive_update, 2);
    assert_eq!(changes.ignore, 2, "the rest wait for the next pass");
}

#[test]
fn test_disconnecting_alloc_gets_unknown_status_and_timeout_eval() {
    let mut group = task_group("api", 1);
    group.resume_after_client_reconnect = Some(Duration::from_secs(300));
    let job = job("web", 1, vec![group]);

    let observed = now() - chrono::Duration::seconds(60);
    let disconnected = tainted_node(NodeStatus::Disconnected, false, observed);
    let mut running = alloc(&job, "api", 0);
    running.node_id = disconnected.id;
    let nodes: TaintedNodes = [(disconnected.id, disconnected)].into_iter().collect();

    let result = run(&ignore_all, &job, None, vec![running.clone()], nodes);

    // The alloc is marked unknown and linked to its timeout eval.
    let patched = result
        .disconnect_updates
        .get(&running.id)
        .expect("disconnect update staged");
    assert_eq!(patched.client_status, AllocClientStatus::Unknown);
    let eval_id = patched.followup_eval_id.expect("followup eval linked");

    let evals = result
        .desired_followup_evals
        .get("api")
        .expect("timeout eval for group");
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].id, eval_id);
    assert_eq!(evals[0].triggered_by, EvalTrigger::ResumeTimeout);
    assert_eq!(
        evals[0].status_description,
        DISCONNECT_TIMEOUT_FOLLOWUP_EVAL_DESC
    );
    assert_eq!(
        evals[0].wait_until,
        Some(observed + chrono::Duration::seconds(300))
    );

    // A replacement is placed under the same name while we wait.
    assert_eq!(result.place.len(), 1);
    assert_eq!(result.place[0].name, "web.api[0]");
    assert!(result.stop.is_empty());
}

#[test]
fn test_followup_evals_batch_within_window() {
    let mut group = task_group("api", 3);
    group.reschedule = Some(reschedule_policy(Duration::from_secs(30)));
    let job = job("web", 1, vec![group]);

    // Ready at now+30, now+32 and now+40: the first two share a batch.
    let mut allocs = Vec::new();
    for (i, fail_offset) in [0i64, 2, 10].into_iter().enumerate() {
        let mut failed = alloc(&job, "api", i as u64);
        failed.client_status = AllocClientStatus::Failed;
        failed.last_event_at = Some(now() + chrono::Duration::seconds(fail_offset));
        allocs.push(failed);
    }
    let ids: Vec<AllocId> = allocs.iter().map(|a| a.id).collect();

    let result = run(&ignore_all, &job, None, allocs, TaintedNodes::new());

    let evals = result
        .desired_followup_evals
        .get("api")
        .expect("followup evals");
    assert_eq!(evals.len(), 2);
    assert_eq!(
        evals[0].wait_until,
        Some(now() + chrono::Duration::seconds(30))
    );
    assert_eq!(
        evals[1].wait_until,
        Some(now() + chrono::Duration::seconds(40))
    );

    let eval_for = |id: &AllocId| {
        result
            .attribute_updates
            .get(id)
            .and_then(|a| a.followup_eval_id)
            .expect("attribute update present")
    };
    assert_eq!(eval_for(&ids[0]), evals[0].id);
    assert_eq!(eval_for(&ids[1]), evals[0].id);
    assert_eq!(eval_for(&ids[2]), evals[1].id);
}

#[test]
fn test_deployment_for_older_job_version_is_cancelled() {
    let old_job = job("web", 1, vec![task_group("api", 2)]);
    let new_job = job("web", 2, vec![task_group("api", 2)]);
    let deployment = Deployment::new(DeployId::new(), &old_job, 50);

    let allocs: Vec<Allocation> = (0..2).map(|i| alloc(&new_job, "api", i)).collect();

    let result = run(&ignore_all, &new_job, Some(&deployment), allocs, TaintedNodes::new());

    assert_eq!(result.deployment_updates.len(), 1);
    assert_eq!(result.deployment_updates[0].deployment_id, deployment.id);
    assert_eq!(result.deployment_updates[0].status, DeploymentStatus::Cancelled);
    assert_eq!(
        result.deployment_updates[0].status_description,
        status_descriptions::NEWER_JOB
    );
}

#[test]
fn test_inplace_updates_never_overlap_stops() {
    let job_v2 = job("web", 2, vec![task_group("api", 2)]);
    let old_job = job("web", 1, vec![task_group("api", 2)]);
    let allocs: Vec<Allocation> = (0..3).map(|i| alloc(&old_job, "api", i)).collect();

    let inplace_oracle = |existing: &Allocation, new_job: &Job, _: &TaskGroup| {
        let mut updated = existing.clone();
        updated.job_version = new_job.version;
        UpdateDecision::Inplace(Box::new(updated))
    };

    let result = run(&inplace_oracle, &job_v2, None, allocs, TaintedNodes::new());

    // One alloc is stopped for scale-down, the survivors update in place.
    assert_eq!(result.stop.len(), 1);
    assert_eq!(result.inplace_update.len(), 2);
    for updated in &result.inplace_update {
        assert!(
            result.stop.iter().all(|s| s.alloc.id != updated.id),
            "an alloc must not be both stopped and updated in place"
        );
        assert_eq!(updated.job_version, 2);
    }

    let changes = desired(&result, "api");
    assert_eq!(changes.in_place_update, 2);
    assert_eq!(changes.stop, 1);
}

#[test]
fn test_batch_complete_alloc_is_not_replaced() {
    let mut batch_job = job("import", 1, vec![task_group("etl", 1)]);
    batch_job.job_type = JobType::Batch;

    let mut done = alloc(&batch_job, "etl", 0);
    done.client_status = AllocClientStatus::Complete;

    let result = run(&ignore_all, &batch_job, None, vec![done], TaintedNodes::new());

    assert!(result.place.is_empty(), "completed batch work stays done");
    assert!(result.stop.is_empty());
    assert_eq!(result.changes(), 0);
}

#[test]
fn test_scale_down_is_idempotent_after_apply() {
    let job = job("web", 1, vec![task_group("api", 2)]);
    let allocs: Vec<Allocation> = (0..3).map(|i| alloc(&job, "api", i)).collect();

    let first = run(&ignore_all, &job, None, allocs.clone(), TaintedNodes::new());
    assert_eq!(first.changes(), 1);

    // Apply: drop the stopped alloc, then reconcile again.
    let stopped: Vec<AllocId> = first.stop.iter().map(|s| s.alloc.id).collect();
    let remaining: Vec<Allocation> = allocs
        .into_iter()
        .filter(|a| !stopped.contains(&a.id))
        .collect();

    let second = run(&ignore_all, &job, None, remaining, TaintedNodes::new());
    assert_eq!(second.changes(), 0);
}

#[test]
fn test_disconnect_handling_is_idempotent_after_apply() {
    let mut group = task_group("api", 1);
    group.resume_after_client_reconnect = Some(Duration::from_secs(300));
    let job = job("web", 1, vec![group]);

    let disconnected = tainted_node(NodeStatus::Disconnected, false, now());
    let mut running = alloc(&job, "api", 0);
    running.node_id = disconnected.id;
    let nodes: TaintedNodes = [(disconnected.id, disconnected)].into_iter().collect();

    let first = run(&ignore_all, &job, None, vec![running.clone()], nodes.clone());
    assert_eq!(first.place.len(), 1);
    assert_eq!(first.disconnect_updates.len(), 1);

    // Apply: the original is now unknown, the replacement is running.
    let unknown = first
        .disconnect_updates
        .get(&running.id)
        .expect("disconnect update")
        .clone();
    let mut replacement = alloc(&job, "api", 0);
    replacement.previous_allocation = Some(running.id);

    let second = run(&ignore_all, &job, None, vec![unknown, replacement], nodes);
    assert_eq!(second.changes(), 0);
    assert!(second.disconnect_updates.is_empty());
    assert!(second.desired_followup_evals.is_empty());
}

#[test]
fn test_multiregion_deployment_starts_pending() {
    let mut group = task_group("api", 2);
    group.update = Some(update_strategy(1, 0));
    let mut multiregion = job("web", 2, vec![group]);
    multiregion.multiregion = true;

    let old_job = job("web", 1, vec![task_group("api", 2)]);
    let allocs: Vec<Allocation> = (0..2).map(|i| alloc(&old_job, "api", i)).collect();

    let result = run(
        &destructive_on_version_change,
        &multiregion,
        None,
        allocs,
        TaintedNodes::new(),
    );

    let deployment = result.deployment.as_ref().expect("deployment created");
    assert_eq!(deployment.status, DeploymentStatus::Pending);
    assert_eq!(
        deployment.status_description,
        status_descriptions::PENDING_FOR_PEER
    );

    // Pending counts as paused: nothing rolls yet.
    assert!(result.destructive_update.is_empty());
    assert!(result.place.is_empty());
}

#[test]
fn test_eval_trigger_vocabulary() {
    assert_eq!(EvalTrigger::RetryFailedAlloc.as_str(), "retry-failed-alloc");
    assert_eq!(EvalTrigger::ResumeTimeout.as_str(), "resume-timeout");
    assert_eq!(
        serde_json::to_string(&EvalTrigger::RetryFailedAlloc).expect("serialize"),
        "\"retry-failed-alloc\""
    );
    assert_eq!(stop_reasons::NOT_NEEDED, "alloc-not-needed");
    assert_eq!(stop_reasons::UPDATING, "alloc-updating");
    assert_eq!(status_descriptions::PENDING_FOR_PEER, "pending-for-peer");
}

#[test]
fn test_plan_display_summarizes_changes() {
    let job = job("web", 1, vec![task_group("api", 2)]);
    let result = run(&ignore_all, &job, None, vec![], TaintedNodes::new());

    let rendered = result.to_string();
    assert!(rendered.contains("Total changes: (place 2)"));
    assert!(rendered.contains("Desired changes for \"api\""));
}
