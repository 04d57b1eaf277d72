//! Reschedule metrics.
//!
//! Short-lived gauges describing the rescheduling decision for an
//! allocation. Instruments are built once against the global meter.

use std::sync::OnceLock;

use opentelemetry::metrics::Gauge;
use opentelemetry::{global, KeyValue};

use flotilla_structs::{Allocation, Evaluation, ReschedulePolicy};

struct RescheduleGauges {
    attempted: Gauge<f64>,
    limit: Gauge<f64>,
    wait_until: Gauge<f64>,
}

fn gauges() -> &'static RescheduleGauges {
    static GAUGES: OnceLock<RescheduleGauges> = OnceLock::new();
    GAUGES.get_or_init(|| {
        let meter = global::meter("scheduler");
        RescheduleGauges {
            attempted: meter
                .f64_gauge("scheduler.allocs.reschedule.attempted")
                .with_description("Reschedule attempts consumed within the policy interval")
                .build(),
            limit: meter
                .f64_gauge("scheduler.allocs.reschedule.limit")
                .with_description("Reschedule attempts allowed by the policy")
                .build(),
            wait_until: meter
                .f64_gauge("scheduler.allocs.reschedule.wait_until")
                .with_description("Unix time at which the delayed reschedule becomes due")
                .build(),
        }
    })
}

/// Emits the rescheduling gauges for one allocation. When a follow-up
/// evaluation exists its wait-until instant is emitted as well.
pub(crate) fn emit_reschedule_info(
    alloc: &Allocation,
    policy: Option<&ReschedulePolicy>,
    followup_eval: Option<&Evaluation>,
) {
    let mut labels = vec![
        KeyValue::new("alloc_id", alloc.id.to_string()),
        KeyValue::new("job", alloc.job_id.clone()),
        KeyValue::new("namespace", alloc.namespace.clone()),
        KeyValue::new("task_group", alloc.task_group.clone()),
    ];

    if let Some(eval) = followup_eval {
        labels.push(KeyValue::new("followup_eval_id", eval.id.to_string()));
        if let Some(wait_until) = eval.wait_until {
            gauges()
                .wait_until
                .record(wait_until.timestamp() as f64, &labels);
        }
    }

    let (attempted, limit) = alloc.reschedule_info(policy);
    gauges().attempted.record(f64::from(attempted), &labels);
    gauges().limit.record(f64::from(limit), &labels);
}
