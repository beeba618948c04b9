use ::metrics::{
    log_counter,
    log_counter_with_labels,
    log_gauge,
    register_pulse_counter,
    register_pulse_gauge,
    register_pulse_histogram,
    MetricLabel,
    Timer,
    STATUS_LABEL,
};
use store::results::ErrorCode;

register_pulse_counter!(
    EXECUTOR_DISPATCH_TOTAL,
    "Count of dispatch attempts by outcome",
    &STATUS_LABEL
);
pub fn log_dispatch(error_code: Option<ErrorCode>) {
    let label = match error_code {
        None => MetricLabel::STATUS_SUCCESS,
        Some(code) => MetricLabel::new("status", code.as_str()),
    };
    log_counter_with_labels(&EXECUTOR_DISPATCH_TOTAL, 1, vec![label]);
}

register_pulse_histogram!(EXECUTOR_DISPATCH_SECONDS, "Duration of a single dispatch");
pub fn dispatch_timer() -> Timer {
    Timer::new(&EXECUTOR_DISPATCH_SECONDS)
}

register_pulse_counter!(
    EXECUTOR_NO_SLOT_TOTAL,
    "Count of sync runs rejected because no slot was eligible",
    &STATUS_LABEL
);
pub fn log_no_slot(error_code: ErrorCode) {
    log_counter_with_labels(
        &EXECUTOR_NO_SLOT_TOTAL,
        1,
        vec![MetricLabel::new("status", error_code.as_str())],
    );
}

register_pulse_counter!(
    EXECUTOR_COOLDOWNS_TOTAL,
    "Count of cooldowns applied to slots",
    &STATUS_LABEL
);
pub fn log_cooldown(error_code: ErrorCode) {
    log_counter_with_labels(
        &EXECUTOR_COOLDOWNS_TOTAL,
        1,
        vec![MetricLabel::new("status", error_code.as_str())],
    );
}

register_pulse_counter!(
    SLOT_REGISTRY_SYNC_TOTAL,
    "Count of registry sync attempts",
    &STATUS_LABEL
);
pub fn log_registry_sync(is_ok: bool) {
    log_counter_with_labels(&SLOT_REGISTRY_SYNC_TOTAL, 1, vec![MetricLabel::status(is_ok)]);
}

register_pulse_gauge!(SLOT_REGISTRY_SLOTS_TOTAL, "Slots in the current registry snapshot");
register_pulse_gauge!(
    SLOT_REGISTRY_ACCOUNTS_TOTAL,
    "Active accounts in the current registry snapshot"
);
pub fn log_registry_size(slots: usize, accounts: usize) {
    log_gauge(&SLOT_REGISTRY_SLOTS_TOTAL, slots as f64);
    log_gauge(&SLOT_REGISTRY_ACCOUNTS_TOTAL, accounts as f64);
}

register_pulse_counter!(QUEUE_TASKS_ENQUEUED_TOTAL, "Count of tasks accepted by the durable queue");
pub fn log_enqueued() {
    log_counter(&QUEUE_TASKS_ENQUEUED_TOTAL, 1);
}

register_pulse_counter!(
    QUEUE_TASK_OUTCOME_TOTAL,
    "Count of leased task outcomes: done, requeued or failed",
    &STATUS_LABEL
);
pub fn log_worker_outcome(outcome: &'static str) {
    log_counter_with_labels(
        &QUEUE_TASK_OUTCOME_TOTAL,
        1,
        vec![MetricLabel::new("status", outcome)],
    );
}

register_pulse_histogram!(
    QUEUE_TASK_SECONDS,
    "Wall time a leased task spends in the worker, dispatch included"
);
pub fn worker_task_timer() -> Timer {
    Timer::new(&QUEUE_TASK_SECONDS)
}
