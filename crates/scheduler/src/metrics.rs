use ::metrics::{
    log_counter_with_labels,
    register_pulse_counter,
    register_pulse_histogram,
    MetricLabel,
    Timer,
};

const JOB_LABEL: [&str; 1] = ["job"];
const JOB_STATUS_LABEL: [&str; 2] = ["job", "status"];

register_pulse_counter!(
    SCHEDULER_TICKS_DROPPED_TOTAL,
    "Ticks dropped because the previous invocation was still running",
    &JOB_LABEL
);
pub fn log_tick_dropped(job: &str) {
    log_counter_with_labels(
        &SCHEDULER_TICKS_DROPPED_TOTAL,
        1,
        vec![MetricLabel::new("job", job.to_string())],
    );
}

register_pulse_counter!(
    SCHEDULER_JOB_RESULT_TOTAL,
    "Count of job invocation results",
    &JOB_STATUS_LABEL
);
pub fn log_job_result(job: &str, is_ok: bool) {
    log_counter_with_labels(
        &SCHEDULER_JOB_RESULT_TOTAL,
        1,
        vec![
            MetricLabel::new("job", job.to_string()),
            MetricLabel::status(is_ok),
        ],
    );
}

register_pulse_histogram!(SCHEDULER_JOB_SECONDS, "Wall time of a single job invocation");
pub fn job_timer() -> Timer {
    Timer::new(&SCHEDULER_JOB_SECONDS)
}
