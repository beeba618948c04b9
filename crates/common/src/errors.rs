use metrics::{
    log_counter,
    register_pulse_counter,
};

register_pulse_counter!(ERRORS_REPORTED_TOTAL, "Count of errors reported to the log funnel");

/// Funnel for errors that background loops swallow instead of propagating.
/// Keeps a counter so silent failures still show up on dashboards.
pub fn report_error(err: &mut anyhow::Error) {
    log_counter(&ERRORS_REPORTED_TOTAL, 1);
    tracing::error!("Caught error: {err:#}");
}
