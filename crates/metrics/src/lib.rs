//! Thin wrapper around prometheus that owns the process-global metrics
//! registry. Subsystems declare their metrics with the `register_pulse_*`
//! macros and log observations through the helpers here; the HTTP layer
//! scrapes `PULSE_METRICS_REGISTRY`.

use std::sync::LazyLock;

pub use paste::paste;
pub use prometheus;
use prometheus::{
    Gauge,
    GaugeVec,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
    Registry,
};

mod labels;
mod macros;
mod timer;

pub use labels::{
    MetricLabel,
    STATUS_LABEL,
};
pub use timer::Timer;

/// All metrics in the process register against this registry so a single
/// scrape endpoint sees everything.
pub static PULSE_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub fn log_counter(counter: &LazyLock<IntCounter>, count: u64) {
    counter.inc_by(count);
}

pub fn log_counter_with_labels(
    counter: &LazyLock<IntCounterVec>,
    count: u64,
    labels: Vec<MetricLabel>,
) {
    let values: Vec<&str> = labels.iter().map(|l| l.value()).collect();
    counter.with_label_values(&values).inc_by(count);
}

pub fn log_distribution(histogram: &LazyLock<Histogram>, value: f64) {
    histogram.observe(value);
}

pub fn log_distribution_with_labels(
    histogram: &LazyLock<HistogramVec>,
    value: f64,
    labels: Vec<MetricLabel>,
) {
    let values: Vec<&str> = labels.iter().map(|l| l.value()).collect();
    histogram.with_label_values(&values).observe(value);
}

pub fn log_gauge(gauge: &LazyLock<Gauge>, value: f64) {
    gauge.set(value);
}

pub fn log_gauge_with_labels(gauge: &LazyLock<GaugeVec>, value: f64, labels: Vec<MetricLabel>) {
    let values: Vec<&str> = labels.iter().map(|l| l.value()).collect();
    gauge.with_label_values(&values).set(value);
}

#[cfg(test)]
mod tests {
    use crate::{
        log_counter,
        log_counter_with_labels,
        MetricLabel,
        STATUS_LABEL,
    };

    crate::register_pulse_counter!(TEST_EVENTS_TOTAL, "Test counter");
    crate::register_pulse_counter!(
        TEST_LABELED_EVENTS_TOTAL,
        "Test labeled counter",
        &STATUS_LABEL
    );

    #[test]
    fn test_counter_registration_and_logging() {
        log_counter(&TEST_EVENTS_TOTAL, 3);
        assert_eq!(TEST_EVENTS_TOTAL.get(), 3);

        log_counter_with_labels(&TEST_LABELED_EVENTS_TOTAL, 2, vec![MetricLabel::STATUS_SUCCESS]);
        log_counter_with_labels(&TEST_LABELED_EVENTS_TOTAL, 1, vec![MetricLabel::STATUS_ERROR]);
        assert_eq!(
            TEST_LABELED_EVENTS_TOTAL.with_label_values(&["success"]).get(),
            2
        );
        assert_eq!(
            TEST_LABELED_EVENTS_TOTAL.with_label_values(&["error"]).get(),
            1
        );
    }
}
