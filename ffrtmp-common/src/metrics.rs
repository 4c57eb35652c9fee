use prometheus::{IntCounterVec, IntGaugeVec};

pub const DEFAULT_TIME_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Touches every label combination so enumerated dimensions are emitted
/// with zero values and dashboards never observe a missing series.
pub fn seed_int_counter_vec(vec: &IntCounterVec, labels: &[&[&str]]) {
    for label_values in labels {
        let _ = vec.get_metric_with_label_values(label_values);
    }
}

/// See [`seed_int_counter_vec`].
pub fn seed_int_gauge_vec(vec: &IntGaugeVec, labels: &[&[&str]]) {
    for label_values in labels {
        let _ = vec.get_metric_with_label_values(label_values);
    }
}
