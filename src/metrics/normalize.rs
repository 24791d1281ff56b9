//! Normalize Phase Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

/// Metrics collection for the Normalize phase
pub struct NormalizeMetrics;

impl NormalizeMetrics {
    /// Record the outcome of normalizing one batch
    pub fn record_batch(rows: usize, emitted: usize, rejected: usize, skipped: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "normalize", "rows")).increment(rows as u64);
        ::metrics::counter!(phase_metric!(counter, "normalize", "records_emitted")).increment(emitted as u64);
        ::metrics::counter!(phase_metric!(counter, "normalize", "rows_rejected")).increment(rejected as u64);
        ::metrics::counter!(phase_metric!(counter, "normalize", "rows_skipped")).increment(skipped as u64);
        ::metrics::histogram!(phase_metric!(histogram, "normalize", "duration_seconds"))
            .record(duration_secs);
    }
}

impl PhaseMetrics for NormalizeMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "normalize", "rows"));
        let _ = counter!(phase_metric!(counter, "normalize", "records_emitted"));
        let _ = counter!(phase_metric!(counter, "normalize", "rows_rejected"));
        let _ = counter!(phase_metric!(counter, "normalize", "rows_skipped"));
        let _ = histogram!(phase_metric!(histogram, "normalize", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "normalize"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "normalize", "rows"),
                metric_type: MetricType::Counter,
                help: "Raw rows handed to the normalizer",
            },
            MetricDoc {
                name: phase_metric!(counter, "normalize", "records_emitted"),
                metric_type: MetricType::Counter,
                help: "Canonical records produced",
            },
            MetricDoc {
                name: phase_metric!(counter, "normalize", "rows_rejected"),
                metric_type: MetricType::Counter,
                help: "Rows rejected for a required field that was blank or failed coercion",
            },
            MetricDoc {
                name: phase_metric!(counter, "normalize", "rows_skipped"),
                metric_type: MetricType::Counter,
                help: "Blank rows and repeated header rows",
            },
            MetricDoc {
                name: phase_metric!(histogram, "normalize", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time to normalize one batch",
            },
        ]
    }
}
