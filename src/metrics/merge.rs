//! Merge Phase Metrics
//!
//! Key deltas of each merge, master table size and publish outcomes.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};
use crate::pipeline::processing::merge::MergeStats;

/// Metrics collection for the Merge phase
pub struct MergeMetrics;

impl MergeMetrics {
    pub fn record_merge(stats: &MergeStats, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "merge", "keys_added")).increment(stats.added as u64);
        ::metrics::counter!(phase_metric!(counter, "merge", "keys_overwritten"))
            .increment(stats.overwritten as u64);
        ::metrics::counter!(phase_metric!(counter, "merge", "keys_unchanged"))
            .increment(stats.unchanged as u64);
        ::metrics::histogram!(phase_metric!(histogram, "merge", "master_records")).record(stats.total as f64);
        ::metrics::histogram!(phase_metric!(histogram, "merge", "duration_seconds")).record(duration_secs);
    }

    pub fn record_integrity_failure() {
        ::metrics::counter!(phase_metric!(counter, "merge", "integrity_failures")).increment(1);
    }

    pub fn record_publish() {
        ::metrics::counter!(phase_metric!(counter, "merge", "publishes")).increment(1);
    }
}

impl PhaseMetrics for MergeMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "merge", "keys_added"));
        let _ = counter!(phase_metric!(counter, "merge", "keys_overwritten"));
        let _ = counter!(phase_metric!(counter, "merge", "keys_unchanged"));
        let _ = counter!(phase_metric!(counter, "merge", "integrity_failures"));
        let _ = counter!(phase_metric!(counter, "merge", "publishes"));
        let _ = histogram!(phase_metric!(histogram, "merge", "master_records"));
        let _ = histogram!(phase_metric!(histogram, "merge", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "merge"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "merge", "keys_added"),
                metric_type: MetricType::Counter,
                help: "Business keys new to the master table",
            },
            MetricDoc {
                name: phase_metric!(counter, "merge", "keys_overwritten"),
                metric_type: MetricType::Counter,
                help: "Existing keys whose record changed",
            },
            MetricDoc {
                name: phase_metric!(counter, "merge", "keys_unchanged"),
                metric_type: MetricType::Counter,
                help: "Existing keys left as they were",
            },
            MetricDoc {
                name: phase_metric!(counter, "merge", "integrity_failures"),
                metric_type: MetricType::Counter,
                help: "Merges aborted because a business key would appear twice",
            },
            MetricDoc {
                name: phase_metric!(counter, "merge", "publishes"),
                metric_type: MetricType::Counter,
                help: "Master tables published",
            },
            MetricDoc {
                name: phase_metric!(histogram, "merge", "master_records"),
                metric_type: MetricType::Histogram,
                help: "Records in the master table after a merge",
            },
            MetricDoc {
                name: phase_metric!(histogram, "merge", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time to merge batches into the master table",
            },
        ]
    }
}
