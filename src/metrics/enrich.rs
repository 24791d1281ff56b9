//! Enrich Phase Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

/// Metrics collection for the Enrich phase
pub struct EnrichMetrics;

impl EnrichMetrics {
    /// Record the outcome of one join over the master table
    pub fn record_join(matched: usize, missed: usize, reference_missing: bool) {
        ::metrics::counter!(phase_metric!(counter, "enrich", "matches")).increment(matched as u64);
        ::metrics::counter!(phase_metric!(counter, "enrich", "misses")).increment(missed as u64);
        if reference_missing {
            ::metrics::counter!(phase_metric!(counter, "enrich", "missing_references")).increment(1);
        }
    }
}

impl PhaseMetrics for EnrichMetrics {
    fn register_metrics() {
        use metrics::counter;

        let _ = counter!(phase_metric!(counter, "enrich", "matches"));
        let _ = counter!(phase_metric!(counter, "enrich", "misses"));
        let _ = counter!(phase_metric!(counter, "enrich", "missing_references"));
    }

    fn phase_name() -> &'static str {
        "enrich"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "enrich", "matches"),
                metric_type: MetricType::Counter,
                help: "Records that found a reference row",
            },
            MetricDoc {
                name: phase_metric!(counter, "enrich", "misses"),
                metric_type: MetricType::Counter,
                help: "Records left with blank enrichment columns",
            },
            MetricDoc {
                name: phase_metric!(counter, "enrich", "missing_references"),
                metric_type: MetricType::Counter,
                help: "Joins run without their reference table",
            },
        ]
    }
}
