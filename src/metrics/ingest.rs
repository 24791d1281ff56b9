//! Ingest Phase Metrics
//!
//! Input files read, their size and row counts, and files skipped before
//! normalization (repeated content, unresolvable headers).

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

/// Metrics collection for the Ingest phase
pub struct IngestMetrics;

impl IngestMetrics {
    /// Record one decoded input file
    pub fn record_file(bytes: usize, rows: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "files_read")).increment(1);
        ::metrics::counter!(phase_metric!(counter, "ingest", "rows_read")).increment(rows as u64);
        ::metrics::histogram!(phase_metric!(histogram, "ingest", "file_bytes")).record(bytes as f64);
        ::metrics::histogram!(phase_metric!(histogram, "ingest", "duration_seconds"))
            .record(duration_secs);
    }

    /// Record a file skipped because identical content was already processed
    pub fn record_duplicate_skipped() {
        ::metrics::counter!(phase_metric!(counter, "ingest", "duplicate_files_skipped")).increment(1);
    }

    /// Record a file whose header row could not be resolved, or which could not be read
    pub fn record_file_failed() {
        ::metrics::counter!(phase_metric!(counter, "ingest", "files_failed")).increment(1);
    }
}

impl PhaseMetrics for IngestMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "ingest", "files_read"));
        let _ = counter!(phase_metric!(counter, "ingest", "rows_read"));
        let _ = counter!(phase_metric!(counter, "ingest", "duplicate_files_skipped"));
        let _ = counter!(phase_metric!(counter, "ingest", "files_failed"));
        let _ = histogram!(phase_metric!(histogram, "ingest", "file_bytes"));
        let _ = histogram!(phase_metric!(histogram, "ingest", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "ingest"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "ingest", "files_read"),
                metric_type: MetricType::Counter,
                help: "Input files decoded and split into rows",
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "rows_read"),
                metric_type: MetricType::Counter,
                help: "Data rows read from input files",
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "duplicate_files_skipped"),
                metric_type: MetricType::Counter,
                help: "Input files skipped because their content was already processed in the run",
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "files_failed"),
                metric_type: MetricType::Counter,
                help: "Input files skipped for unreadable content or unresolved required columns",
            },
            MetricDoc {
                name: phase_metric!(histogram, "ingest", "file_bytes"),
                metric_type: MetricType::Histogram,
                help: "Size of input files in bytes",
            },
            MetricDoc {
                name: phase_metric!(histogram, "ingest", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time to read and decode one input file",
            },
        ]
    }
}
