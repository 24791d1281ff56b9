//! Metrics registry for coordinating phase-specific metrics
//!
//! Registers every phase's metrics at startup and detects naming conflicts early.

use crate::metrics::{MetricDoc, MetricType, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Register all metrics from all phases
pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::ingest::IngestMetrics>(&mut all_metrics);
    register_phase_metrics::<super::normalize::NormalizeMetrics>(&mut all_metrics);
    register_phase_metrics::<super::merge::MergeMetrics>(&mut all_metrics);
    register_phase_metrics::<super::enrich::EnrichMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );
}

/// Register metrics for a specific phase and detect conflicts
fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<String, MetricDoc>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        describe(&doc);
        if all_metrics.contains_key(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' redefined by phase '{}'",
                doc.name, phase_name
            );
        } else {
            debug!(metric = doc.name, phase = phase_name, "Registered metric");
            all_metrics.insert(doc.name.to_string(), doc);
        }
    }
}

fn describe(doc: &MetricDoc) {
    match doc.metric_type {
        MetricType::Counter => ::metrics::describe_counter!(doc.name, doc.help),
        MetricType::Histogram => ::metrics::describe_histogram!(doc.name, doc.help),
    }
}

/// Extract phase name from metric name (e.g., "ec_merge_keys_added_total" -> "merge")
pub fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    if let Some(stripped) = metric_name.strip_prefix("ec_") {
        if let Some(next_underscore) = stripped.find('_') {
            return &stripped[..next_underscore];
        }
    }
    "unknown"
}
