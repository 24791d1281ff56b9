//! Centralized metrics infrastructure for the order-export pipeline
//!
//! Each pipeline phase defines its own metrics in a dedicated submodule, so
//! names stay owned by one phase and never collide.

pub mod enrich;
pub mod ingest;
pub mod merge;
pub mod normalize;
pub mod registry;

pub use enrich::EnrichMetrics;
pub use ingest::IngestMetrics;
pub use merge::MergeMetrics;
pub use normalize::NormalizeMetrics;

use std::fs;
use std::path::Path;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

use crate::error::Result;

static INIT: Once = Once::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Initialize the global metrics infrastructure
///
/// Idempotent. Installs an in-process Prometheus recorder and registers all
/// phase-specific metrics. Without this call the `metrics` macros are no-ops.
pub fn init_metrics() {
    INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                if HANDLE.set(handle).is_err() {
                    warn!("METRICS: handle already set");
                }
                registry::register_all_metrics();
                info!("Prometheus recorder installed");
            }
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
            }
        }
    });
}

/// Prometheus text exposition of everything recorded so far.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Writes the current snapshot to `path`; a no-op when no recorder is installed.
pub fn write_snapshot(path: &Path) -> Result<()> {
    match render() {
        Some(text) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, text)?;
            info!(path = %path.display(), "Wrote metrics snapshot");
        }
        None => warn!("Metrics recorder not installed, no snapshot written"),
    }
    Ok(())
}

/// Trait for phase-specific metrics collections
///
/// Each pipeline phase implements this trait to provide:
/// - Metric registration at startup
/// - Consistent naming conventions
/// - Documentation of what each metric measures
pub trait PhaseMetrics {
    /// Register all metrics for this phase
    fn register_metrics();

    /// Get the phase name for prefixing metrics
    fn phase_name() -> &'static str;

    /// Get documentation for all metrics in this phase
    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

/// Macro to create phase-specific metric names with consistent naming
///
/// ec_{phase}_{metric_name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("ec_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("ec_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
