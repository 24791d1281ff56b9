/// Environment variable naming the run configuration file
pub const CONFIG_ENV_VAR: &str = "EC_PIPELINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Default tracing directive when RUST_LOG is unset
pub const DEFAULT_LOG_DIRECTIVE: &str = "ec_pipeline=info";
pub const LOG_FILE_PREFIX: &str = "pipeline.log";

/// Rejected rows kept verbatim in a run report; the rest are only counted
pub const REJECTION_SAMPLE_LIMIT: usize = 20;

/// Missing days listed in a coverage summary; longer gaps are only counted
pub const COVERAGE_MISSING_DAYS_LIMIT: usize = 62;

/// Timestamp used in report file names
pub const REPORT_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
