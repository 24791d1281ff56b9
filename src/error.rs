use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid mapping spec: {0}")]
    Mapping(String),

    #[error("Master table unreadable: {0}")]
    Master(String),

    #[error("Input file {0} has no header row")]
    EmptyInput(String),

    #[error(transparent)]
    UnresolvedColumn(#[from] UnresolvedColumnError),

    #[error(transparent)]
    MergeIntegrity(#[from] MergeIntegrityError),

    #[error(
        "Master table is locked by {}: {}; if no run is active, remove this stale lock file",
        lock_holder(holder),
        path.display()
    )]
    Locked { path: PathBuf, holder: Option<u32> },
}

fn lock_holder(holder: &Option<u32>) -> String {
    match holder {
        Some(pid) => format!("another run (pid {})", pid),
        None => "another run".to_string(),
    }
}

/// A required canonical field has no matching source column.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "unresolved columns in {file}: missing required {missing_required:?}, unmatched headers {unmatched_headers:?}"
)]
pub struct UnresolvedColumnError {
    pub file: String,
    pub missing_required: Vec<String>,
    pub unmatched_headers: Vec<String>,
}

/// The merged master table would hold the same business key more than once.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("merge integrity violated: {} duplicate business key(s), e.g. {:?}", duplicates.len(), duplicates.first())]
pub struct MergeIntegrityError {
    pub duplicates: Vec<String>,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
