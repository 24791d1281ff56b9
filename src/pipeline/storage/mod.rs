// Pipeline storage: the persisted master table of one marketplace

pub mod csv_file;
pub mod in_memory;

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::CanonicalRecord;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::mapping::MappingSpec;
use crate::pipeline::processing::normalize::coerce::parse_stored;

pub use csv_file::CsvMasterStore;
pub use in_memory::InMemoryMasterStore;

/// Durable home of a MasterTable. One writer at a time; a publish replaces
/// the previous table in a single step or not at all.
pub trait MasterStore {
    /// Takes the single-writer lock for the table.
    fn lock(&self) -> Result<MasterLock>;

    /// Canonical records of the currently published table, empty if none.
    fn load(&self, spec: &MappingSpec) -> Result<Vec<CanonicalRecord>>;

    /// Replaces the published table. Returns the hex SHA-256 of its content.
    fn publish(&self, header: &[String], rows: &[Vec<String>]) -> Result<String>;
}

/// Lock file held for the duration of a run, removed on drop.
#[derive(Debug)]
pub struct MasterLock {
    path: Option<PathBuf>,
}

impl MasterLock {
    pub fn acquire(master: &Path) -> Result<Self> {
        let mut name = master.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!(lock = %path.display(), "Acquired master lock");
                Ok(Self { path: Some(path) })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .and_then(|pid| pid.trim().parse().ok());
                Err(PipelineError::Locked { path, holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A lock with nothing behind it, for stores that live in one process.
    pub fn in_process() -> Self {
        Self { path: None }
    }
}

impl Drop for MasterLock {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = fs::remove_file(path) {
                warn!(lock = %path.display(), error = %e, "Failed to remove master lock");
            }
        }
    }
}

/// Rebuilds canonical records from a stored table. Columns are matched by
/// canonical name; enrichment columns are ignored and fields missing from
/// the stored header come back blank.
pub fn records_from_rows(
    spec: &MappingSpec,
    origin: &str,
    header: &[String],
    rows: &[Vec<String>],
) -> Result<Vec<CanonicalRecord>> {
    let positions: Vec<Option<usize>> = spec
        .fields
        .iter()
        .map(|f| header.iter().position(|h| *h == f.name))
        .collect();

    let mut records = Vec::with_capacity(rows.len());
    for (row_idx, row) in rows.iter().enumerate() {
        let mut record = CanonicalRecord::blank(spec.width());
        for (field_idx, (field, col)) in spec.fields.iter().zip(&positions).enumerate() {
            let Some(col) = col else {
                continue;
            };
            let cell = row.get(*col).map(String::as_str).unwrap_or("");
            let value = parse_stored(field.field_type, cell).map_err(|reason| {
                PipelineError::Master(format!(
                    "{} row {} field '{}': {}",
                    origin,
                    row_idx + 1,
                    field.name,
                    reason
                ))
            })?;
            record.set(field_idx, value);
        }
        records.push(record);
    }
    Ok(records)
}
