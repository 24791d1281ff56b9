use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::info;

use super::{records_from_rows, MasterLock, MasterStore};
use crate::domain::CanonicalRecord;
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::content_digest;
use crate::pipeline::processing::mapping::MappingSpec;

/// MasterTable persisted as a UTF-8 CSV file.
#[derive(Debug, Clone)]
pub struct CsvMasterStore {
    path: PathBuf,
}

impl CsvMasterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Renders a table to CSV bytes.
pub fn render_csv(header: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))
}

impl MasterStore for CsvMasterStore {
    fn lock(&self) -> Result<MasterLock> {
        MasterLock::acquire(&self.path)
    }

    fn load(&self, spec: &MappingSpec) -> Result<Vec<CanonicalRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(master = %self.path.display(), "No published master yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|r| r.map(|r| r.iter().map(str::to_string).collect::<Vec<String>>()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let records = records_from_rows(spec, &self.path.display().to_string(), &header, &rows)?;
        info!(master = %self.path.display(), records = records.len(), "Loaded master table");
        Ok(records)
    }

    fn publish(&self, header: &[String], rows: &[Vec<String>]) -> Result<String> {
        let bytes = render_csv(header, rows)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // same directory so the final rename never crosses filesystems
        let mut staged = NamedTempFile::new_in(&dir)?;
        staged.write_all(&bytes)?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|e| PipelineError::Io(e.error))?;

        let digest = content_digest(&bytes);
        info!(
            master = %self.path.display(),
            rows = rows.len(),
            digest = %digest,
            "Published master table"
        );
        Ok(digest)
    }
}
