use std::sync::Mutex;

use tracing::debug;

use super::csv_file::render_csv;
use super::{records_from_rows, MasterLock, MasterStore};
use crate::domain::CanonicalRecord;
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::content_digest;
use crate::pipeline::processing::mapping::MappingSpec;

#[derive(Debug, Clone, Default)]
struct Published {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    publishes: usize,
}

/// In-memory master store for development/testing
#[derive(Debug, Default)]
pub struct InMemoryMasterStore {
    table: Mutex<Option<Published>>,
}

impl InMemoryMasterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header and rows of the last publish.
    pub fn published(&self) -> Option<(Vec<String>, Vec<Vec<String>>)> {
        self.table
            .lock()
            .ok()?
            .as_ref()
            .map(|t| (t.header.clone(), t.rows.clone()))
    }

    pub fn publish_count(&self) -> usize {
        self.table
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|t| t.publishes))
            .unwrap_or(0)
    }
}

fn poisoned() -> PipelineError {
    PipelineError::Master("in-memory master store lock poisoned".to_string())
}

impl MasterStore for InMemoryMasterStore {
    fn lock(&self) -> Result<MasterLock> {
        Ok(MasterLock::in_process())
    }

    fn load(&self, spec: &MappingSpec) -> Result<Vec<CanonicalRecord>> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        match table.as_ref() {
            Some(t) => records_from_rows(spec, "memory", &t.header, &t.rows),
            None => Ok(Vec::new()),
        }
    }

    fn publish(&self, header: &[String], rows: &[Vec<String>]) -> Result<String> {
        let digest = content_digest(&render_csv(header, rows)?);
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        let publishes = table.as_ref().map(|t| t.publishes).unwrap_or(0) + 1;
        *table = Some(Published {
            header: header.to_vec(),
            rows: rows.to_vec(),
            publishes,
        });
        debug!(rows = rows.len(), publishes, "Published master table in memory");
        Ok(digest)
    }
}
