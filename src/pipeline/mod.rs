// Order-export pipeline: ingestion, processing, storage and run reporting

pub mod ingestion;
pub mod orchestrator;
pub mod processing;
pub mod report;
pub mod storage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{MarketplaceConfig, PipelineConfig};
use crate::error::Result;
use processing::enrich::ReferenceTable;
use processing::mapping::{HeaderResolver, MappingCheck, MappingSpec};
use report::{DateCoverage, RunReport};
use storage::{CsvMasterStore, MasterStore};

pub use orchestrator::{BatchOrchestrator, RunOptions};

/// Everything one marketplace needs for a run, loaded from the run config.
pub struct MarketplacePipeline {
    pub market: MarketplaceConfig,
    pub spec: MappingSpec,
    pub references: HashMap<String, ReferenceTable>,
    pub store: CsvMasterStore,
}

impl MarketplacePipeline {
    pub fn load(config: &PipelineConfig, name: &str) -> Result<Self> {
        let market = config.marketplace(name)?.clone();
        let spec = MappingSpec::load(&config.mapping_path(&market))?;
        let references = load_references(config, &market)?;
        let store = CsvMasterStore::new(config.master_path(&market));
        Ok(Self {
            market,
            spec,
            references,
            store,
        })
    }

    /// Runs `inputs` (files, or directories of export files) through the pipeline.
    pub fn run(&self, inputs: &[PathBuf], options: RunOptions) -> Result<RunReport> {
        let files = ingestion::expand_inputs(inputs)?;
        BatchOrchestrator::new(&self.spec, &self.market.joins, &self.references, &self.store)
            .run(&files, options)
    }

    /// Validates the mapping and, given a sample export, compares its header row.
    pub fn check_mapping(&self, sample: Option<&Path>) -> Result<MappingCheck> {
        let resolver = HeaderResolver::new(&self.spec);
        match sample {
            Some(path) => {
                let table = ingestion::read_table(path, &self.spec)?;
                Ok(resolver.check(Some(&table.headers)))
            }
            None => Ok(resolver.check(None)),
        }
    }

    /// Date coverage of the published master table.
    pub fn coverage(&self) -> Result<Option<DateCoverage>> {
        let Some(field) = self.spec.order_date_field() else {
            warn!(marketplace = %self.spec.marketplace, "Mapping has no order date field");
            return Ok(None);
        };
        let records = self.store.load(&self.spec)?;
        Ok(Some(DateCoverage::compute(field, self.spec.declared(field), &records)))
    }
}

/// Loads the reference tables a marketplace joins against. A missing file is
/// left out of the map so its joins run blank.
pub fn load_references(
    config: &PipelineConfig,
    market: &MarketplaceConfig,
) -> Result<HashMap<String, ReferenceTable>> {
    let mut tables = HashMap::new();
    for join in &market.joins {
        if tables.contains_key(&join.reference) {
            continue;
        }
        let Some(reference) = config.references.get(&join.reference) else {
            continue;
        };
        let path = config.reference_path(reference);
        match ReferenceTable::load(&join.reference, &path, reference.records.as_deref(), &reference.key)? {
            Some(table) => {
                tables.insert(join.reference.clone(), table);
            }
            None => warn!(reference = %join.reference, path = %path.display(), "Reference file not found"),
        }
    }
    info!(marketplace = %market.name, loaded = tables.len(), "Reference tables ready");
    Ok(tables)
}
