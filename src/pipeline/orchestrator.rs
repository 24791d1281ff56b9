use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{error, info, instrument, warn};

use crate::error::{PipelineError, Result};
use crate::metrics::{IngestMetrics, MergeMetrics};
use crate::pipeline::ingestion::{self, content_digest};
use crate::pipeline::processing::enrich::{EnrichmentJoiner, JoinSpec, ReferenceTable};
use crate::pipeline::processing::mapping::{HeaderResolver, MappingSpec};
use crate::pipeline::processing::merge::{KeyedBatch, Merger};
use crate::pipeline::processing::normalize::normalize_table;
use crate::pipeline::report::{DateCoverage, FileOutcome, FileStatus, RunReport};
use crate::pipeline::storage::csv_file::render_csv;
use crate::pipeline::storage::MasterStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run every stage but leave the published master table alone
    pub dry_run: bool,
}

/// Runs one marketplace's inputs through resolve, normalize, key, merge and
/// enrich, then publishes the master table. Holds the store's writer lock for
/// the whole run.
pub struct BatchOrchestrator<'a, S: MasterStore> {
    spec: &'a MappingSpec,
    joins: &'a [JoinSpec],
    references: &'a HashMap<String, ReferenceTable>,
    store: &'a S,
}

impl<'a, S: MasterStore> BatchOrchestrator<'a, S> {
    pub fn new(
        spec: &'a MappingSpec,
        joins: &'a [JoinSpec],
        references: &'a HashMap<String, ReferenceTable>,
        store: &'a S,
    ) -> Self {
        Self {
            spec,
            joins,
            references,
            store,
        }
    }

    /// Processes `inputs` in the given order; a later file wins over an
    /// earlier one for the same business key. File and row problems are
    /// recorded in the report; integrity and storage failures abort the run
    /// with the published table untouched.
    #[instrument(skip(self, inputs), fields(marketplace = %self.spec.marketplace, files = inputs.len()))]
    pub fn run(&self, inputs: &[PathBuf], options: RunOptions) -> Result<RunReport> {
        let mut report = RunReport::new(&self.spec.marketplace, options.dry_run);
        let _lock = self.store.lock()?;

        // built before any work so a bad join fails the run early
        let joiner = EnrichmentJoiner::new(self.spec, self.joins, self.references)?;
        let merger = Merger::new(self.spec);
        let master = self.store.load(self.spec)?;
        info!(prior_records = master.len(), "Loaded prior master table");

        let batches = self.ingest(inputs, &merger, &mut report);

        let outcome = merger.merge(master, &batches).map_err(|e| {
            error!(error = %e, "Merge integrity violated, master table left unchanged");
            PipelineError::from(e)
        })?;
        report.merge = outcome.stats;

        if let Some(field) = self.spec.order_date_field() {
            let idx = self.spec.declared(field);
            report.coverage = Some(DateCoverage::compute(field, idx, &outcome.records));
        }

        let (enriched, stats) = joiner.enrich(outcome.records);
        report.missing_references = stats
            .iter()
            .filter(|s| s.reference_missing)
            .map(|s| s.reference.clone())
            .collect();
        report.enrichment = stats;

        let mut header: Vec<String> = self.spec.field_names().into_iter().map(str::to_string).collect();
        header.extend(joiner.columns());
        let rows: Vec<Vec<String>> = enriched.iter().map(|r| r.render_row()).collect();

        if options.dry_run {
            report.master_digest = Some(content_digest(&render_csv(&header, &rows)?));
            info!(records = rows.len(), "Dry run, master table not published");
        } else {
            report.master_digest = Some(self.store.publish(&header, &rows)?);
            report.published = true;
            MergeMetrics::record_publish();
        }

        report.finish();
        info!(
            rows_read = report.rows_read,
            rows_rejected = report.rows_rejected,
            keys_added = report.merge.added,
            keys_overwritten = report.merge.overwritten,
            keys_unchanged = report.merge.unchanged,
            enrichment_misses = report.enrichment_misses(),
            "Run complete"
        );
        Ok(report)
    }

    /// Reads, resolves, normalizes and keys each input. Files that cannot be
    /// used are recorded and skipped.
    fn ingest(&self, inputs: &[PathBuf], merger: &Merger, report: &mut RunReport) -> Vec<KeyedBatch> {
        let resolver = HeaderResolver::new(self.spec);
        let mut seen_digests: HashSet<String> = HashSet::new();
        let mut batches = Vec::new();

        for path in inputs {
            let source = path.display().to_string();
            let table = match ingestion::read_table(path, self.spec) {
                Ok(table) => table,
                Err(e) => {
                    warn!(source = %source, error = %e, "Skipping unreadable input");
                    IngestMetrics::record_file_failed();
                    let mut outcome = FileOutcome::new(&source, FileStatus::Unreadable);
                    outcome.error = Some(e.to_string());
                    report.files.push(outcome);
                    continue;
                }
            };

            if !seen_digests.insert(table.digest.clone()) {
                warn!(source = %source, digest = %table.digest, "Skipping input with content already processed");
                IngestMetrics::record_duplicate_skipped();
                let mut outcome = FileOutcome::new(&source, FileStatus::DuplicateContent);
                outcome.digest = Some(table.digest);
                report.files.push(outcome);
                continue;
            }

            let header = match resolver.resolve(&source, &table.headers) {
                Ok(header) => header,
                Err(e) => {
                    warn!(source = %source, missing = ?e.missing_required, "Skipping input with unresolved columns");
                    IngestMetrics::record_file_failed();
                    let mut outcome = FileOutcome::new(&source, FileStatus::Unresolved);
                    outcome.digest = Some(table.digest.clone());
                    outcome.rows_read = table.rows.len();
                    outcome.error = Some(e.to_string());
                    outcome.missing_required = e.missing_required;
                    outcome.unmatched_headers = e.unmatched_headers;
                    report.rows_read += table.rows.len();
                    report.files.push(outcome);
                    continue;
                }
            };

            let normalized = normalize_table(self.spec, &header, &table);
            let mut outcome = FileOutcome::new(&source, FileStatus::Processed);
            outcome.digest = Some(table.digest.clone());
            outcome.rows_read = normalized.rows_read;
            outcome.skipped = normalized.skipped;
            outcome.unmatched_headers = header.unmatched.clone();
            report.rows_read += normalized.rows_read;
            report.rows_skipped += normalized.skipped;
            report.add_rejections(&source, &normalized.rejected);
            let normalize_rejected = normalized.rejected.len();

            let keyed = merger.key_batch(normalized);
            report.add_rejections(&source, &keyed.rejected);
            report.intra_batch_duplicates += keyed.duplicates;
            outcome.rejected = normalize_rejected + keyed.rejected.len();
            outcome.duplicates = keyed.duplicates;
            outcome.records = keyed.records.len();

            info!(
                source = %source,
                rows = outcome.rows_read,
                records = outcome.records,
                rejected = outcome.rejected,
                skipped = outcome.skipped,
                "Input normalized"
            );
            report.files.push(outcome);
            batches.push(keyed);
        }
        batches
    }
}
