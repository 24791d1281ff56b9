use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::constants::{COVERAGE_MISSING_DAYS_LIMIT, REJECTION_SAMPLE_LIMIT, REPORT_TIMESTAMP_FORMAT};
use crate::domain::CanonicalRecord;
use crate::error::Result;
use crate::pipeline::processing::enrich::EnrichmentStats;
use crate::pipeline::processing::merge::MergeStats;
use crate::pipeline::processing::normalize::{RejectedRow, RowRejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Processed,
    /// Same bytes as a file already processed in this run
    DuplicateContent,
    /// A required field had no matching column
    Unresolved,
    Unreadable,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub source: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub rows_read: usize,
    pub records: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub duplicates: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unmatched_headers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn new(source: &str, status: FileStatus) -> Self {
        Self {
            source: source.to_string(),
            status,
            digest: None,
            rows_read: 0,
            records: 0,
            rejected: 0,
            skipped: 0,
            duplicates: 0,
            unmatched_headers: Vec::new(),
            missing_required: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectionSample {
    pub source: String,
    pub line: usize,
    #[serde(flatten)]
    pub reason: RowRejection,
}

/// Span of order dates held by a table and the calendar days inside it with no records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateCoverage {
    pub field: String,
    pub first: Option<NaiveDate>,
    pub last: Option<NaiveDate>,
    pub days_with_records: usize,
    /// Days between `first` and `last` with no records
    pub missing_day_count: usize,
    /// The earliest missing days, at most COVERAGE_MISSING_DAYS_LIMIT of them
    pub missing_days: Vec<NaiveDate>,
}

impl DateCoverage {
    pub fn compute(field: &str, idx: usize, records: &[CanonicalRecord]) -> Self {
        let days: BTreeSet<NaiveDate> = records.iter().filter_map(|r| r.get(idx).as_date()).collect();
        let first = days.iter().next().copied();
        let last = days.iter().next_back().copied();
        let (missing_day_count, missing_days) = match (first, last) {
            (Some(first), Some(last)) => {
                let span = (last - first).num_days() as usize + 1;
                let listed = first
                    .iter_days()
                    .take_while(|d| *d <= last)
                    .filter(|d| !days.contains(d))
                    .take(COVERAGE_MISSING_DAYS_LIMIT)
                    .collect();
                (span - days.len(), listed)
            }
            _ => (0, Vec::new()),
        };
        Self {
            field: field.to_string(),
            first,
            last,
            days_with_records: days.len(),
            missing_day_count,
            missing_days,
        }
    }
}

/// Everything one orchestrator run did, written as JSON next to the logs.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub marketplace: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub files: Vec<FileOutcome>,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub rows_skipped: usize,
    pub intra_batch_duplicates: usize,
    pub rejection_samples: Vec<RejectionSample>,
    pub merge: MergeStats,
    pub enrichment: Vec<EnrichmentStats>,
    pub missing_references: Vec<String>,
    pub coverage: Option<DateCoverage>,
    pub published: bool,
    pub master_digest: Option<String>,
}

impl RunReport {
    pub fn new(marketplace: &str, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            marketplace: marketplace.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            files: Vec::new(),
            rows_read: 0,
            rows_rejected: 0,
            rows_skipped: 0,
            intra_batch_duplicates: 0,
            rejection_samples: Vec::new(),
            merge: MergeStats::default(),
            enrichment: Vec::new(),
            missing_references: Vec::new(),
            coverage: None,
            published: false,
            master_digest: None,
        }
    }

    /// Counts rejected rows; keeps the first few verbatim.
    pub fn add_rejections(&mut self, source: &str, rejected: &[RejectedRow]) {
        self.rows_rejected += rejected.len();
        let room = REJECTION_SAMPLE_LIMIT.saturating_sub(self.rejection_samples.len());
        self.rejection_samples
            .extend(rejected.iter().take(room).map(|r| RejectionSample {
                source: source.to_string(),
                line: r.line,
                reason: r.reason.clone(),
            }));
    }

    pub fn enrichment_misses(&self) -> usize {
        self.enrichment.iter().map(|s| s.missed).sum()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Writes `<dir>/<marketplace>_<timestamp>.json` and returns its path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let stamp = self.started_at.format(REPORT_TIMESTAMP_FORMAT);
        let path = dir.join(format!("{}_{}.json", self.marketplace, stamp));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(report = %path.display(), "Wrote run report");
        Ok(path)
    }
}
