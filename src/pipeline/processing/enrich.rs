use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::CanonicalRecord;
use crate::error::{PipelineError, Result};
use crate::metrics::EnrichMetrics;
use crate::pipeline::processing::mapping::MappingSpec;

/// A master record with the descriptive columns appended by every join
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    /// The canonical record, untouched by enrichment
    pub record: CanonicalRecord,
    /// Values for `EnrichmentJoiner::columns`, blank on a miss
    pub enrichment: Vec<String>,
}

impl EnrichedRecord {
    pub fn render_row(&self) -> Vec<String> {
        let mut row = self.record.render_row();
        row.extend(self.enrichment.iter().cloned());
        row
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    /// Exact first, then the longest reference key that is a prefix of the
    /// source value or has the source value as its prefix
    Prefix,
}

/// One left outer join from a canonical field to a reference table.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinSpec {
    pub reference: String,
    pub source_field: String,
    /// Reference column matched against; defaults to the table's key
    #[serde(default)]
    pub reference_key: Option<String>,
    pub fields: Vec<String>,
    /// Prepended to each copied field name to form the output column
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// Externally maintained lookup data, read-only for the whole run.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    pub name: String,
    pub key: String,
    pub rows: Vec<HashMap<String, String>>,
}

impl ReferenceTable {
    /// Loads a JSON reference file. `Ok(None)` when the file does not exist.
    pub fn load(name: &str, path: &Path, records: Option<&str>, key: &str) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&content)?;
        let table = Self::from_json(name, value, records, key)?;
        info!(
            reference = %name,
            path = %path.display(),
            rows = table.rows.len(),
            "Loaded reference table"
        );
        Ok(Some(table))
    }

    /// Accepts a top-level array of objects, an array under `records`, or an
    /// object mapping key to row.
    pub fn from_json(name: &str, value: Value, records: Option<&str>, key: &str) -> Result<Self> {
        let body = match records {
            Some(field) => value.get(field).cloned().ok_or_else(|| {
                PipelineError::Config(format!("reference '{}' has no '{}' member", name, field))
            })?,
            None => value,
        };

        let rows = match body {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(flatten_row(map)),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => map
                .into_iter()
                .filter_map(|(k, item)| match item {
                    Value::Object(fields) => {
                        let mut row = flatten_row(fields);
                        row.entry(key.to_string()).or_insert(k);
                        Some(row)
                    }
                    _ => None,
                })
                .collect(),
            _ => {
                return Err(PipelineError::Config(format!(
                    "reference '{}' is neither an array nor an object of rows",
                    name
                )))
            }
        };

        Ok(Self {
            name: name.to_string(),
            key: key.to_string(),
            rows,
        })
    }
}

fn flatten_row(map: serde_json::Map<String, Value>) -> HashMap<String, String> {
    map.into_iter()
        .map(|(k, v)| {
            let text = match v {
                Value::Null => String::new(),
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            (k, text)
        })
        .collect()
}

/// Adds descriptive columns to a record. `None` means no reference row matched.
pub trait Enricher {
    fn columns(&self) -> Vec<String>;
    fn enrich(&self, record: &CanonicalRecord) -> Option<Vec<String>>;
}

/// Enricher backed by one ReferenceTable.
pub struct ReferenceJoin<'t> {
    spec: JoinSpec,
    source: usize,
    table: Option<&'t ReferenceTable>,
    exact: HashMap<String, usize>,
    /// (key, row) sorted longest key first, for prefix matching
    by_length: Vec<(String, usize)>,
}

impl<'t> ReferenceJoin<'t> {
    pub fn new(
        mapping: &MappingSpec,
        spec: JoinSpec,
        table: Option<&'t ReferenceTable>,
    ) -> Result<Self> {
        let source = mapping.index_of(&spec.source_field).ok_or_else(|| {
            PipelineError::Config(format!(
                "join on '{}' uses undeclared field '{}'",
                spec.reference, spec.source_field
            ))
        })?;

        let mut exact = HashMap::new();
        if let Some(table) = table {
            let key_column = spec.reference_key.as_deref().unwrap_or(&table.key);
            for (row_idx, row) in table.rows.iter().enumerate() {
                let Some(raw) = row.get(key_column) else {
                    continue;
                };
                let key = match_form(raw, spec.case_insensitive);
                if key.is_empty() {
                    continue;
                }
                if exact.contains_key(&key) {
                    warn!(reference = %table.name, key = %raw, "Duplicate reference key, keeping first row");
                    continue;
                }
                exact.insert(key, row_idx);
            }
        }
        let mut by_length: Vec<(String, usize)> = exact.iter().map(|(k, v)| (k.clone(), *v)).collect();
        by_length.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then(a.1.cmp(&b.1)));

        Ok(Self {
            spec,
            source,
            table,
            exact,
            by_length,
        })
    }

    pub fn reference(&self) -> &str {
        &self.spec.reference
    }

    pub fn is_missing(&self) -> bool {
        self.table.is_none()
    }

    fn find_row(&self, value: &str) -> Option<usize> {
        let probe = match_form(value, self.spec.case_insensitive);
        if probe.is_empty() {
            return None;
        }
        if let Some(&row) = self.exact.get(&probe) {
            return Some(row);
        }
        match self.spec.match_mode {
            MatchMode::Exact => None,
            MatchMode::Prefix => self
                .by_length
                .iter()
                .find(|(key, _)| probe.starts_with(key.as_str()) || key.starts_with(probe.as_str()))
                .map(|(_, row)| *row),
        }
    }
}

fn match_form(raw: &str, case_insensitive: bool) -> String {
    let trimmed = raw.trim();
    if case_insensitive {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

impl Enricher for ReferenceJoin<'_> {
    fn columns(&self) -> Vec<String> {
        self.spec
            .fields
            .iter()
            .map(|f| format!("{}{}", self.spec.prefix, f))
            .collect()
    }

    fn enrich(&self, record: &CanonicalRecord) -> Option<Vec<String>> {
        let table = self.table?;
        let row = &table.rows[self.find_row(&record.get(self.source).render())?];
        Some(
            self.spec
                .fields
                .iter()
                .map(|f| row.get(f).cloned().unwrap_or_default())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    pub reference: String,
    pub matched: usize,
    pub missed: usize,
    /// The whole reference table was unavailable
    pub reference_missing: bool,
}

/// Runs every configured join over the master table as a left outer join.
pub struct EnrichmentJoiner<'t> {
    joins: Vec<ReferenceJoin<'t>>,
}

impl<'t> EnrichmentJoiner<'t> {
    pub fn new(
        mapping: &MappingSpec,
        specs: &[JoinSpec],
        tables: &'t HashMap<String, ReferenceTable>,
    ) -> Result<Self> {
        let joins = specs
            .iter()
            .map(|spec| {
                let table = tables.get(&spec.reference);
                if table.is_none() {
                    warn!(reference = %spec.reference, "Reference table unavailable, its columns stay blank");
                }
                ReferenceJoin::new(mapping, spec.clone(), table)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { joins })
    }

    pub fn columns(&self) -> Vec<String> {
        self.joins.iter().flat_map(|j| j.columns()).collect()
    }

    pub fn enrich(&self, records: Vec<CanonicalRecord>) -> (Vec<EnrichedRecord>, Vec<EnrichmentStats>) {
        let mut stats: Vec<EnrichmentStats> = self
            .joins
            .iter()
            .map(|j| EnrichmentStats {
                reference: j.reference().to_string(),
                reference_missing: j.is_missing(),
                ..Default::default()
            })
            .collect();

        let enriched = records
            .into_iter()
            .map(|record| {
                let mut enrichment = Vec::new();
                for (join, stat) in self.joins.iter().zip(stats.iter_mut()) {
                    match join.enrich(&record) {
                        Some(values) => {
                            stat.matched += 1;
                            enrichment.extend(values);
                        }
                        None => {
                            stat.missed += 1;
                            enrichment.extend(std::iter::repeat(String::new()).take(join.spec.fields.len()));
                        }
                    }
                }
                EnrichedRecord { record, enrichment }
            })
            .collect();

        for stat in &stats {
            debug!(reference = %stat.reference, matched = stat.matched, missed = stat.missed, "Join finished");
            EnrichMetrics::record_join(stat.matched, stat.missed, stat.reference_missing);
        }
        (enriched, stats)
    }
}
