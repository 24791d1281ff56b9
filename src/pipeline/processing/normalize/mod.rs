//! Record normalization: raw rows to structurally complete CanonicalRecords.
//!
//! Steps run in a fixed order so later ones can rely on earlier derived
//! fields: copy and coerce mapped cells, constants, values from the file
//! name, the order date prefix, calendar fields, sub-identifiers, item
//! sequence, then defaults.

pub mod coerce;
pub mod derive;

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{CanonicalRecord, FieldValue, RawRecord, RawTable};
use crate::metrics::NormalizeMetrics;
use crate::pipeline::processing::mapping::resolver::ResolvedHeader;
use crate::pipeline::processing::mapping::{normalize_label, FieldSpec, MappingSpec};

pub use derive::Derivations;

/// Why a single row produced no record. Rejections are aggregated into the
/// run report and never abort the batch.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowRejection {
    #[error("field '{field}' could not be coerced from '{value}': {reason}")]
    Coercion {
        field: String,
        value: String,
        reason: String,
    },

    #[error("required field '{field}' is blank")]
    MissingRequired { field: String },

    #[error("business key field '{field}' is blank")]
    MissingKey { field: String },
}

/// Outcome of normalizing one raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(CanonicalRecord),
    /// Blank line or repeated header; not data
    Skipped,
    Rejected(RowRejection),
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedRow {
    pub line: usize,
    #[serde(flatten)]
    pub reason: RowRejection,
}

/// Normalized output of one input file.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub source: String,
    pub records: Vec<CanonicalRecord>,
    /// Source line of each record, parallel to `records`
    pub lines: Vec<usize>,
    pub rows_read: usize,
    pub skipped: usize,
    pub rejected: Vec<RejectedRow>,
    /// Non-required cells that failed coercion and took their default
    pub fallbacks: usize,
}

/// Normalizes the rows of one batch. Holds the per-order counters behind the
/// derived item sequence, so one instance covers exactly one batch.
pub struct RecordNormalizer<'a> {
    spec: &'a MappingSpec,
    header: &'a ResolvedHeader,
    header_labels: Vec<String>,
    defaults: Vec<FieldValue>,
    constants: Vec<Option<FieldValue>>,
    from_file: Vec<(usize, FieldValue)>,
    derivations: Derivations<'a>,
    emitted_per_order: HashMap<String, usize>,
    fallbacks: usize,
}

impl<'a> RecordNormalizer<'a> {
    /// `source` is the path of the file the rows came from; its file name feeds
    /// the `source_file` derivation.
    pub fn new(
        spec: &'a MappingSpec,
        header: &'a ResolvedHeader,
        headers: &[String],
        source: &str,
    ) -> Self {
        // literals were validated when the mapping loaded
        let defaults = spec
            .fields
            .iter()
            .map(|f| coerce::default_value(f, &spec.number_format).unwrap_or(FieldValue::Blank))
            .collect();
        let constants = spec
            .fields
            .iter()
            .map(|f: &FieldSpec| {
                f.constant.as_ref().and_then(|raw| {
                    coerce::coerce(f, &coerce::clean_cell(raw), &spec.number_format).ok()
                })
            })
            .collect();
        let derivations = Derivations::new(spec);
        let file_name = Path::new(source)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(source);
        let from_file = derivations.source_file_values(file_name);

        Self {
            spec,
            header,
            header_labels: headers.iter().map(|h| normalize_label(h)).collect(),
            defaults,
            constants,
            from_file,
            derivations,
            emitted_per_order: HashMap::new(),
            fallbacks: 0,
        }
    }

    pub fn normalize(&mut self, raw: &RawRecord) -> RowOutcome {
        let cells: Vec<String> = raw.cells.iter().map(|c| coerce::clean_cell(c)).collect();
        if self.is_artefact(&cells) {
            return RowOutcome::Skipped;
        }

        let mut record = CanonicalRecord::blank(self.spec.width());

        for (col, target) in self.header.columns.iter().enumerate() {
            let Some(idx) = *target else {
                continue;
            };
            let cell = cells.get(col).map(String::as_str).unwrap_or("");
            let field = &self.spec.fields[idx];
            match coerce::coerce(field, cell, &self.spec.number_format) {
                Ok(value) => record.set(idx, value),
                Err(reason) if field.required => {
                    return RowOutcome::Rejected(RowRejection::Coercion {
                        field: field.name.clone(),
                        value: cell.to_string(),
                        reason,
                    });
                }
                Err(reason) => {
                    debug!(line = raw.line, field = %field.name, %reason, "Falling back to default");
                    self.fallbacks += 1;
                }
            }
        }
        for (idx, constant) in self.constants.iter().enumerate() {
            if let Some(value) = constant {
                record.set(idx, value.clone());
            }
        }
        for (idx, value) in &self.from_file {
            if record.get(*idx).is_blank() {
                record.set(*idx, value.clone());
            }
        }

        self.derivations.apply_date_prefix(&mut record);
        self.derivations.apply_calendar(&mut record);
        self.derivations.apply_sub_identifiers(&mut record);
        let order = self.derivations.item_seq_order(&record);
        if let Some(order) = &order {
            let emitted = self.emitted_per_order.get(order).copied().unwrap_or(0);
            self.derivations.apply_item_seq(&mut record, emitted);
        }

        for (idx, default) in self.defaults.iter().enumerate() {
            if record.get(idx).is_blank() && !default.is_blank() {
                record.set(idx, default.clone());
            }
        }
        if let Some(field) = self
            .spec
            .fields
            .iter()
            .enumerate()
            .find(|(idx, f)| f.required && record.get(*idx).is_blank())
            .map(|(_, f)| f)
        {
            return RowOutcome::Rejected(RowRejection::MissingRequired {
                field: field.name.clone(),
            });
        }

        if let Some(order) = order {
            *self.emitted_per_order.entry(order).or_insert(0) += 1;
        }
        RowOutcome::Record(record)
    }

    /// Blank rows and header rows repeated inside the data.
    fn is_artefact(&self, cells: &[String]) -> bool {
        if cells.iter().all(|c| c.is_empty()) {
            return true;
        }
        let mut matched_header = false;
        for (col, cell) in cells.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            match self.header_labels.get(col) {
                Some(label) if *label == normalize_label(cell) => matched_header = true,
                _ => return false,
            }
        }
        matched_header
    }

    pub fn fallbacks(&self) -> usize {
        self.fallbacks
    }
}

/// Normalizes every row of a parsed file under a resolved header.
pub fn normalize_table(
    spec: &MappingSpec,
    header: &ResolvedHeader,
    table: &RawTable,
) -> NormalizedBatch {
    let started = Instant::now();
    let mut normalizer = RecordNormalizer::new(spec, header, &table.headers, &table.source);
    let mut batch = NormalizedBatch {
        source: table.source.clone(),
        rows_read: table.rows.len(),
        ..Default::default()
    };

    for raw in &table.rows {
        match normalizer.normalize(raw) {
            RowOutcome::Record(record) => {
                batch.records.push(record);
                batch.lines.push(raw.line);
            }
            RowOutcome::Skipped => batch.skipped += 1,
            RowOutcome::Rejected(reason) => {
                warn!(source = %table.source, line = raw.line, %reason, "Row rejected");
                batch.rejected.push(RejectedRow {
                    line: raw.line,
                    reason,
                });
            }
        }
    }
    batch.fallbacks = normalizer.fallbacks();

    NormalizeMetrics::record_batch(
        batch.rows_read,
        batch.records.len(),
        batch.rejected.len(),
        batch.skipped,
        started.elapsed().as_secs_f64(),
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::mapping::tests::pchome_spec;
    use crate::pipeline::processing::mapping::HeaderResolver;

    const HEADERS: [&str; 7] = ["訂單編號", "NO", "商品名稱", "數量", "單價", "確認狀態", "郵遞區號"];

    fn table(rows: &[[&str; 7]]) -> RawTable {
        RawTable {
            source: "orders.tsv".to_string(),
            headers: HEADERS.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .enumerate()
                .map(|(i, cells)| RawRecord {
                    line: i + 3,
                    cells: cells.iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
            digest: String::new(),
        }
    }

    fn run(rows: &[[&str; 7]]) -> (MappingSpec, NormalizedBatch) {
        let spec = pchome_spec();
        let t = table(rows);
        let header = HeaderResolver::new(&spec).resolve(&t.source, &t.headers).unwrap();
        let batch = normalize_table(&spec, &header, &t);
        (spec, batch)
    }

    fn value<'r>(spec: &MappingSpec, record: &'r CanonicalRecord, name: &str) -> &'r FieldValue {
        record.get(spec.index_of(name).unwrap())
    }

    #[test]
    fn test_every_record_has_every_field() {
        let (spec, batch) = run(&[
            ["20240107000001", "1", "Mug (DGAB01-A900-1)", "2", "350", "已確認", "10491"],
            ["20240107000002", "", "", "1", "", "", ""],
        ]);
        assert_eq!(batch.records.len(), 2);
        for record in &batch.records {
            assert_eq!(record.width(), spec.width());
        }
        let first = &batch.records[0];
        assert_eq!(value(&spec, first, "platform"), &FieldValue::Text("pchome".to_string()));
        assert_eq!(value(&spec, first, "quantity"), &FieldValue::Integer(2));
        assert_eq!(value(&spec, first, "price_unit"), &FieldValue::Decimal(350.0));
        assert_eq!(value(&spec, first, "confirm"), &FieldValue::Bool(true));
        assert_eq!(value(&spec, first, "receiver_zip"), &FieldValue::Text("104".to_string()));
        assert_eq!(value(&spec, first, "order_weekday"), &FieldValue::Integer(1));
        assert_eq!(value(&spec, first, "sku_option"), &FieldValue::Text("001".to_string()));
        assert!(value(&spec, &batch.records[1], "price_unit").is_blank());
    }

    #[test]
    fn test_item_seq_counts_per_order_when_absent() {
        let (spec, batch) = run(&[
            ["20240107000001", "", "", "1", "", "", ""],
            ["20240107000002", "", "", "1", "", "", ""],
            ["20240107000001", "", "", "1", "", "", ""],
            ["20240107000001", "7", "", "1", "", "", ""],
            ["20240107000001", "", "", "1", "", "", ""],
        ]);
        let seqs: Vec<String> = batch
            .records
            .iter()
            .map(|r| value(&spec, r, "item_seq").render())
            .collect();
        assert_eq!(seqs, vec!["01", "01", "02", "07", "04"]);
    }

    #[test]
    fn test_file_name_fills_blank_fields_before_defaults() {
        let mut raw = crate::pipeline::processing::mapping::tests::pchome_spec_json();
        let fields = raw["fields"].as_array_mut().unwrap();
        fields.push(serde_json::json!({ "name": "shop_name", "aliases": ["賣場"], "default": "unknown_shop" }));
        fields.push(serde_json::json!({ "name": "shop_account", "default": "unknown_account" }));
        raw["derive"]["source_file"] = serde_json::json!({
            "pattern": "^(.+?)_([\\w\\d]+)_Order",
            "targets": [
                { "field": "shop_name", "group": 1 },
                { "field": "shop_account", "group": 2 }
            ]
        });
        let spec = MappingSpec::from_json_str(&raw.to_string()).unwrap();
        let headers: Vec<String> = ["訂單編號", "數量", "賣場"].iter().map(|s| s.to_string()).collect();
        let header = HeaderResolver::new(&spec).resolve("x", &headers).unwrap();
        let rows = vec![
            RawRecord { line: 2, cells: vec!["20240107000001".into(), "1".into(), "".into()] },
            RawRecord { line: 3, cells: vec!["20240107000002".into(), "1".into(), "Outlet".into()] },
        ];

        let named = RawTable {
            source: "/exports/MainStore_twmain01_Order.all.20240101_20240107.csv".to_string(),
            headers: headers.clone(),
            rows: rows.clone(),
            digest: String::new(),
        };
        let batch = normalize_table(&spec, &header, &named);
        let names: Vec<String> = batch.records.iter().map(|r| value(&spec, r, "shop_name").render()).collect();
        assert_eq!(names, vec!["MainStore", "Outlet"]);
        assert_eq!(value(&spec, &batch.records[0], "shop_account").render(), "twmain01");

        let unnamed = RawTable {
            source: "/exports/orders.csv".to_string(),
            headers,
            rows,
            digest: String::new(),
        };
        let batch = normalize_table(&spec, &header, &unnamed);
        assert_eq!(value(&spec, &batch.records[0], "shop_name").render(), "unknown_shop");
        assert_eq!(value(&spec, &batch.records[0], "shop_account").render(), "unknown_account");
    }

    #[test]
    fn test_required_coercion_failure_rejects_row() {
        let (_, batch) = run(&[
            ["20240107000001", "1", "", "two", "", "", ""],
            ["20240107000001", "2", "", "1", "abc", "", ""],
        ]);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.fallbacks, 1);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].line, 3);
        assert!(matches!(
            &batch.rejected[0].reason,
            RowRejection::Coercion { field, .. } if field == "quantity"
        ));
    }

    #[test]
    fn test_blank_required_value_rejects_row() {
        let (_, batch) = run(&[["", "1", "", "3", "", "", ""]]);
        assert_eq!(
            batch.rejected[0].reason,
            RowRejection::MissingRequired {
                field: "order_sn".to_string()
            }
        );
    }

    #[test]
    fn test_blank_and_repeated_header_rows_skipped() {
        let (_, batch) = run(&[
            ["", "", "", "", "", "", ""],
            ["訂單編號", "NO", "商品名稱", "數量", "單價", "確認狀態", "郵遞區號"],
            ["=\"20240107000001\"", "1", "", "1", "", "", ""],
        ]);
        assert_eq!(batch.rows_read, 3);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.records.len(), 1);
        assert!(batch.rejected.is_empty());
    }
}
