//! Folding normalized batches into the accumulated master table.
//!
//! Batches are applied in the order given. A key supplied by a later batch
//! replaces whatever an earlier batch or the prior master held for it; the
//! record's own dates are never consulted.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{BusinessKey, CanonicalRecord};
use crate::error::MergeIntegrityError;
use crate::metrics::MergeMetrics;
use crate::pipeline::processing::keys::KeyDeriver;
use crate::pipeline::processing::mapping::MappingSpec;
use crate::pipeline::processing::normalize::{NormalizedBatch, RejectedRow, RowRejection};

/// One batch with business keys attached, deduplicated internally
/// (the last occurrence of a key within the batch wins).
#[derive(Debug, Clone, Default)]
pub struct KeyedBatch {
    pub source: String,
    pub records: Vec<(BusinessKey, CanonicalRecord)>,
    /// Rows superseded by a later row of the same batch
    pub duplicates: usize,
    /// Rows whose key could not be derived
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub added: usize,
    pub overwritten: usize,
    pub unchanged: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Master records in publish order
    pub records: Vec<CanonicalRecord>,
    pub stats: MergeStats,
}

pub struct Merger {
    deriver: KeyDeriver,
    sort_fields: Vec<usize>,
    sequence: Option<usize>,
}

impl Merger {
    pub fn new(spec: &MappingSpec) -> Self {
        Self {
            deriver: KeyDeriver::new(spec),
            sort_fields: spec.sort.fields.iter().map(|f| spec.declared(f)).collect(),
            sequence: spec.sort.sequence.as_deref().map(|f| spec.declared(f)),
        }
    }

    /// Derives keys for a normalized batch and collapses repeated keys.
    pub fn key_batch(&self, batch: NormalizedBatch) -> KeyedBatch {
        let mut keyed = KeyedBatch {
            source: batch.source,
            ..Default::default()
        };
        let mut positions: HashMap<BusinessKey, usize> = HashMap::new();

        for (record, line) in batch.records.into_iter().zip(batch.lines) {
            let key = match self.deriver.derive(&record) {
                Ok(key) => key,
                Err(reason) => {
                    keyed.rejected.push(RejectedRow { line, reason });
                    continue;
                }
            };
            match positions.get(&key) {
                Some(&pos) => {
                    debug!(source = %keyed.source, %key, line, "Later row supersedes earlier row in batch");
                    keyed.records[pos].1 = record;
                    keyed.duplicates += 1;
                }
                None => {
                    positions.insert(key.clone(), keyed.records.len());
                    keyed.records.push((key, record));
                }
            }
        }
        keyed
    }

    /// Applies `batches` in order over `master`. Fails without producing a
    /// table when the prior master or the result holds a key more than once.
    pub fn merge(
        &self,
        master: Vec<CanonicalRecord>,
        batches: &[KeyedBatch],
    ) -> Result<MergeOutcome, MergeIntegrityError> {
        let started = Instant::now();
        let mut table: BTreeMap<BusinessKey, CanonicalRecord> = BTreeMap::new();
        let mut problems = Vec::new();

        for record in master {
            match self.deriver.derive(&record) {
                Ok(key) => {
                    if let Some(previous) = table.insert(key.clone(), record) {
                        table.insert(key.clone(), previous);
                        problems.push(key.to_string());
                    }
                }
                Err(RowRejection::MissingKey { field }) => {
                    problems.push(format!("<blank {}>", field))
                }
                Err(other) => problems.push(other.to_string()),
            }
        }
        if !problems.is_empty() {
            return Err(MergeIntegrityError { duplicates: problems });
        }

        let prior_count = table.len();
        let mut added: HashSet<BusinessKey> = HashSet::new();
        let mut replaced: HashMap<BusinessKey, CanonicalRecord> = HashMap::new();

        for batch in batches {
            for (key, record) in &batch.records {
                match table.insert(key.clone(), record.clone()) {
                    None => {
                        added.insert(key.clone());
                    }
                    Some(previous) => {
                        if !added.contains(key) && !replaced.contains_key(key) {
                            replaced.insert(key.clone(), previous);
                        }
                    }
                }
            }
        }

        let overwritten = replaced
            .iter()
            .filter(|(key, prior)| table.get(*key) != Some(*prior))
            .count();
        let stats = MergeStats {
            added: added.len(),
            overwritten,
            unchanged: prior_count - overwritten,
            total: table.len(),
        };

        let mut rows: Vec<(BusinessKey, CanonicalRecord)> = table.into_iter().collect();
        rows.sort_by(|(ka, a), (kb, b)| self.compare(a, b).then_with(|| ka.cmp(kb)));
        let records: Vec<CanonicalRecord> = rows.into_iter().map(|(_, r)| r).collect();

        verify_integrity(&self.deriver, &records)?;

        info!(
            added = stats.added,
            overwritten = stats.overwritten,
            unchanged = stats.unchanged,
            total = stats.total,
            "Merged batches into master"
        );
        MergeMetrics::record_merge(&stats, started.elapsed().as_secs_f64());
        Ok(MergeOutcome { records, stats })
    }

    fn compare(&self, a: &CanonicalRecord, b: &CanonicalRecord) -> Ordering {
        self.sort_fields
            .iter()
            .chain(self.sequence.iter())
            .map(|&idx| a.get(idx).sort_cmp(b.get(idx)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

/// Re-derives every key of a finished table and fails on any repeat.
pub fn verify_integrity(
    deriver: &KeyDeriver,
    records: &[CanonicalRecord],
) -> Result<(), MergeIntegrityError> {
    let mut seen: HashSet<BusinessKey> = HashSet::with_capacity(records.len());
    let mut duplicates = Vec::new();
    for record in records {
        match deriver.derive(record) {
            Ok(key) => {
                if !seen.insert(key.clone()) {
                    duplicates.push(key.to_string());
                }
            }
            Err(reason) => duplicates.push(reason.to_string()),
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        MergeMetrics::record_integrity_failure();
        Err(MergeIntegrityError { duplicates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldValue;
    use serde_json::json;

    fn spec() -> MappingSpec {
        let raw = json!({
            "marketplace": "shopee",
            "key_policy": { "kind": "composite", "fields": ["order_date", "order_sn", "sku"] },
            "sort": { "fields": ["order_date", "order_sn"], "sequence": "item_seq" },
            "fields": [
                { "name": "order_date" },
                { "name": "order_sn" },
                { "name": "sku" },
                { "name": "item_seq" },
                { "name": "quantity", "type": "integer" }
            ]
        });
        MappingSpec::from_json_str(&raw.to_string()).unwrap()
    }

    fn rec(date: &str, sn: &str, sku: &str, seq: &str, qty: i64) -> CanonicalRecord {
        let text = |s: &str| FieldValue::Text(s.to_string());
        CanonicalRecord::from_values(vec![
            text(date),
            text(sn),
            text(sku),
            text(seq),
            FieldValue::Integer(qty),
        ])
    }

    fn batch(records: Vec<CanonicalRecord>) -> NormalizedBatch {
        let lines = (1..=records.len()).collect();
        NormalizedBatch {
            source: "batch.csv".to_string(),
            rows_read: records.len(),
            records,
            lines,
            ..Default::default()
        }
    }

    #[test]
    fn test_later_batch_overwrites_earlier() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let first = merger.key_batch(batch(vec![rec("20240101", "ORD001", "SKU-A", "1", 2)]));
        let second = merger.key_batch(batch(vec![rec("20240101", "ORD001", "SKU-A", "1", 5)]));

        let outcome = merger.merge(Vec::new(), &[first, second]).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].get(4), &FieldValue::Integer(5));
        assert_eq!(outcome.stats.added, 1);
        assert_eq!(outcome.stats.total, 1);
    }

    #[test]
    fn test_last_occurrence_in_batch_wins() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let keyed = merger.key_batch(batch(vec![
            rec("20240101", "ORD001", "SKU-A", "1", 1),
            rec("20240101", "ORD001", "SKU-B", "2", 1),
            rec("20240101", "ORD001", "SKU-A", "1", 9),
        ]));
        assert_eq!(keyed.duplicates, 1);
        assert_eq!(keyed.records.len(), 2);
        assert_eq!(keyed.records[0].1.get(4), &FieldValue::Integer(9));
    }

    #[test]
    fn test_stats_partition_prior_keys() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let master = vec![
            rec("20240101", "ORD001", "SKU-A", "1", 2),
            rec("20240101", "ORD002", "SKU-A", "1", 1),
            rec("20240102", "ORD003", "SKU-C", "1", 4),
        ];
        let keyed = merger.key_batch(batch(vec![
            rec("20240101", "ORD001", "SKU-A", "1", 3),
            rec("20240101", "ORD002", "SKU-A", "1", 1),
            rec("20240103", "ORD004", "SKU-D", "1", 1),
        ]));
        let outcome = merger.merge(master, &[keyed]).unwrap();
        assert_eq!(
            outcome.stats,
            MergeStats {
                added: 1,
                overwritten: 1,
                unchanged: 2,
                total: 4
            }
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let records = vec![
            rec("20240102", "ORD002", "SKU-B", "1", 1),
            rec("20240101", "ORD001", "SKU-A", "2", 2),
            rec("20240101", "ORD001", "SKU-C", "1", 3),
        ];
        let once = merger
            .merge(Vec::new(), &[merger.key_batch(batch(records.clone()))])
            .unwrap();
        let twice = merger
            .merge(once.records.clone(), &[merger.key_batch(batch(records))])
            .unwrap();
        assert_eq!(once.records, twice.records);
        assert_eq!(twice.stats.added, 0);
        assert_eq!(twice.stats.overwritten, 0);
        assert_eq!(twice.stats.unchanged, 3);
    }

    #[test]
    fn test_sorted_by_date_order_then_sequence() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let keyed = merger.key_batch(batch(vec![
            rec("20240102", "ORD002", "SKU-B", "1", 1),
            rec("20240101", "ORD001", "SKU-A", "10", 1),
            rec("20240101", "ORD001", "SKU-C", "2", 1),
        ]));
        let outcome = merger.merge(Vec::new(), &[keyed]).unwrap();
        let skus: Vec<String> = outcome.records.iter().map(|r| r.get(2).render()).collect();
        assert_eq!(skus, vec!["SKU-C", "SKU-A", "SKU-B"]);
    }

    #[test]
    fn test_duplicate_keys_in_prior_master_abort() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let master = vec![
            rec("20240101", "ORD001", "SKU-A", "1", 2),
            rec("20240101", "ORD001", "SKU-A", "2", 3),
        ];
        let err = merger.merge(master, &[]).unwrap_err();
        assert_eq!(err.duplicates, vec!["(20240101, ORD001, SKU-A)".to_string()]);
    }

    #[test]
    fn test_blank_key_rejected_at_keying() {
        let spec = spec();
        let merger = Merger::new(&spec);
        let keyed = merger.key_batch(batch(vec![rec("20240101", "", "SKU-A", "1", 2)]));
        assert!(keyed.records.is_empty());
        assert_eq!(
            keyed.rejected[0].reason,
            RowRejection::MissingKey {
                field: "order_sn".to_string()
            }
        );
    }
}
