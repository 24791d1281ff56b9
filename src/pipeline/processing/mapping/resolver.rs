use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, warn};

use super::MappingSpec;
use crate::error::UnresolvedColumnError;

/// Canonical comparison form of a header label or alias: full-width ASCII
/// forms folded to half-width, control characters treated as whitespace,
/// whitespace runs collapsed to one space and trimmed.
pub fn normalize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars().map(to_half_width) {
        if ch.is_whitespace() || ch.is_control() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

/// Folds full-width ASCII forms to half-width without touching whitespace.
pub(crate) fn fold_full_width(raw: &str) -> String {
    raw.chars().map(to_half_width).collect()
}

fn to_half_width(ch: char) -> char {
    match ch {
        '\u{3000}' | '\u{FEFF}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch),
        _ => ch,
    }
}

#[derive(Debug, Clone, Copy)]
struct AliasTarget {
    field: usize,
}

/// Resolves literal source headers to canonical fields of one MappingSpec.
pub struct HeaderResolver<'a> {
    spec: &'a MappingSpec,
    aliases: HashMap<String, AliasTarget>,
    collisions: BTreeMap<String, Vec<String>>,
}

/// Result of resolving one file's header row.
#[derive(Debug, Clone)]
pub struct ResolvedHeader {
    /// For each source column, the canonical field index it feeds
    pub columns: Vec<Option<usize>>,
    /// Source headers with no canonical field, dropped
    pub unmatched: Vec<String>,
    /// Source headers that resolved to a field an earlier column already feeds
    pub shadowed: Vec<String>,
    mapped: Vec<bool>,
}

impl ResolvedHeader {
    pub fn is_mapped(&self, field: usize) -> bool {
        self.mapped.get(field).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AliasCollision {
    pub alias: String,
    pub fields: Vec<String>,
}

/// Mapping diagnostics for the `check-mapping` command.
#[derive(Debug, Clone, Serialize)]
pub struct MappingCheck {
    pub marketplace: String,
    pub field_count: usize,
    pub alias_collisions: Vec<AliasCollision>,
    pub uncovered_headers: Vec<String>,
    pub absent_fields: Vec<String>,
    pub missing_required: Vec<String>,
}

impl<'a> HeaderResolver<'a> {
    pub fn new(spec: &'a MappingSpec) -> Self {
        let mut aliases: HashMap<String, AliasTarget> = HashMap::new();
        let mut claimed: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (idx, field) in spec.fields.iter().enumerate() {
            let candidates = std::iter::once(&field.name).chain(field.aliases.iter());
            for alias in candidates {
                let key = normalize_label(alias);
                if key.is_empty() {
                    continue;
                }
                let owners = claimed.entry(key.clone()).or_default();
                if !owners.contains(&field.name) {
                    owners.push(field.name.clone());
                }

                // aliases equal after normalization resolve to the field declared first
                aliases.entry(key).or_insert(AliasTarget { field: idx });
            }
        }

        let collisions = claimed
            .into_iter()
            .filter(|(_, owners)| owners.len() > 1)
            .collect();

        Self {
            spec,
            aliases,
            collisions,
        }
    }

    /// Canonical field name for a single header label.
    pub fn resolve_label(&self, label: &str) -> Option<&'a str> {
        let spec = self.spec;
        self.aliases
            .get(&normalize_label(label))
            .map(|t| spec.fields[t.field].name.as_str())
    }

    pub fn resolve(
        &self,
        source: &str,
        headers: &[String],
    ) -> Result<ResolvedHeader, UnresolvedColumnError> {
        let mut columns = Vec::with_capacity(headers.len());
        let mut mapped = vec![false; self.spec.width()];
        let mut unmatched = Vec::new();
        let mut shadowed = Vec::new();

        for header in headers {
            let key = normalize_label(header);
            if key.is_empty() {
                columns.push(None);
                continue;
            }
            match self.aliases.get(&key) {
                Some(target) if mapped[target.field] => {
                    warn!(
                        source = %source,
                        header = %header,
                        field = %self.spec.fields[target.field].name,
                        "Header maps to a field already fed by an earlier column, ignoring"
                    );
                    shadowed.push(header.clone());
                    columns.push(None);
                }
                Some(target) => {
                    mapped[target.field] = true;
                    columns.push(Some(target.field));
                }
                None => {
                    unmatched.push(header.clone());
                    columns.push(None);
                }
            }
        }

        let derived = self.spec.derived_fields();
        let missing_required: Vec<String> = self
            .spec
            .fields
            .iter()
            .enumerate()
            .filter(|(idx, f)| f.required && !mapped[*idx] && !derived.contains(f.name.as_str()))
            .map(|(_, f)| f.name.clone())
            .collect();

        if !missing_required.is_empty() {
            return Err(UnresolvedColumnError {
                file: source.to_string(),
                missing_required,
                unmatched_headers: unmatched,
            });
        }

        if !unmatched.is_empty() {
            debug!(source = %source, dropped = ?unmatched, "Dropping columns not in mapping spec");
        }

        Ok(ResolvedHeader {
            columns,
            unmatched,
            shadowed,
            mapped,
        })
    }

    pub fn check(&self, headers: Option<&[String]>) -> MappingCheck {
        let alias_collisions = self
            .collisions
            .iter()
            .map(|(alias, fields)| AliasCollision {
                alias: alias.clone(),
                fields: fields.clone(),
            })
            .collect();

        let mut check = MappingCheck {
            marketplace: self.spec.marketplace.clone(),
            field_count: self.spec.width(),
            alias_collisions,
            uncovered_headers: Vec::new(),
            absent_fields: Vec::new(),
            missing_required: Vec::new(),
        };

        if let Some(headers) = headers {
            let resolved = match self.resolve("sample", headers) {
                Ok(resolved) => resolved,
                Err(e) => {
                    check.missing_required = e.missing_required;
                    check.uncovered_headers = e.unmatched_headers;
                    return self.fill_absent(check, headers);
                }
            };
            check.uncovered_headers = resolved.unmatched;
            return self.fill_absent(check, headers);
        }
        check
    }

    fn fill_absent(&self, mut check: MappingCheck, headers: &[String]) -> MappingCheck {
        let present: Vec<&str> = headers.iter().filter_map(|h| self.resolve_label(h)).collect();
        let derived = self.spec.derived_fields();
        check.absent_fields = self
            .spec
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| !present.contains(name) && !derived.contains(name))
            .map(str::to_string)
            .collect();
        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::mapping::tests::{pchome_spec, pchome_spec_json};
    use serde_json::json;

    fn headers(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_label_folds_full_width() {
        assert_eq!(normalize_label("收貨地址（訂單編號）"), "收貨地址(訂單編號)");
        assert_eq!(normalize_label("  單價\n(元)  "), "單價 (元)");
        assert_eq!(normalize_label("ＮＯ"), "NO");
        assert_eq!(normalize_label("數量\u{3000}\u{3000}合計"), "數量 合計");
        assert_eq!(normalize_label("\u{FEFF}訂單編號"), "訂單編號");
    }

    #[test]
    fn test_full_width_parentheses_resolve_to_half_width_alias() {
        let spec = pchome_spec();
        let resolver = HeaderResolver::new(&spec);
        assert_eq!(resolver.resolve_label("收貨地址（訂單編號）"), Some("receiver_addr"));

        let resolved = resolver
            .resolve("f.tsv", &headers(&["訂單編號", "數量", "收貨地址（訂單編號）"]))
            .expect("should resolve");
        assert_eq!(resolved.columns[2], spec.index_of("receiver_addr"));
    }

    #[test]
    fn test_canonical_name_is_an_alias() {
        let spec = pchome_spec();
        let resolver = HeaderResolver::new(&spec);
        assert_eq!(resolver.resolve_label("order_sn"), Some("order_sn"));
    }

    #[test]
    fn test_missing_required_field_is_unresolved() {
        let spec = pchome_spec();
        let resolver = HeaderResolver::new(&spec);
        let err = resolver
            .resolve("f.tsv", &headers(&["訂單編號", "備註"]))
            .unwrap_err();
        assert_eq!(err.missing_required, vec!["quantity".to_string()]);
        assert_eq!(err.unmatched_headers, vec!["備註".to_string()]);
    }

    #[test]
    fn test_unknown_columns_dropped_and_duplicates_shadowed() {
        let spec = pchome_spec();
        let resolver = HeaderResolver::new(&spec);
        let resolved = resolver
            .resolve("f.tsv", &headers(&["訂單編號", "數量", "備註", "order_sn", ""]))
            .unwrap();
        assert_eq!(resolved.unmatched, vec!["備註".to_string()]);
        assert_eq!(resolved.shadowed, vec!["order_sn".to_string()]);
        assert_eq!(resolved.columns[3], None);
        assert_eq!(resolved.columns[4], None);
        assert!(resolved.is_mapped(spec.index_of("quantity").unwrap()));
    }

    #[test]
    fn test_colliding_alias_resolves_to_first_declared_field() {
        let mut raw = pchome_spec_json();
        let fields = raw["fields"].as_array_mut().unwrap();
        fields.push(json!({ "name": "note_short", "aliases": ["備註"] }));
        fields.push(json!({ "name": "note_padded", "aliases": ["備註\u{3000}\u{3000}", "（備註）"] }));
        fields.push(json!({ "name": "note_paren", "aliases": ["(備註)"] }));
        let spec = MappingSpec::from_json_str(&raw.to_string()).unwrap();
        let resolver = HeaderResolver::new(&spec);
        assert_eq!(resolver.resolve_label("備註"), Some("note_short"));
        assert_eq!(resolver.resolve_label(" 備註\u{3000}"), Some("note_short"));
        assert_eq!(resolver.resolve_label("(備註)"), Some("note_padded"));

        let check = resolver.check(None);
        assert_eq!(check.alias_collisions.len(), 2);
        assert_eq!(check.alias_collisions[0].fields, vec!["note_padded", "note_paren"]);
        assert_eq!(check.alias_collisions[1].fields, vec!["note_short", "note_padded"]);
    }

    #[test]
    fn test_check_reports_uncovered_and_absent() {
        let spec = pchome_spec();
        let resolver = HeaderResolver::new(&spec);
        let check = resolver.check(Some(&headers(&["訂單編號", "數量", "贈品"])));
        assert_eq!(check.uncovered_headers, vec!["贈品".to_string()]);
        assert!(check.absent_fields.contains(&"price_unit".to_string()));
        assert!(!check.absent_fields.contains(&"order_date".to_string()));
        assert!(check.missing_required.is_empty());
    }
}
