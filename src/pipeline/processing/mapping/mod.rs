//! Per-marketplace field mapping.
//!
//! A MappingSpec declares the canonical field list (order, aliases, types,
//! defaults), the business key policy, the master table sort and the derivation
//! rules the normalizer applies. It is loaded once per run and shared read-only.

pub mod resolver;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::domain::FieldType;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::keys::KeyPolicy;
use crate::pipeline::processing::normalize::coerce;

pub use resolver::{normalize_label, HeaderResolver, MappingCheck};

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Raw default, coerced with the field type; absent means blank.
    #[serde(default)]
    pub default: Option<String>,
    /// Fixed value for every record, e.g. the platform name.
    #[serde(default)]
    pub constant: Option<String>,
    /// chrono patterns tried in order for date/datetime fields
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub truthy: Vec<String>,
    #[serde(default)]
    pub falsy: Vec<String>,
    /// Round decimals to this many places
    #[serde(default)]
    pub decimals: Option<u32>,
    /// Keep only the first `max_len` characters of string values
    #[serde(default)]
    pub max_len: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NumberFormat {
    #[serde(default = "default_decimal_sep")]
    pub decimal: char,
    /// Unset means ',' or, with a ',' decimal mark, '.'
    #[serde(default)]
    pub thousands: Option<char>,
}

fn default_decimal_sep() -> char {
    '.'
}

impl NumberFormat {
    pub fn thousands_sep(&self) -> char {
        match self.thousands {
            Some(sep) => sep,
            None if self.decimal == ',' => '.',
            None => ',',
        }
    }
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self {
            decimal: default_decimal_sep(),
            thousands: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SortSpec {
    /// Primary ascending sort fields
    #[serde(default)]
    pub fields: Vec<String>,
    /// Intra-order sub-sequence used to break ties
    #[serde(default)]
    pub sequence: Option<String>,
}

/// Order date encoded in the first characters of an identifier (e.g. YYMMDD).
#[derive(Debug, Clone, Deserialize)]
pub struct DatePrefixRule {
    pub source: String,
    pub target: String,
    pub length: usize,
    pub format: String,
}

/// Weekday (Sunday=1 .. Saturday=7) and ISO week derived from a date field.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarRule {
    pub date_field: String,
    #[serde(default)]
    pub weekday_field: Option<String>,
    #[serde(default)]
    pub week_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureTarget {
    pub field: String,
    pub group: usize,
    #[serde(default)]
    pub zero_pad: Option<usize>,
}

/// Sub-identifiers embedded in a free-text field, e.g. "Mug (DGAB01-A900-12)".
#[derive(Debug, Clone, Deserialize)]
pub struct SubIdentifierRule {
    pub source: String,
    pub pattern: String,
    pub targets: Vec<CaptureTarget>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl SubIdentifierRule {
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled.as_ref()
    }
}

/// Values embedded in the export's file name, e.g. the shop name and account
/// in "MainStore_twmain01_Order.all.20240101_20240107.csv". A column carrying
/// the same field wins over the file name.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceFileRule {
    pub pattern: String,
    pub targets: Vec<CaptureTarget>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl SourceFileRule {
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled.as_ref()
    }
}

/// Running line number within an order, used when the export has none.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemSeqRule {
    pub order_field: String,
    pub target: String,
    #[serde(default)]
    pub zero_pad: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeriveSpec {
    #[serde(default)]
    pub order_date_prefix: Option<DatePrefixRule>,
    #[serde(default)]
    pub calendar: Option<CalendarRule>,
    #[serde(default)]
    pub sub_identifiers: Option<SubIdentifierRule>,
    #[serde(default)]
    pub item_seq: Option<ItemSeqRule>,
    #[serde(default)]
    pub source_file: Option<SourceFileRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingSpec {
    pub marketplace: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Preamble rows preceding the header row
    #[serde(default)]
    pub header_row: usize,
    #[serde(default)]
    pub number_format: NumberFormat,
    pub key_policy: KeyPolicy,
    #[serde(default)]
    pub sort: SortSpec,
    #[serde(default)]
    pub derive: DeriveSpec,
    pub fields: Vec<FieldSpec>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

fn default_delimiter() -> char {
    ','
}

impl MappingSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read mapping spec '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let mut spec: MappingSpec = serde_json::from_str(content)?;
        spec.prepare()?;
        Ok(spec)
    }

    fn prepare(&mut self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(PipelineError::Mapping(format!(
                "{}: no fields declared",
                self.marketplace
            )));
        }
        if !self.delimiter.is_ascii() {
            return Err(PipelineError::Mapping(format!(
                "{}: delimiter must be a single ASCII character",
                self.marketplace
            )));
        }
        if self.number_format.thousands_sep() == self.number_format.decimal {
            return Err(PipelineError::Mapping(format!(
                "{}: thousands separator and decimal mark are both '{}'",
                self.marketplace, self.number_format.decimal
            )));
        }

        self.index.clear();
        for (idx, field) in self.fields.iter().enumerate() {
            if self.index.insert(field.name.clone(), idx).is_some() {
                return Err(PipelineError::Mapping(format!(
                    "{}: field '{}' declared twice",
                    self.marketplace, field.name
                )));
            }
        }

        for field in &self.fields {
            let literals = field.default.iter().chain(field.constant.iter());
            for literal in literals {
                coerce::coerce(field, &coerce::clean_cell(literal), &self.number_format).map_err(
                    |reason| {
                        PipelineError::Mapping(format!(
                            "{}: field '{}' has an invalid literal: {}",
                            self.marketplace, field.name, reason
                        ))
                    },
                )?;
            }
        }

        let mut referenced: Vec<&str> = self.key_policy.fields();
        referenced.extend(self.sort.fields.iter().map(String::as_str));
        referenced.extend(self.sort.sequence.as_deref());
        if let Some(rule) = &self.derive.order_date_prefix {
            referenced.extend([rule.source.as_str(), rule.target.as_str()]);
            if rule.length == 0 {
                return Err(PipelineError::Mapping(format!(
                    "{}: order_date_prefix length must be positive",
                    self.marketplace
                )));
            }
        }
        if let Some(rule) = &self.derive.calendar {
            referenced.push(rule.date_field.as_str());
            referenced.extend(rule.weekday_field.as_deref());
            referenced.extend(rule.week_field.as_deref());
        }
        if let Some(rule) = &self.derive.item_seq {
            referenced.extend([rule.order_field.as_str(), rule.target.as_str()]);
        }
        if let Some(rule) = &self.derive.sub_identifiers {
            referenced.push(rule.source.as_str());
            referenced.extend(rule.targets.iter().map(|t| t.field.as_str()));
        }
        if let Some(rule) = &self.derive.source_file {
            referenced.extend(rule.targets.iter().map(|t| t.field.as_str()));
        }
        for name in referenced {
            if !self.index.contains_key(name) {
                return Err(PipelineError::Mapping(format!(
                    "{}: field '{}' is referenced but not declared",
                    self.marketplace, name
                )));
            }
        }

        if let Some(rule) = self.derive.sub_identifiers.as_mut() {
            rule.compiled = Some(compile_captures(&self.marketplace, &rule.pattern, &rule.targets)?);
        }
        if let Some(rule) = self.derive.source_file.as_mut() {
            rule.compiled = Some(compile_captures(&self.marketplace, &rule.pattern, &rule.targets)?);
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Index of a field validated when the mapping loaded.
    pub(crate) fn declared(&self, name: &str) -> usize {
        self.index[name]
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// The field holding each line item's order date, if the mapping has one.
    pub fn order_date_field(&self) -> Option<&str> {
        if let Some(rule) = &self.derive.calendar {
            return Some(rule.date_field.as_str());
        }
        if let Some(rule) = &self.derive.order_date_prefix {
            return Some(rule.target.as_str());
        }
        self.sort
            .fields
            .iter()
            .chain(self.fields.iter().map(|f| &f.name))
            .find(|name| {
                self.index_of(name)
                    .map(|idx| matches!(self.fields[idx].field_type, FieldType::Date | FieldType::Datetime))
                    .unwrap_or(false)
            })
            .map(String::as_str)
    }

    /// Fields filled without a source column: constants and derivation targets.
    pub fn derived_fields(&self) -> HashSet<&str> {
        let mut out: HashSet<&str> = self
            .fields
            .iter()
            .filter(|f| f.constant.is_some())
            .map(|f| f.name.as_str())
            .collect();
        if let Some(rule) = &self.derive.order_date_prefix {
            out.insert(rule.target.as_str());
        }
        if let Some(rule) = &self.derive.calendar {
            out.extend(rule.weekday_field.as_deref());
            out.extend(rule.week_field.as_deref());
        }
        if let Some(rule) = &self.derive.sub_identifiers {
            out.extend(rule.targets.iter().map(|t| t.field.as_str()));
        }
        if let Some(rule) = &self.derive.item_seq {
            out.insert(rule.target.as_str());
        }
        if let Some(rule) = &self.derive.source_file {
            out.extend(rule.targets.iter().map(|t| t.field.as_str()));
        }
        out
    }
}

fn compile_captures(marketplace: &str, pattern: &str, targets: &[CaptureTarget]) -> Result<Regex> {
    let regex = Regex::new(pattern)?;
    let groups = regex.captures_len();
    if let Some(bad) = targets.iter().find(|t| t.group == 0 || t.group >= groups) {
        return Err(PipelineError::Mapping(format!(
            "{}: capture group {} for '{}' not in pattern",
            marketplace, bad.group, bad.field
        )));
    }
    Ok(regex)
}
