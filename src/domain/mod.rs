use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Declared type of a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Decimal,
    Date,
    Datetime,
    Boolean,
}

/// A typed cell of a canonical record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Blank,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Bool(bool),
}

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl FieldValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Blank => true,
            FieldValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            FieldValue::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    /// Flat-file rendering. Stable across load/save so re-published tables are byte-identical.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Blank => String::new(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(f) => f.to_string(),
            FieldValue::Date(d) => d.format(DATE_FORMAT).to_string(),
            FieldValue::DateTime(dt) => dt.format(DATETIME_FORMAT).to_string(),
            FieldValue::Bool(b) => b.to_string(),
        }
    }

    /// Ordering used for the master table sort. Blanks sort last.
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self.is_blank(), other.is_blank()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        match (self, other) {
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Decimal(a), FieldValue::Decimal(b)) => a.total_cmp(b),
            (FieldValue::Date(a), FieldValue::Date(b)) => a.cmp(b),
            (FieldValue::DateTime(a), FieldValue::DateTime(b)) => a.cmp(b),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => natural_cmp(a, b),
            (a, b) => a.render().cmp(&b.render()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Digit strings of different widths compare numerically ("2" < "10"), everything else lexically.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let (ta, tb) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
        return ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb)).then_with(|| a.cmp(b));
    }
    a.cmp(b)
}

/// One standardized line item. Values are positional, aligned with the
/// marketplace's MappingSpec field order, so every record of a marketplace
/// has the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    values: Vec<FieldValue>,
}

impl CanonicalRecord {
    pub fn blank(width: usize) -> Self {
        Self {
            values: vec![FieldValue::Blank; width],
        }
    }

    pub fn from_values(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, idx: usize) -> &FieldValue {
        &self.values[idx]
    }

    pub fn set(&mut self, idx: usize, value: FieldValue) {
        self.values[idx] = value;
    }

    pub fn render_row(&self) -> Vec<String> {
        self.values.iter().map(FieldValue::render).collect()
    }
}

/// Composite identity of a line item within one marketplace's master table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BusinessKey(Vec<String>);

impl BusinessKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// One data row of an input file, cells positionally aligned with the file's header row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based line of the row within the decoded file
    pub line: usize,
    pub cells: Vec<String>,
}

/// A parsed input file: its literal header row and data rows.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub source: String,
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
    /// hex SHA-256 of the file bytes
    pub digest: String,
}
