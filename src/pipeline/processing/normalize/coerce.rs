use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::{FieldType, FieldValue};
use crate::pipeline::processing::mapping::resolver::fold_full_width;
use crate::pipeline::processing::mapping::{FieldSpec, NumberFormat};

const DEFAULT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%Y.%m.%d"];
const DEFAULT_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];
const DEFAULT_TRUTHY: &[&str] = &["true", "1", "y", "yes", "是"];
const DEFAULT_FALSY: &[&str] = &["false", "0", "n", "no", "否"];
const CURRENCY_PREFIXES: &[&str] = &["NT$", "$", "¥"];

/// Strips spreadsheet export noise from a cell: the `="..."` text guard,
/// wrapping quotes, embedded line breaks.
pub fn clean_cell(raw: &str) -> String {
    let trimmed = raw.trim();
    let unguarded = if trimmed.len() >= 3 && trimmed.starts_with("=\"") && trimmed.ends_with('"') {
        &trimmed[2..trimmed.len() - 1]
    } else if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    unguarded.replace(['\r', '\n'], " ").trim().to_string()
}

/// Coerces a cleaned cell to the field's declared type. Blank input yields
/// `FieldValue::Blank`; the error string describes why a non-blank value failed.
pub fn coerce(field: &FieldSpec, cell: &str, numbers: &NumberFormat) -> Result<FieldValue, String> {
    if cell.is_empty() {
        return Ok(FieldValue::Blank);
    }
    match field.field_type {
        FieldType::String => {
            let text = match field.max_len {
                Some(n) => cell.chars().take(n).collect(),
                None => cell.to_string(),
            };
            Ok(FieldValue::Text(text))
        }
        FieldType::Integer => parse_integer(cell, numbers).map(FieldValue::Integer),
        FieldType::Decimal => {
            let value = parse_decimal(cell, numbers)?;
            Ok(FieldValue::Decimal(match field.decimals {
                Some(places) => round_to(value, places),
                None => value,
            }))
        }
        FieldType::Date => parse_date(cell, &field.formats).map(FieldValue::Date),
        FieldType::Datetime => parse_datetime(cell, &field.formats).map(FieldValue::DateTime),
        FieldType::Boolean => parse_bool(cell, &field.truthy, &field.falsy).map(FieldValue::Bool),
    }
}

fn numeric_text(cell: &str, numbers: &NumberFormat) -> String {
    let folded = fold_full_width(cell);
    let mut text = folded.trim();
    for prefix in CURRENCY_PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim_start();
            break;
        }
    }
    let thousands = numbers.thousands_sep();
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != thousands)
        .map(|c| if c == numbers.decimal { '.' } else { c })
        .collect()
}

fn parse_integer(cell: &str, numbers: &NumberFormat) -> Result<i64, String> {
    let text = numeric_text(cell, numbers);
    // exports of integer columns via spreadsheets often carry a ".0" tail
    let whole = match text.split_once('.') {
        Some((int_part, frac)) if frac.chars().all(|c| c == '0') => int_part,
        _ => text.as_str(),
    };
    whole
        .parse::<i64>()
        .map_err(|_| format!("'{}' is not an integer", cell))
}

fn parse_decimal(cell: &str, numbers: &NumberFormat) -> Result<f64, String> {
    let text = numeric_text(cell, numbers);
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("'{}' is not a number", cell)),
    }
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

pub(crate) fn parse_date(cell: &str, formats: &[String]) -> Result<NaiveDate, String> {
    let cell = cell.trim();
    let declared = formats.iter().map(String::as_str);
    let candidates: Vec<&str> = if formats.is_empty() {
        DEFAULT_DATE_FORMATS
            .iter()
            .chain(DEFAULT_DATETIME_FORMATS)
            .copied()
            .collect()
    } else {
        declared.collect()
    };
    for fmt in &candidates {
        if let Ok(d) = NaiveDate::parse_from_str(cell, fmt) {
            return Ok(d);
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(cell, fmt) {
            return Ok(dt.date());
        }
    }
    Err(format!("'{}' does not match date formats {:?}", cell, candidates))
}

fn parse_datetime(cell: &str, formats: &[String]) -> Result<NaiveDateTime, String> {
    let cell = cell.trim();
    let candidates: Vec<&str> = if formats.is_empty() {
        DEFAULT_DATETIME_FORMATS
            .iter()
            .chain(DEFAULT_DATE_FORMATS)
            .copied()
            .collect()
    } else {
        formats.iter().map(String::as_str).collect()
    };
    for fmt in &candidates {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cell, fmt) {
            return Ok(dt);
        }
        if let Some(dt) = NaiveDate::parse_from_str(cell, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(dt);
        }
    }
    Err(format!("'{}' does not match datetime formats {:?}", cell, candidates))
}

fn parse_bool(cell: &str, truthy: &[String], falsy: &[String]) -> Result<bool, String> {
    let token = cell.trim();
    let matches = |set: &[&str]| set.iter().any(|t| t.eq_ignore_ascii_case(token));

    if truthy.is_empty() && falsy.is_empty() {
        if matches(DEFAULT_TRUTHY) {
            return Ok(true);
        }
        if matches(DEFAULT_FALSY) {
            return Ok(false);
        }
        return Err(format!("'{}' is not a recognized boolean", cell));
    }

    let truthy: Vec<&str> = truthy.iter().map(String::as_str).collect();
    let falsy: Vec<&str> = falsy.iter().map(String::as_str).collect();
    if matches(&truthy) {
        Ok(true)
    } else if falsy.is_empty() || matches(&falsy) {
        Ok(false)
    } else {
        Err(format!("'{}' is neither truthy {:?} nor falsy {:?}", cell, truthy, falsy))
    }
}

/// Reads back a value written by `FieldValue::render`. Used for the persisted
/// master table, whose cells are already canonical.
pub fn parse_stored(field_type: FieldType, cell: &str) -> Result<FieldValue, String> {
    if cell.is_empty() {
        return Ok(FieldValue::Blank);
    }
    let invalid = |what: &str| format!("stored value '{}' is not a valid {}", cell, what);
    match field_type {
        FieldType::String => Ok(FieldValue::Text(cell.to_string())),
        FieldType::Integer => cell
            .parse()
            .map(FieldValue::Integer)
            .map_err(|_| invalid("integer")),
        FieldType::Decimal => cell
            .parse()
            .map(FieldValue::Decimal)
            .map_err(|_| invalid("decimal")),
        FieldType::Date => NaiveDate::parse_from_str(cell, crate::domain::DATE_FORMAT)
            .map(FieldValue::Date)
            .map_err(|_| invalid("date")),
        FieldType::Datetime => NaiveDateTime::parse_from_str(cell, crate::domain::DATETIME_FORMAT)
            .map(FieldValue::DateTime)
            .map_err(|_| invalid("datetime")),
        FieldType::Boolean => match cell {
            "true" => Ok(FieldValue::Bool(true)),
            "false" => Ok(FieldValue::Bool(false)),
            _ => Err(invalid("boolean")),
        },
    }
}

/// The value a field takes when the source leaves it empty.
pub fn default_value(field: &FieldSpec, numbers: &NumberFormat) -> Result<FieldValue, String> {
    match &field.default {
        Some(raw) => coerce(field, &clean_cell(raw), numbers),
        None => Ok(FieldValue::Blank),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field_type: FieldType) -> FieldSpec {
        FieldSpec {
            name: "f".to_string(),
            aliases: vec![],
            field_type,
            required: false,
            default: None,
            constant: None,
            formats: vec![],
            truthy: vec![],
            falsy: vec![],
            decimals: None,
            max_len: None,
        }
    }

    #[test]
    fn test_clean_cell_strips_excel_guard() {
        assert_eq!(clean_cell("=\"0012345\""), "0012345");
        assert_eq!(clean_cell("  \"ORD-1\" "), "ORD-1");
        assert_eq!(clean_cell("line one\r\nline two"), "line one  line two");
        assert_eq!(clean_cell("   "), "");
    }

    #[test]
    fn test_integer_accepts_separators_and_float_tail() {
        let numbers = NumberFormat::default();
        let f = field(FieldType::Integer);
        assert_eq!(coerce(&f, "1,234", &numbers), Ok(FieldValue::Integer(1234)));
        assert_eq!(coerce(&f, "3.0", &numbers), Ok(FieldValue::Integer(3)));
        assert_eq!(coerce(&f, "１２", &numbers), Ok(FieldValue::Integer(12)));
        assert!(coerce(&f, "3.5", &numbers).is_err());
        assert!(coerce(&f, "abc", &numbers).is_err());
    }

    #[test]
    fn test_decimal_locale_and_rounding() {
        let european = NumberFormat {
            decimal: ',',
            thousands: Some('.'),
        };
        let mut f = field(FieldType::Decimal);
        assert_eq!(coerce(&f, "1.234,5", &european), Ok(FieldValue::Decimal(1234.5)));
        f.decimals = Some(2);
        assert_eq!(
            coerce(&f, "NT$ 1,299.456", &NumberFormat::default()),
            Ok(FieldValue::Decimal(1299.46))
        );
        assert!(coerce(&f, "NaN", &NumberFormat::default()).is_err());
    }

    #[test]
    fn test_comma_decimal_mark_alone_keeps_fraction() {
        let numbers: NumberFormat = serde_json::from_value(serde_json::json!({ "decimal": "," })).unwrap();
        let f = field(FieldType::Decimal);
        assert_eq!(coerce(&f, "1,5", &numbers), Ok(FieldValue::Decimal(1.5)));
        assert_eq!(coerce(&f, "1.234,5", &numbers), Ok(FieldValue::Decimal(1234.5)));
        assert_eq!(
            coerce(&field(FieldType::Integer), "2.000", &numbers),
            Ok(FieldValue::Integer(2000))
        );
    }

    #[test]
    fn test_date_formats() {
        let mut f = field(FieldType::Date);
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(coerce(&f, "2024/03/09", &NumberFormat::default()), Ok(FieldValue::Date(expected)));
        assert_eq!(
            coerce(&f, "2024-03-09 13:45:00", &NumberFormat::default()),
            Ok(FieldValue::Date(expected))
        );
        f.formats = vec!["%d.%m.%Y".to_string()];
        assert_eq!(coerce(&f, "09.03.2024", &NumberFormat::default()), Ok(FieldValue::Date(expected)));
        assert!(coerce(&f, "2024-03-09", &NumberFormat::default()).is_err());
    }

    #[test]
    fn test_boolean_token_sets() {
        let numbers = NumberFormat::default();
        let mut f = field(FieldType::Boolean);
        assert_eq!(coerce(&f, "YES", &numbers), Ok(FieldValue::Bool(true)));
        assert_eq!(coerce(&f, "否", &numbers), Ok(FieldValue::Bool(false)));
        assert!(coerce(&f, "maybe", &numbers).is_err());

        f.truthy = vec!["已確認".to_string()];
        assert_eq!(coerce(&f, "已確認", &numbers), Ok(FieldValue::Bool(true)));
        assert_eq!(coerce(&f, "未確認", &numbers), Ok(FieldValue::Bool(false)));

        f.falsy = vec!["未確認".to_string()];
        assert!(coerce(&f, "處理中", &numbers).is_err());
    }

    #[test]
    fn test_stored_values_read_back_canonically() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        assert_eq!(parse_stored(FieldType::Date, "2024-01-07"), Ok(FieldValue::Date(d)));
        assert_eq!(parse_stored(FieldType::Decimal, "1299.46"), Ok(FieldValue::Decimal(1299.46)));
        assert_eq!(parse_stored(FieldType::Boolean, "false"), Ok(FieldValue::Bool(false)));
        assert_eq!(parse_stored(FieldType::Integer, ""), Ok(FieldValue::Blank));
        assert!(parse_stored(FieldType::Integer, "1,234").is_err());
    }

    #[test]
    fn test_string_truncation_and_default() {
        let numbers = NumberFormat::default();
        let mut f = field(FieldType::String);
        f.max_len = Some(3);
        assert_eq!(coerce(&f, "10491", &numbers), Ok(FieldValue::Text("104".to_string())));

        let mut q = field(FieldType::Integer);
        assert_eq!(default_value(&q, &numbers), Ok(FieldValue::Blank));
        q.default = Some("0".to_string());
        assert_eq!(default_value(&q, &numbers), Ok(FieldValue::Integer(0)));
    }
}
