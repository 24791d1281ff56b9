//! Computed fields, applied after the mapped source values are copied in.

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use super::coerce;
use crate::domain::{CanonicalRecord, FieldType, FieldValue};
use crate::pipeline::processing::mapping::{CaptureTarget, FieldSpec, MappingSpec, NumberFormat};

#[derive(Debug, Clone)]
struct DatePrefix {
    source: usize,
    target: usize,
    length: usize,
    format: String,
}

#[derive(Debug, Clone)]
struct Calendar {
    date: usize,
    weekday: Option<usize>,
    week: Option<usize>,
}

#[derive(Debug, Clone)]
struct Capture {
    target: usize,
    group: usize,
    zero_pad: Option<usize>,
}

#[derive(Debug, Clone)]
struct ItemSeq {
    order: usize,
    target: usize,
    zero_pad: Option<usize>,
}

/// Derivation rules of one MappingSpec with field names resolved to positions.
#[derive(Debug, Clone)]
pub struct Derivations<'a> {
    fields: &'a [FieldSpec],
    numbers: &'a NumberFormat,
    date_prefix: Option<DatePrefix>,
    calendar: Option<Calendar>,
    sub_identifiers: Option<(usize, &'a regex::Regex, Vec<Capture>)>,
    source_file: Option<(&'a regex::Regex, Vec<Capture>)>,
    item_seq: Option<ItemSeq>,
}

impl<'a> Derivations<'a> {
    pub fn new(spec: &'a MappingSpec) -> Self {
        let rules = &spec.derive;
        let date_prefix = rules.order_date_prefix.as_ref().map(|r| DatePrefix {
            source: spec.declared(&r.source),
            target: spec.declared(&r.target),
            length: r.length,
            format: r.format.clone(),
        });
        let calendar = rules.calendar.as_ref().map(|r| Calendar {
            date: spec.declared(&r.date_field),
            weekday: r.weekday_field.as_deref().map(|f| spec.declared(f)),
            week: r.week_field.as_deref().map(|f| spec.declared(f)),
        });
        let captures = |targets: &[CaptureTarget]| -> Vec<Capture> {
            targets
                .iter()
                .map(|t| Capture {
                    target: spec.declared(&t.field),
                    group: t.group,
                    zero_pad: t.zero_pad,
                })
                .collect()
        };
        let sub_identifiers = rules.sub_identifiers.as_ref().and_then(|r| {
            r.regex()
                .map(|re| (spec.declared(&r.source), re, captures(&r.targets)))
        });
        let source_file = rules
            .source_file
            .as_ref()
            .and_then(|r| r.regex().map(|re| (re, captures(&r.targets))));
        let item_seq = rules.item_seq.as_ref().map(|r| ItemSeq {
            order: spec.declared(&r.order_field),
            target: spec.declared(&r.target),
            zero_pad: r.zero_pad,
        });

        Self {
            fields: &spec.fields,
            numbers: &spec.number_format,
            date_prefix,
            calendar,
            sub_identifiers,
            source_file,
            item_seq,
        }
    }

    /// Order date decoded from the leading characters of the order identifier.
    /// Leaves a date the source already supplied alone.
    pub fn apply_date_prefix(&self, record: &mut CanonicalRecord) {
        let Some(rule) = &self.date_prefix else {
            return;
        };
        if !record.get(rule.target).is_blank() {
            return;
        }
        let source = record.get(rule.source).render();
        if source.chars().count() < rule.length {
            return;
        }
        let prefix: String = source.chars().take(rule.length).collect();
        match NaiveDate::parse_from_str(&prefix, &rule.format) {
            Ok(date) => {
                let value = date_value(self.fields[rule.target].field_type, date);
                record.set(rule.target, value);
            }
            Err(e) => debug!(identifier = %source, error = %e, "Identifier has no decodable date prefix"),
        }
    }

    /// Weekday with Sunday=1 .. Saturday=7 and the ISO week of the date field.
    pub fn apply_calendar(&self, record: &mut CanonicalRecord) {
        let Some(rule) = &self.calendar else {
            return;
        };
        let Some(date) = record.get(rule.date).as_date() else {
            return;
        };
        if let Some(idx) = rule.weekday {
            let weekday = i64::from(date.weekday().num_days_from_sunday()) + 1;
            record.set(idx, int_value(self.fields[idx].field_type, weekday));
        }
        if let Some(idx) = rule.week {
            let week = i64::from(date.iso_week().week());
            record.set(idx, int_value(self.fields[idx].field_type, week));
        }
    }

    pub fn apply_sub_identifiers(&self, record: &mut CanonicalRecord) {
        let Some((source, regex, captures)) = &self.sub_identifiers else {
            return;
        };
        let text = record.get(*source).render();
        let Some(caps) = regex.captures(&text) else {
            return;
        };
        for (idx, value) in self.captured(&caps, captures) {
            record.set(idx, value);
        }
    }

    /// Values the file name carries for this batch, computed once per file.
    pub fn source_file_values(&self, file_name: &str) -> Vec<(usize, FieldValue)> {
        let Some((regex, captures)) = &self.source_file else {
            return Vec::new();
        };
        match regex.captures(file_name) {
            Some(caps) => self.captured(&caps, captures),
            None => {
                debug!(file = %file_name, "File name does not match source_file pattern");
                Vec::new()
            }
        }
    }

    fn captured(&self, caps: &regex::Captures<'_>, captures: &[Capture]) -> Vec<(usize, FieldValue)> {
        let mut out = Vec::with_capacity(captures.len());
        for capture in captures {
            let Some(m) = caps.get(capture.group) else {
                continue;
            };
            let raw = match capture.zero_pad {
                Some(width) => zero_pad(m.as_str(), width),
                None => m.as_str().to_string(),
            };
            let field = &self.fields[capture.target];
            match coerce::coerce(field, &raw, self.numbers) {
                Ok(value) => out.push((capture.target, value)),
                Err(reason) => debug!(field = %field.name, %reason, "Captured value not stored"),
            }
        }
        out
    }

    /// Order identifier the running item sequence is counted under.
    pub fn item_seq_order(&self, record: &CanonicalRecord) -> Option<String> {
        let rule = self.item_seq.as_ref()?;
        let order = record.get(rule.order);
        (!order.is_blank()).then(|| order.render())
    }

    /// Fills a blank item sequence with `emitted + 1`, where `emitted` counts
    /// the records of the same order already produced in this batch. A sourced
    /// sequence is padded to the same width so both export shapes key alike.
    pub fn apply_item_seq(&self, record: &mut CanonicalRecord, emitted: usize) {
        let Some(rule) = &self.item_seq else {
            return;
        };
        let current = record.get(rule.target);
        let seq = if current.is_blank() {
            (emitted + 1).to_string()
        } else if rule.zero_pad.is_some() {
            current.render()
        } else {
            return;
        };
        let raw = match rule.zero_pad {
            Some(width) => zero_pad(&seq, width),
            None => seq,
        };
        let field = &self.fields[rule.target];
        if let Ok(value) = coerce::coerce(field, &raw, self.numbers) {
            record.set(rule.target, value);
        }
    }
}

/// Left-pads digit strings with zeros; anything else is returned unchanged.
pub fn zero_pad(value: &str, width: usize) -> String {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        format!("{:0>width$}", value, width = width)
    } else {
        value.to_string()
    }
}

fn date_value(field_type: FieldType, date: NaiveDate) -> FieldValue {
    match field_type {
        FieldType::Date => FieldValue::Date(date),
        FieldType::Datetime => date
            .and_hms_opt(0, 0, 0)
            .map(FieldValue::DateTime)
            .unwrap_or(FieldValue::Date(date)),
        _ => FieldValue::Text(date.format(crate::domain::DATE_FORMAT).to_string()),
    }
}

fn int_value(field_type: FieldType, n: i64) -> FieldValue {
    match field_type {
        FieldType::Integer => FieldValue::Integer(n),
        FieldType::Decimal => FieldValue::Decimal(n as f64),
        _ => FieldValue::Text(n.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::mapping::tests::pchome_spec;

    fn record_with(spec: &MappingSpec, values: &[(&str, FieldValue)]) -> CanonicalRecord {
        let mut record = CanonicalRecord::blank(spec.width());
        for (name, value) in values {
            record.set(spec.index_of(name).unwrap(), value.clone());
        }
        record
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn test_zero_pad() {
        assert_eq!(zero_pad("7", 3), "007");
        assert_eq!(zero_pad("1234", 3), "1234");
        assert_eq!(zero_pad("A1", 3), "A1");
        assert_eq!(zero_pad("", 2), "");
    }

    #[test]
    fn test_date_prefix_decodes_order_number() {
        let spec = pchome_spec();
        let derive = Derivations::new(&spec);
        let mut record = record_with(&spec, &[("order_sn", text("20240107123456"))]);
        derive.apply_date_prefix(&mut record);
        let idx = spec.index_of("order_date").unwrap();
        assert_eq!(
            record.get(idx),
            &FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 7).unwrap())
        );
    }

    #[test]
    fn test_date_prefix_keeps_supplied_date_and_ignores_garbage() {
        let spec = pchome_spec();
        let derive = Derivations::new(&spec);
        let supplied = FieldValue::Date(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        let mut record = record_with(
            &spec,
            &[("order_sn", text("20240107123456")), ("order_date", supplied.clone())],
        );
        derive.apply_date_prefix(&mut record);
        assert_eq!(record.get(spec.index_of("order_date").unwrap()), &supplied);

        let mut garbage = record_with(&spec, &[("order_sn", text("ABCDEFGH99"))]);
        derive.apply_date_prefix(&mut garbage);
        assert!(garbage.get(spec.index_of("order_date").unwrap()).is_blank());
    }

    #[test]
    fn test_weekday_sunday_is_one_saturday_is_seven() {
        let spec = pchome_spec();
        let derive = Derivations::new(&spec);
        let weekday = spec.index_of("order_weekday").unwrap();
        let week = spec.index_of("order_week").unwrap();

        let sunday = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        let mut record = record_with(&spec, &[("order_date", FieldValue::Date(sunday))]);
        derive.apply_calendar(&mut record);
        assert_eq!(record.get(weekday), &FieldValue::Integer(1));
        assert_eq!(record.get(week), &FieldValue::Integer(1));

        let saturday = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        let mut record = record_with(&spec, &[("order_date", FieldValue::Date(saturday))]);
        derive.apply_calendar(&mut record);
        assert_eq!(record.get(weekday), &FieldValue::Integer(7));
    }

    #[test]
    fn test_sub_identifiers_parsed_and_padded() {
        let spec = pchome_spec();
        let derive = Derivations::new(&spec);
        let mut record = record_with(&spec, &[("product_name", text("Stoneware Mug (DGAB01-A900-7)"))]);
        derive.apply_sub_identifiers(&mut record);
        assert_eq!(record.get(spec.index_of("product_id").unwrap()), &text("DGAB01-A900"));
        assert_eq!(record.get(spec.index_of("sku_option").unwrap()), &text("007"));

        let mut plain = record_with(&spec, &[("product_name", text("Gift wrap"))]);
        derive.apply_sub_identifiers(&mut plain);
        assert!(plain.get(spec.index_of("product_id").unwrap()).is_blank());
    }

    #[test]
    fn test_source_file_name_captures_shop() {
        let mut raw = crate::pipeline::processing::mapping::tests::pchome_spec_json();
        let fields = raw["fields"].as_array_mut().unwrap();
        fields.push(serde_json::json!({ "name": "shop_name" }));
        fields.push(serde_json::json!({ "name": "shop_account" }));
        raw["derive"]["source_file"] = serde_json::json!({
            "pattern": "^(.+?)_([\\w\\d]+)_Order",
            "targets": [
                { "field": "shop_name", "group": 1 },
                { "field": "shop_account", "group": 2 }
            ]
        });
        let spec = MappingSpec::from_json_str(&raw.to_string()).unwrap();
        let derive = Derivations::new(&spec);

        let values = derive.source_file_values("MainStore_twmain01_Order.all.20240101_20240107.csv");
        assert_eq!(
            values,
            vec![
                (spec.index_of("shop_name").unwrap(), text("MainStore")),
                (spec.index_of("shop_account").unwrap(), text("twmain01")),
            ]
        );
        assert!(derive.source_file_values("orders.csv").is_empty());
        assert!(Derivations::new(&pchome_spec()).source_file_values("A_b_Order.csv").is_empty());
    }

    #[test]
    fn test_item_seq_counts_blank_and_pads_sourced_alike() {
        let spec = pchome_spec();
        let derive = Derivations::new(&spec);
        let idx = spec.index_of("item_seq").unwrap();

        let mut record = record_with(&spec, &[("order_sn", text("20240107000001"))]);
        assert_eq!(derive.item_seq_order(&record).as_deref(), Some("20240107000001"));
        derive.apply_item_seq(&mut record, 2);
        assert_eq!(record.get(idx), &text("03"));

        let mut sourced = record_with(
            &spec,
            &[("order_sn", text("20240107000001")), ("item_seq", text("5"))],
        );
        derive.apply_item_seq(&mut sourced, 0);
        assert_eq!(sourced.get(idx), &text("05"));

        let mut derived_first = record_with(&spec, &[("order_sn", text("20240107000009"))]);
        derive.apply_item_seq(&mut derived_first, 0);
        let mut sourced_first = record_with(
            &spec,
            &[("order_sn", text("20240107000009")), ("item_seq", text("1"))],
        );
        derive.apply_item_seq(&mut sourced_first, 0);
        assert_eq!(derived_first.get(idx), sourced_first.get(idx));
    }

    #[test]
    fn test_unpadded_item_seq_keeps_sourced_value() {
        let mut raw = crate::pipeline::processing::mapping::tests::pchome_spec_json();
        raw["derive"]["item_seq"] = serde_json::json!({ "order_field": "order_sn", "target": "item_seq" });
        let spec = MappingSpec::from_json_str(&raw.to_string()).unwrap();
        let derive = Derivations::new(&spec);
        let idx = spec.index_of("item_seq").unwrap();

        let mut sourced = record_with(
            &spec,
            &[("order_sn", text("20240107000001")), ("item_seq", text("1"))],
        );
        derive.apply_item_seq(&mut sourced, 4);
        assert_eq!(sourced.get(idx), &text("1"));

        let mut blank = record_with(&spec, &[("order_sn", text("20240107000001"))]);
        derive.apply_item_seq(&mut blank, 0);
        assert_eq!(blank.get(idx), &text("1"));
    }
}
