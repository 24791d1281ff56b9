use serde::Deserialize;

use crate::domain::{BusinessKey, CanonicalRecord};
use crate::pipeline::processing::mapping::MappingSpec;
use crate::pipeline::processing::normalize::RowRejection;

/// How a marketplace identifies one line item.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Ordered natural fields, e.g. order_date + order_sn + product_sku.
    /// Fields listed in `optional` may be blank (a product without variation).
    Composite {
        fields: Vec<String>,
        #[serde(default)]
        optional: Vec<String>,
    },
    /// Order identifier plus the export's own item number. Item numbers are
    /// taken verbatim; gaps (1, 3, 5) are legitimate and never renumbered.
    GappySequence {
        order_field: String,
        item_field: String,
    },
}

impl KeyPolicy {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            KeyPolicy::Composite { fields, optional } => fields
                .iter()
                .chain(optional.iter().filter(|o| !fields.contains(*o)))
                .map(String::as_str)
                .collect(),
            KeyPolicy::GappySequence {
                order_field,
                item_field,
            } => vec![order_field.as_str(), item_field.as_str()],
        }
    }
}

#[derive(Debug, Clone)]
struct KeyComponent {
    field: usize,
    name: String,
    may_be_blank: bool,
}

/// Builds the BusinessKey of a canonical record under the marketplace's policy.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    components: Vec<KeyComponent>,
}

impl KeyDeriver {
    pub fn new(spec: &MappingSpec) -> Self {
        let components = match &spec.key_policy {
            KeyPolicy::Composite { fields, optional } => fields
                .iter()
                .map(|name| KeyComponent {
                    field: spec.declared(name),
                    name: name.clone(),
                    may_be_blank: optional.contains(name),
                })
                .collect(),
            KeyPolicy::GappySequence {
                order_field,
                item_field,
            } => [order_field, item_field]
                .into_iter()
                .map(|name| KeyComponent {
                    field: spec.declared(name),
                    name: name.clone(),
                    may_be_blank: false,
                })
                .collect(),
        };
        Self { components }
    }

    pub fn derive(&self, record: &CanonicalRecord) -> Result<BusinessKey, RowRejection> {
        let mut parts = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let value = record.get(component.field);
            if value.is_blank() && !component.may_be_blank {
                return Err(RowRejection::MissingKey {
                    field: component.name.clone(),
                });
            }
            parts.push(value.render());
        }
        Ok(BusinessKey::new(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldValue;
    use serde_json::json;

    fn spec_with_policy(policy: serde_json::Value) -> MappingSpec {
        let raw = json!({
            "marketplace": "test",
            "key_policy": policy,
            "fields": [
                { "name": "order_date", "type": "date" },
                { "name": "order_sn" },
                { "name": "item_no" },
                { "name": "sku" }
            ]
        });
        MappingSpec::from_json_str(&raw.to_string()).unwrap()
    }

    fn record(values: [&str; 4]) -> CanonicalRecord {
        CanonicalRecord::from_values(
            values
                .iter()
                .map(|v| {
                    if v.is_empty() {
                        FieldValue::Blank
                    } else {
                        FieldValue::Text(v.to_string())
                    }
                })
                .collect(),
        )
    }

    #[test]
    fn test_gappy_item_numbers_stay_distinct() {
        let spec = spec_with_policy(json!({
            "kind": "gappy_sequence", "order_field": "order_sn", "item_field": "item_no"
        }));
        let deriver = KeyDeriver::new(&spec);
        let keys: Vec<BusinessKey> = ["1", "3", "5"]
            .iter()
            .map(|n| deriver.derive(&record(["", "ORD9", n, ""])).unwrap())
            .collect();
        assert_eq!(keys[0].parts(), ["ORD9".to_string(), "1".to_string()]);
        assert_eq!(keys[1].parts()[1], "3");
        assert_eq!(keys[2].parts()[1], "5");
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
    }

    #[test]
    fn test_gappy_requires_item_number() {
        let spec = spec_with_policy(json!({
            "kind": "gappy_sequence", "order_field": "order_sn", "item_field": "item_no"
        }));
        let deriver = KeyDeriver::new(&spec);
        let err = deriver.derive(&record(["", "ORD9", "", ""])).unwrap_err();
        assert_eq!(err, RowRejection::MissingKey { field: "item_no".to_string() });
    }

    #[test]
    fn test_composite_key_allows_optional_blank() {
        let spec = spec_with_policy(json!({
            "kind": "composite", "fields": ["order_date", "order_sn", "sku"], "optional": ["sku"]
        }));
        let deriver = KeyDeriver::new(&spec);
        let key = deriver.derive(&record(["20240101", "ORD001", "", ""])).unwrap();
        assert_eq!(key.parts(), ["20240101".to_string(), "ORD001".to_string(), String::new()]);

        let err = deriver.derive(&record(["20240101", "", "", "SKU-A"])).unwrap_err();
        assert_eq!(err, RowRejection::MissingKey { field: "order_sn".to_string() });
    }

    #[test]
    fn test_key_equality_is_by_value() {
        let spec = spec_with_policy(json!({
            "kind": "composite", "fields": ["order_date", "order_sn", "sku"]
        }));
        let deriver = KeyDeriver::new(&spec);
        let a = deriver.derive(&record(["20240101", "ORD001", "1", "SKU-A"])).unwrap();
        let b = deriver.derive(&record(["20240101", "ORD001", "2", "SKU-A"])).unwrap();
        assert_eq!(a, b);
    }
}
