use serde_json::Value;

use crate::changes::FieldChange;
use crate::records::DriftDifference;

/// Field-level diff between two spec payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecDiff {
    pub new_fields: Vec<FieldChange>,
    pub modified_fields: Vec<FieldChange>,
    pub removed_fields: Vec<String>,
    pub unchanged_fields: Vec<String>,
}

impl SpecDiff {
    pub fn is_unchanged(&self) -> bool {
        self.new_fields.is_empty()
            && self.modified_fields.is_empty()
            && self.removed_fields.is_empty()
    }

    pub fn into_difference(self) -> DriftDifference {
        DriftDifference {
            new_fields: self.new_fields,
            modified_fields: self.modified_fields,
            removed_fields: self.removed_fields,
        }
    }
}

/// Compare two specs field by field, producing dotted paths rooted at `spec`.
///
/// Objects are descended; arrays and scalars compare atomically at their
/// path. `prev` is the persisted value, `next` the desired/external one.
pub fn diff_specs(prev: &Value, next: &Value) -> SpecDiff {
    let mut diff = SpecDiff::default();
    diff_value("spec", prev, next, &mut diff);
    // Deterministic output regardless of object iteration order.
    diff.new_fields.sort_by(|a, b| a.field_path.cmp(&b.field_path));
    diff.modified_fields
        .sort_by(|a, b| a.field_path.cmp(&b.field_path));
    diff.removed_fields.sort();
    diff.unchanged_fields.sort();
    diff
}

fn diff_value(path: &str, prev: &Value, next: &Value, out: &mut SpecDiff) {
    match (prev, next) {
        (Value::Object(prev_map), Value::Object(next_map)) => {
            for (key, prev_val) in prev_map {
                let child_path = format!("{path}.{key}");
                match next_map.get(key) {
                    Some(next_val) => diff_value(&child_path, prev_val, next_val, out),
                    None => out.removed_fields.push(child_path),
                }
            }
            for (key, next_val) in next_map {
                if !prev_map.contains_key(key) {
                    out.new_fields.push(FieldChange {
                        field_path: format!("{path}.{key}"),
                        prev_value: None,
                        new_value: Some(next_val.clone()),
                    });
                }
            }
        }
        _ if prev == next => out.unchanged_fields.push(path.to_string()),
        _ => out.modified_fields.push(FieldChange {
            field_path: path.to_string(),
            prev_value: Some(prev.clone()),
            new_value: Some(next.clone()),
        }),
    }
}
