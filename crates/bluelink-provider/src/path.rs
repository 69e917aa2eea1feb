use serde_json::Value;

/// Read a dotted path (`spec.capacity.read` or `items.0.arn`) out of a JSON
/// value. Numeric segments index arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `new` at a dotted path, creating intermediate objects as needed.
/// Array segments must already exist; a missing object segment is created.
pub fn set_path(value: &mut Value, path: &str, new: Value) {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        // Scalars along the path are replaced by objects so the write lands.
        if !matches!(current, Value::Object(_) | Value::Array(_)) {
            *current = Value::Object(serde_json::Map::new());
        }

        if i == segments.len() - 1 {
            match current {
                Value::Object(map) => {
                    map.insert(segment.to_string(), new);
                }
                Value::Array(items) => {
                    if let Some(slot) = segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|ix| items.get_mut(ix))
                    {
                        *slot = new;
                    }
                }
                _ => {}
            }
            return;
        }

        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            Value::Array(items) => {
                match segment.parse::<usize>().ok().and_then(|ix| items.get_mut(ix)) {
                    Some(item) => item,
                    None => return,
                }
            }
            _ => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_reads_nested_objects_and_arrays() {
        let v = json!({"spec": {"tables": [{"arn": "arn:a"}, {"arn": "arn:b"}]}});
        assert_eq!(get_path(&v, "spec.tables.1.arn"), Some(&json!("arn:b")));
        assert_eq!(get_path(&v, "spec.missing"), None);
        assert_eq!(get_path(&v, "spec.tables.9.arn"), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut v = json!({});
        set_path(&mut v, "spec.capacity.read", json!(5));
        assert_eq!(v, json!({"spec": {"capacity": {"read": 5}}}));
    }

    #[test]
    fn set_overwrites_existing_value() {
        let mut v = json!({"id": "old"});
        set_path(&mut v, "id", json!("new"));
        assert_eq!(v, json!({"id": "new"}));
    }

    #[test]
    fn set_indexes_existing_arrays() {
        let mut v = json!({"items": ["a", "b"]});
        set_path(&mut v, "items.1", json!("c"));
        assert_eq!(v, json!({"items": ["a", "c"]}));
    }
}
