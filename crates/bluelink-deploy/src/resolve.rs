use std::collections::HashMap;

use bluelink_domain::BlueprintDocument;
use bluelink_provider::path;
use bluelink_state::InstanceState;
use serde_json::Value;

use crate::error::DeployError;

/// Everything a `${...}` reference can resolve against.
pub struct ResolutionContext<'a> {
    pub blueprint: &'a BlueprintDocument,
    /// Accumulated instance state: upstream resources in earlier waves have
    /// already landed here. `None` while staging a brand-new instance.
    pub instance: Option<&'a InstanceState>,
    /// Pre-fetched data source results keyed by data source name.
    pub data_sources: &'a HashMap<String, Value>,
}

/// Resolve every `${...}` reference in a spec.
///
/// A string that is exactly one reference substitutes the referenced value
/// with its type intact; a reference embedded in a longer string
/// stringifies. Unresolvable references are errors.
pub fn resolve_spec(
    resource_name: &str,
    spec: &Value,
    ctx: &ResolutionContext<'_>,
) -> Result<Value, DeployError> {
    resolve_value(resource_name, spec, ctx, true)
}

/// Staging variant: leaves references it cannot resolve yet in place
/// instead of failing, so diffs can be computed before anything deploys.
pub fn resolve_spec_lenient(resource_name: &str, spec: &Value, ctx: &ResolutionContext<'_>) -> Value {
    resolve_value(resource_name, spec, ctx, false).unwrap_or_else(|_| spec.clone())
}

fn resolve_value(
    resource_name: &str,
    value: &Value,
    ctx: &ResolutionContext<'_>,
    strict: bool,
) -> Result<Value, DeployError> {
    match value {
        Value::String(s) => resolve_string(resource_name, s, ctx, strict),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, DeployError> = items
                .iter()
                .map(|item| resolve_value(resource_name, item, ctx, strict))
                .collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(resource_name, item, ctx, strict)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    resource_name: &str,
    s: &str,
    ctx: &ResolutionContext<'_>,
    strict: bool,
) -> Result<Value, DeployError> {
    // Whole-string single reference keeps the referenced value's type.
    if let Some(inner) = whole_reference(s) {
        return match resolve_reference(inner, ctx) {
            Some(value) => Ok(value),
            None if strict => Err(DeployError::ResolveFailed {
                resource: resource_name.to_string(),
                reference: inner.to_string(),
            }),
            None => Ok(Value::String(s.to_string())),
        };
    }

    // Embedded references stringify in place.
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let inner = tail[..end].trim();
        match resolve_reference(inner, ctx) {
            Some(Value::String(v)) => result.push_str(&v),
            Some(other) => result.push_str(&other.to_string()),
            None if strict => {
                return Err(DeployError::ResolveFailed {
                    resource: resource_name.to_string(),
                    reference: inner.to_string(),
                });
            }
            None => {
                result.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &tail[end + 1..];
    }
    result.push_str(rest);
    Ok(Value::String(result))
}

fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") {
        return None;
    }
    Some(inner.trim())
}

/// Supported forms:
/// - `variables.<name>`
/// - `resources.<name>.spec.<path>`
/// - `datasources.<name>.<path>`
/// - `children.<child>.exports.<name>`
fn resolve_reference(reference: &str, ctx: &ResolutionContext<'_>) -> Option<Value> {
    let (domain, rest) = reference.split_once('.')?;
    match domain {
        "variables" => ctx.blueprint.variables.get(rest).cloned(),
        "resources" => {
            let (name, field_path) = rest.split_once('.')?;
            let resource = ctx.instance?.resource_by_name(name)?;
            let field_path = field_path.strip_prefix("spec.").unwrap_or(field_path);
            path::get_path(&resource.spec_data, field_path).cloned()
        }
        "datasources" => {
            let (name, field_path) = rest.split_once('.')?;
            let data = ctx.data_sources.get(name)?;
            path::get_path(data, field_path).cloned()
        }
        "children" => {
            let (child, export_ref) = rest.split_once(".exports.")?;
            let child_instance = ctx.instance?.descendant(child)?;
            child_instance
                .exports
                .get(export_ref)
                .map(|e| e.value.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_domain::{ExportDefinition, InstanceId, ResourceTypeId};
    use bluelink_state::{ExportState, ResourceState};
    use chrono::Utc;
    use serde_json::json;

    fn context() -> (BlueprintDocument, InstanceState, HashMap<String, Value>) {
        let mut blueprint = BlueprintDocument::default();
        blueprint.variables.insert("env".into(), json!("prod"));
        blueprint
            .variables
            .insert("replicas".into(), json!(3));
        blueprint.exports.insert(
            "tableArn".into(),
            ExportDefinition {
                field: "ordersTable.spec.arn".into(),
                description: None,
            },
        );

        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut table = ResourceState::new(
            instance_id,
            "ordersTable",
            ResourceTypeId::new("aws/dynamodb/table"),
        );
        table.spec_data = json!({"arn": "arn:aws:dynamodb:orders", "capacity": {"read": 5}});
        instance.put_resource(table);

        let child_id = InstanceId::generate();
        let mut child = InstanceState::new(child_id, "networking", Utc::now());
        child.exports.insert(
            "vpcId".into(),
            ExportState {
                field: "vpc.spec.id".into(),
                value: json!("vpc-123"),
                description: None,
            },
        );
        instance.children.insert("networking".into(), child);

        let data = HashMap::from([("amis".to_string(), json!({"latest": "ami-42"}))]);
        (blueprint, instance, data)
    }

    #[test]
    fn whole_reference_keeps_type() {
        let (blueprint, instance, data) = context();
        let ctx = ResolutionContext {
            blueprint: &blueprint,
            instance: Some(&instance),
            data_sources: &data,
        };
        let resolved = resolve_spec(
            "r",
            &json!({"count": "${variables.replicas}"}),
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved["count"], json!(3));
    }

    #[test]
    fn embedded_reference_stringifies() {
        let (blueprint, instance, data) = context();
        let ctx = ResolutionContext {
            blueprint: &blueprint,
            instance: Some(&instance),
            data_sources: &data,
        };
        let resolved = resolve_spec(
            "r",
            &json!({"name": "orders-${variables.env}-${variables.replicas}"}),
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved["name"], json!("orders-prod-3"));
    }

    #[test]
    fn resource_spec_references_resolve_from_state() {
        let (blueprint, instance, data) = context();
        let ctx = ResolutionContext {
            blueprint: &blueprint,
            instance: Some(&instance),
            data_sources: &data,
        };
        let resolved = resolve_spec(
            "r",
            &json!({"target": "${resources.ordersTable.spec.arn}",
                    "read": "${resources.ordersTable.spec.capacity.read}"}),
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved["target"], json!("arn:aws:dynamodb:orders"));
        assert_eq!(resolved["read"], json!(5));
    }

    #[test]
    fn data_source_and_child_export_references() {
        let (blueprint, instance, data) = context();
        let ctx = ResolutionContext {
            blueprint: &blueprint,
            instance: Some(&instance),
            data_sources: &data,
        };
        let resolved = resolve_spec(
            "r",
            &json!({"ami": "${datasources.amis.latest}",
                    "vpc": "${children.networking.exports.vpcId}"}),
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved["ami"], json!("ami-42"));
        assert_eq!(resolved["vpc"], json!("vpc-123"));
    }

    #[test]
    fn unresolvable_reference_is_an_error_when_strict() {
        let (blueprint, instance, data) = context();
        let ctx = ResolutionContext {
            blueprint: &blueprint,
            instance: Some(&instance),
            data_sources: &data,
        };
        let err = resolve_spec("r", &json!({"x": "${resources.ghost.spec.id}"}), &ctx)
            .unwrap_err();
        assert!(matches!(err, DeployError::ResolveFailed { .. }));
    }

    #[test]
    fn lenient_resolution_leaves_unresolved_references() {
        let (blueprint, instance, data) = context();
        let ctx = ResolutionContext {
            blueprint: &blueprint,
            instance: Some(&instance),
            data_sources: &data,
        };
        let resolved = resolve_spec_lenient(
            "r",
            &json!({"x": "${resources.ghost.spec.id}", "env": "${variables.env}"}),
            &ctx,
        );
        assert_eq!(resolved["x"], json!("${resources.ghost.spec.id}"));
        assert_eq!(resolved["env"], json!("prod"));
    }
}
