use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bluelink_domain::{BlueprintDocument, ChangesetId, ChannelId, InstanceId, ResourceDefinition};
use bluelink_provider::LinkStageInput;
use bluelink_reconcile::{CheckRequest, ReconciliationScope};
use bluelink_state::{
    compute_spec_hash, diff_specs, BlueprintChanges, Changeset, ChangesetStatus, InstanceState,
    LinkChanges, ResourceChanges, ResourceState,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::deploy::Deployer;
use crate::error::DeployError;
use crate::events::StageEvent;
use crate::resolve::{resolve_spec_lenient, ResolutionContext};

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub instance_name: String,
    /// Stage against this existing instance; `None` looks the name up and
    /// falls back to a fresh-instance diff.
    pub instance_id: Option<InstanceId>,
    pub blueprint: BlueprintDocument,
    /// Stage a destroy instead of a deploy.
    pub destroy: bool,
    /// Overrides the configured drift-check flag.
    pub check_drift: Option<bool>,
}

impl Deployer {
    /// Compute and persist a changeset: the diff between a blueprint and the
    /// instance's current state, streamed as staging events. When drift
    /// checking is enabled the reconciliation result rides along on the
    /// changeset and gates the subsequent deploy.
    pub async fn stage_changes(&self, req: StageRequest) -> Result<Changeset, DeployError> {
        if !req.destroy {
            bluelink_graph::plan(&req.blueprint)?;
        }

        let instance = match req.instance_id {
            Some(id) => Some(
                self.store
                    .get_instance(id)
                    .await?
                    .ok_or_else(|| DeployError::InstanceNotFound(id.to_string()))?,
            ),
            None => match self.store.lookup_instance_id(&req.instance_name).await? {
                Some(id) => self.store.get_instance(id).await?,
                None => None,
            },
        };

        let mut changeset = Changeset::new(
            &req.instance_name,
            instance.as_ref().map(|i| i.id),
            req.blueprint.clone(),
            Utc::now(),
        );
        changeset.destroy = req.destroy;
        self.store.save_changeset(&changeset).await?;
        let channel = ChannelId::new(changeset.id.to_string());
        info!(changeset_id = %changeset.id, instance = %req.instance_name, "staging changes");

        let computed = if req.destroy {
            Ok(destroy_changes(instance.as_ref()))
        } else {
            self.diff_document(
                changeset.id,
                &req.blueprint,
                instance.as_ref(),
                &channel,
                true,
            )
            .await
        };
        let changes = match computed {
            Ok(changes) => changes,
            Err(e) => {
                // Partial changesets are discarded, not deployed.
                changeset.status = ChangesetStatus::Failed;
                self.store.save_changeset(&changeset).await.ok();
                return Err(e);
            }
        };

        let drift_enabled = req.check_drift.unwrap_or(self.config.drift_check_enabled);
        if drift_enabled && !req.destroy {
            if let Some(instance) = &instance {
                let result = bluelink_reconcile::check(
                    CheckRequest {
                        instance_id: instance.id,
                        changeset_id: Some(changeset.id),
                        scope: ReconciliationScope::All,
                    },
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                )
                .await?;
                if result.has_drift {
                    debug!(changeset_id = %changeset.id, "drift detected during staging");
                    self.bus
                        .publish(
                            &channel,
                            StageEvent::DriftDetected {
                                changeset_id: changeset.id,
                                reconciliation_result: result.clone(),
                            }
                            .payload(),
                            false,
                        )
                        .await?;
                    changeset.reconciliation_result = Some(result);
                }
            }
        }

        changeset.changes = changes.clone();
        changeset.status = ChangesetStatus::Complete;
        self.store.save_changeset(&changeset).await?;
        self.bus
            .publish(
                &channel,
                StageEvent::FinalBlueprintChanges {
                    changeset_id: changeset.id,
                    instance_id: changeset.instance_id,
                    changes,
                }
                .payload(),
                true,
            )
            .await?;
        Ok(changeset)
    }

    fn diff_document<'a>(
        &'a self,
        changeset_id: ChangesetId,
        doc: &'a BlueprintDocument,
        instance: Option<&'a InstanceState>,
        channel: &'a ChannelId,
        emit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<BlueprintChanges, DeployError>> + Send + 'a>> {
        Box::pin(async move {
            let mut changes = BlueprintChanges::default();
            let no_data: HashMap<String, Value> = HashMap::new();
            let resolution = ResolutionContext {
                blueprint: doc,
                instance,
                data_sources: &no_data,
            };

            // ── Resources ─────────────────────────────────────────────────────
            let mut resource_names: Vec<&String> = doc.resources.keys().collect();
            resource_names.sort();
            for name in resource_names {
                let def = &doc.resources[name];
                let desired = resolve_spec_lenient(name, &def.spec, &resolution);
                match instance.and_then(|i| i.resource_by_name(name)) {
                    None => {
                        let diff = diff_specs(&json!({}), &desired);
                        let resource_changes = ResourceChanges {
                            resource_type: def.resource_type.clone(),
                            new_fields: diff.new_fields,
                            modified_fields: diff.modified_fields,
                            removed_fields: Vec::new(),
                            unchanged_fields: Vec::new(),
                        };
                        if emit {
                            self.emit_stage(
                                channel,
                                StageEvent::ResourceChanges {
                                    changeset_id,
                                    resource_name: name.clone(),
                                    changes: resource_changes.clone(),
                                    new: true,
                                    removed: false,
                                },
                            )
                            .await?;
                        }
                        changes.new_resources.insert(name.clone(), resource_changes);
                    }
                    Some(existing) => {
                        // Provider-computed fields are not part of the
                        // desired spec; drop them before comparing.
                        let comparable =
                            strip_paths(&existing.spec_data, &existing.computed_fields);
                        if compute_spec_hash(&comparable) == compute_spec_hash(&desired) {
                            changes.unchanged_resources.push(name.clone());
                            continue;
                        }
                        let diff = diff_specs(&comparable, &desired);
                        if diff.is_unchanged() {
                            changes.unchanged_resources.push(name.clone());
                            continue;
                        }
                        let resource_changes = ResourceChanges {
                            resource_type: def.resource_type.clone(),
                            new_fields: diff.new_fields,
                            modified_fields: diff.modified_fields,
                            removed_fields: diff.removed_fields,
                            unchanged_fields: diff.unchanged_fields,
                        };
                        if emit {
                            self.emit_stage(
                                channel,
                                StageEvent::ResourceChanges {
                                    changeset_id,
                                    resource_name: name.clone(),
                                    changes: resource_changes.clone(),
                                    new: false,
                                    removed: false,
                                },
                            )
                            .await?;
                        }
                        changes
                            .resource_changes
                            .insert(name.clone(), resource_changes);
                    }
                }
            }

            if let Some(instance) = instance {
                let mut removed: Vec<String> = instance
                    .resource_ids
                    .keys()
                    .filter(|name| !doc.resources.contains_key(*name))
                    .cloned()
                    .collect();
                removed.sort();
                for name in removed {
                    if emit {
                        let resource_type = instance
                            .resource_by_name(&name)
                            .map(|r| r.resource_type.clone())
                            .unwrap_or_default();
                        self.emit_stage(
                            channel,
                            StageEvent::ResourceChanges {
                                changeset_id,
                                resource_name: name.clone(),
                                changes: ResourceChanges {
                                    resource_type,
                                    ..Default::default()
                                },
                                new: false,
                                removed: true,
                            },
                        )
                        .await?;
                    }
                    changes.removed_resources.push(name);
                }
            }

            // ── Links ─────────────────────────────────────────────────────────
            for def in &doc.links {
                let link_id = def.link_id();
                let existing_link = instance.and_then(|i| i.links.get(&link_id));
                match (instance, existing_link) {
                    (Some(instance), Some(existing)) => {
                        let type_a = endpoint_type(doc, instance, &def.resource_a);
                        let type_b = endpoint_type(doc, instance, &def.resource_b);
                        let (Some(type_a), Some(type_b)) = (type_a, type_b) else {
                            continue;
                        };
                        let handler = self.registry.link_handler(&type_a, &type_b)?;
                        let staged = handler
                            .stage_changes(&LinkStageInput {
                                instance_id: instance.id,
                                link_id: link_id.clone(),
                                resource_a: resource_state_dotted(instance, &def.resource_a),
                                resource_b: resource_state_dotted(instance, &def.resource_b),
                                current_link: Some(existing.clone()),
                                label_selector: def.label_selector.clone(),
                            })
                            .await?;
                        if staged.link_data_updates.is_empty() {
                            continue;
                        }
                        let link_changes = LinkChanges {
                            link_data_updates: staged.link_data_updates,
                        };
                        if emit {
                            self.emit_stage(
                                channel,
                                StageEvent::LinkChanges {
                                    changeset_id,
                                    link_id: link_id.clone(),
                                    changes: link_changes.clone(),
                                    new: false,
                                    removed: false,
                                },
                            )
                            .await?;
                        }
                        changes
                            .link_changes
                            .insert(link_id.to_string(), link_changes);
                    }
                    _ => {
                        if emit {
                            self.emit_stage(
                                channel,
                                StageEvent::LinkChanges {
                                    changeset_id,
                                    link_id: link_id.clone(),
                                    changes: LinkChanges::default(),
                                    new: true,
                                    removed: false,
                                },
                            )
                            .await?;
                        }
                        changes.new_links.push(link_id.to_string());
                    }
                }
            }

            if let Some(instance) = instance {
                let desired_links: Vec<String> =
                    doc.links.iter().map(|l| l.link_id().to_string()).collect();
                let mut removed: Vec<String> = instance
                    .links
                    .keys()
                    .map(|id| id.to_string())
                    .filter(|id| !desired_links.contains(id))
                    .collect();
                removed.sort();
                for link_id in removed {
                    if emit {
                        self.emit_stage(
                            channel,
                            StageEvent::LinkChanges {
                                changeset_id,
                                link_id: bluelink_domain::LinkId::new(link_id.clone()),
                                changes: LinkChanges::default(),
                                new: false,
                                removed: true,
                            },
                        )
                        .await?;
                    }
                    changes.removed_links.push(link_id);
                }
            }

            // ── Children ──────────────────────────────────────────────────────
            let mut child_names: Vec<&String> = doc.children.keys().collect();
            child_names.sort();
            for name in child_names {
                let child_doc = &doc.children[name];
                let child_instance = instance.and_then(|i| i.children.get(name.as_str()));
                let nested = self
                    .diff_document(changeset_id, child_doc, child_instance, channel, false)
                    .await?;
                if child_instance.is_none() {
                    changes.new_children.push(name.clone());
                }
                if emit && (child_instance.is_none() || !nested.is_empty()) {
                    self.emit_stage(
                        channel,
                        StageEvent::ChildChanges {
                            changeset_id,
                            child_name: name.clone(),
                            changes: nested.clone(),
                        },
                    )
                    .await?;
                }
                if child_instance.is_none() || !nested.is_empty() {
                    changes.child_changes.insert(name.clone(), nested);
                }
            }

            if let Some(instance) = instance {
                let mut removed: Vec<String> = instance
                    .children
                    .keys()
                    .filter(|name| !doc.children.contains_key(*name))
                    .cloned()
                    .collect();
                removed.sort();
                changes.removed_children.extend(removed);
            }

            Ok(changes)
        })
    }

    async fn emit_stage(
        &self,
        channel: &ChannelId,
        event: StageEvent,
    ) -> Result<(), DeployError> {
        self.bus.publish(channel, event.payload(), false).await?;
        Ok(())
    }
}

/// A staged destroy: everything currently in the instance is removed.
fn destroy_changes(instance: Option<&InstanceState>) -> BlueprintChanges {
    let mut changes = BlueprintChanges::default();
    let Some(instance) = instance else {
        return changes;
    };
    changes.removed_resources = instance.resource_ids.keys().cloned().collect();
    changes.removed_resources.sort();
    changes.removed_links = instance.links.keys().map(|id| id.to_string()).collect();
    changes.removed_links.sort();
    changes.removed_children = instance.children.keys().cloned().collect();
    changes.removed_children.sort();
    changes
}

/// Clone a spec with the given dotted paths removed.
fn strip_paths(value: &Value, paths: &[String]) -> Value {
    let mut out = value.clone();
    for path in paths {
        remove_path(&mut out, path);
    }
    out
}

fn remove_path(value: &mut Value, path: &str) {
    match path.split_once('.') {
        None => {
            if let Value::Object(map) = value {
                map.remove(path);
            }
        }
        Some((head, rest)) => {
            if let Value::Object(map) = value {
                if let Some(child) = map.get_mut(head) {
                    remove_path(child, rest);
                }
            }
        }
    }
}

/// Resolve an endpoint's resource type from the blueprint, falling back to
/// the persisted state for endpoints the document no longer defines.
fn endpoint_type(
    doc: &BlueprintDocument,
    instance: &InstanceState,
    name: &str,
) -> Option<bluelink_domain::ResourceTypeId> {
    find_resource_def(doc, name)
        .map(|d| d.resource_type.clone())
        .or_else(|| resource_state_dotted(instance, name).map(|r| r.resource_type))
}

fn find_resource_def<'a>(doc: &'a BlueprintDocument, name: &str) -> Option<&'a ResourceDefinition> {
    if let Some(def) = doc.resources.get(name) {
        return Some(def);
    }
    let (child, rest) = name.split_once('.')?;
    find_resource_def(doc.children.get(child)?, rest)
}

/// Endpoint state lookup that follows dotted child paths.
fn resource_state_dotted(instance: &InstanceState, name: &str) -> Option<ResourceState> {
    match name.split_once('.') {
        None => instance.resource_by_name(name).cloned(),
        Some((child, rest)) => resource_state_dotted(instance.children.get(child)?, rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_paths_removes_nested_fields() {
        let spec = json!({"id": "x", "spec": {"arn": "y", "name": "z"}});
        let stripped = strip_paths(&spec, &["id".to_string(), "spec.arn".to_string()]);
        assert_eq!(stripped, json!({"spec": {"name": "z"}}));
    }

    #[test]
    fn strip_paths_ignores_missing_fields() {
        let spec = json!({"a": 1});
        let stripped = strip_paths(&spec, &["b".to_string(), "c.d".to_string()]);
        assert_eq!(stripped, json!({"a": 1}));
    }

    #[test]
    fn destroy_changes_list_everything() {
        use bluelink_domain::{InstanceId, LinkId, ResourceTypeId};
        use bluelink_state::{LinkState, ResourceState};

        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        instance.put_resource(ResourceState::new(
            instance_id,
            "a",
            ResourceTypeId::new("t/c/k"),
        ));
        let link_id = LinkId::from_endpoints("a", "b");
        instance
            .links
            .insert(link_id.clone(), LinkState::new(instance_id, link_id));
        instance.children.insert(
            "net".into(),
            InstanceState::new(InstanceId::generate(), "net", Utc::now()),
        );

        let changes = destroy_changes(Some(&instance));
        assert_eq!(changes.removed_resources, vec!["a".to_string()]);
        assert_eq!(changes.removed_links, vec!["a::b".to_string()]);
        assert_eq!(changes.removed_children, vec!["net".to_string()]);
    }
}
