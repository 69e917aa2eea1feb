use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bluelink_provider::{ExternalLookupInput, ExternalStateInput, LinkStageInput, ResourceRegistry};
use bluelink_state::{
    diff_specs, DriftDifference, LinkDriftState, LinkReconciliationEntry, PreciseResourceStatus,
    ReconciliationKind, ReconciliationResult, RecommendedAction, ResourceDriftState,
    ResourceReconciliationEntry, ResourceStatus, StateContainer,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::report::{CheckRequest, ReconciliationScope};

/// Compare an instance's persisted state with external reality.
///
/// Per-node failures are collected into the result's `errors` slice; the
/// whole check is best-effort and never aborts siblings. The result is
/// persisted (indexed by changeset and instance) before returning, and any
/// drift evidence is written as drift records with the per-resource drift
/// flags updated in place.
pub async fn check(
    req: CheckRequest,
    store: Arc<dyn StateContainer>,
    registry: Arc<ResourceRegistry>,
) -> Result<ReconciliationResult, ReconcileError> {
    let mut instance = store
        .get_instance(req.instance_id)
        .await?
        .ok_or_else(|| ReconcileError::InstanceNotFound(req.instance_id.to_string()))?;

    let mut result = ReconciliationResult::new(req.instance_id, req.changeset_id, Utc::now());
    let mut dirty = false;
    check_node(
        &mut instance,
        None,
        &req.scope,
        &store,
        &registry,
        &mut result,
        &mut dirty,
    )
    .await?;

    result.has_drift = result
        .resources
        .iter()
        .any(|e| e.kind == ReconciliationKind::Drift)
        || result
            .links
            .iter()
            .any(|e| e.kind == ReconciliationKind::Drift);

    if dirty {
        store.save_instance(&instance).await?;
    }
    store.save_reconciliation_result(&result).await?;
    debug!(
        instance_id = %req.instance_id,
        has_drift = result.has_drift,
        entries = result.resources.len() + result.links.len(),
        "reconciliation check complete"
    );
    Ok(result)
}

fn qualify(child_path: &Option<String>, name: &str) -> String {
    match child_path {
        Some(path) => format!("{path}.{name}"),
        None => name.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn check_node<'a>(
    node: &'a mut bluelink_state::InstanceState,
    child_path: Option<String>,
    scope: &'a ReconciliationScope,
    store: &'a Arc<dyn StateContainer>,
    registry: &'a Arc<ResourceRegistry>,
    result: &'a mut ReconciliationResult,
    dirty: &'a mut bool,
) -> Pin<Box<dyn Future<Output = Result<(), ReconcileError>> + Send + 'a>> {
    Box::pin(async move {
        let node_instance_id = node.id;

        // ── Resources ─────────────────────────────────────────────────────────
        let resource_ids: Vec<_> = node.resources.keys().copied().collect();
        for resource_id in resource_ids {
            let Some(resource) = node.resources.get(&resource_id).cloned() else {
                continue;
            };
            let qualified = qualify(&child_path, &resource.name);
            if !scope.includes_resource(&qualified, resource.status) {
                continue;
            }

            let resolved = match registry.resolve(&resource.resource_type) {
                Ok(resolved) => resolved,
                Err(e) => {
                    result.errors.push(format!("resource {qualified}: {e}"));
                    continue;
                }
            };

            if resource.status.is_transitional() {
                // Interrupted by a crashed prior operation.
                let lookup = resolved
                    .handler
                    .lookup_external(&ExternalLookupInput {
                        instance_id: node_instance_id,
                        resource_name: resource.name.clone(),
                        resource_type: resource.resource_type.clone(),
                    })
                    .await;
                let entry = match lookup {
                    Ok(Some(found)) => ResourceReconciliationEntry {
                        resource_name: resource.name.clone(),
                        child_path: child_path.clone(),
                        kind: ReconciliationKind::Interrupted,
                        action: RecommendedAction::UpdateStatus,
                        exists_externally: Some(found.exists),
                        external_spec: found.external_spec,
                        difference: None,
                        suggested_precise_status: Some(suggested_status(
                            resource.status,
                            found.exists,
                        )),
                    },
                    Ok(None) => ResourceReconciliationEntry {
                        resource_name: resource.name.clone(),
                        child_path: child_path.clone(),
                        kind: ReconciliationKind::Interrupted,
                        action: RecommendedAction::ManualCleanupRequired,
                        exists_externally: None,
                        external_spec: None,
                        difference: None,
                        suggested_precise_status: None,
                    },
                    Err(e) => {
                        result.errors.push(format!("resource {qualified}: {e}"));
                        continue;
                    }
                };
                result.resources.push(entry);
                continue;
            }

            // Deployed resources: field-level drift against external state.
            let external = resolved
                .handler
                .external_state(&ExternalStateInput {
                    instance_id: node_instance_id,
                    resource_name: resource.name.clone(),
                    spec_data: resource.spec_data.clone(),
                })
                .await;
            match external {
                Ok(Some(external_spec)) => {
                    let diff = diff_specs(&resource.spec_data, &external_spec);
                    if diff.is_unchanged() {
                        if resource.drifted {
                            // External reality converged back; drop the evidence.
                            store.remove_resource_drift(resource.id).await?;
                            if let Some(r) = node.resources.get_mut(&resource_id) {
                                r.clear_drift();
                            }
                            *dirty = true;
                        }
                        if scope.names_explicitly(&qualified) {
                            result.resources.push(ResourceReconciliationEntry {
                                resource_name: resource.name.clone(),
                                child_path: child_path.clone(),
                                kind: ReconciliationKind::StateRefresh,
                                action: RecommendedAction::UpdateStatus,
                                exists_externally: Some(true),
                                external_spec: Some(external_spec),
                                difference: None,
                                suggested_precise_status: Some(resource.precise_status),
                            });
                        }
                        continue;
                    }

                    let difference = diff.into_difference();
                    let now = Utc::now();
                    store
                        .save_resource_drift(&ResourceDriftState {
                            resource_id: resource.id,
                            resource_name: resource.name.clone(),
                            instance_id: node_instance_id,
                            external_spec: external_spec.clone(),
                            difference: difference.clone(),
                            detected_at: now,
                        })
                        .await?;
                    if let Some(r) = node.resources.get_mut(&resource_id) {
                        r.set_drifted(now);
                    }
                    *dirty = true;

                    result.resources.push(ResourceReconciliationEntry {
                        resource_name: resource.name.clone(),
                        child_path: child_path.clone(),
                        kind: ReconciliationKind::Drift,
                        action: RecommendedAction::AcceptExternal,
                        exists_externally: Some(true),
                        external_spec: Some(external_spec),
                        difference: Some(difference),
                        suggested_precise_status: None,
                    });
                }
                Ok(None) => {
                    // Gone externally; the engine cannot safely repair this.
                    warn!(resource = %qualified, "resource missing externally");
                    let difference = missing_difference(&resource.spec_data);
                    result.resources.push(ResourceReconciliationEntry {
                        resource_name: resource.name.clone(),
                        child_path: child_path.clone(),
                        kind: ReconciliationKind::Drift,
                        action: RecommendedAction::ManualCleanupRequired,
                        exists_externally: Some(false),
                        external_spec: None,
                        difference: Some(difference),
                        suggested_precise_status: None,
                    });
                }
                Err(e) => {
                    result.errors.push(format!("resource {qualified}: {e}"));
                }
            }
        }

        // ── Links ─────────────────────────────────────────────────────────────
        let link_ids: Vec<_> = node.links.keys().cloned().collect();
        for link_id in link_ids {
            let Some(link) = node.links.get(&link_id).cloned() else {
                continue;
            };
            let qualified = qualify(&child_path, link_id.as_str());
            if !scope.includes_link(&qualified) {
                continue;
            }
            let Some((name_a, name_b)) = link_id.endpoints() else {
                result
                    .errors
                    .push(format!("link {qualified}: malformed link id"));
                continue;
            };

            let resource_a = node.resource_by_name(name_a).cloned();
            let resource_b = node.resource_by_name(name_b).cloned();
            let types = resource_a
                .as_ref()
                .map(|r| r.resource_type.clone())
                .zip(resource_b.as_ref().map(|r| r.resource_type.clone()));
            let Some((type_a, type_b)) = types else {
                result
                    .errors
                    .push(format!("link {qualified}: endpoint state missing"));
                continue;
            };

            let handler = match registry.link_handler(&type_a, &type_b) {
                Ok(handler) => handler,
                Err(e) => {
                    result.errors.push(format!("link {qualified}: {e}"));
                    continue;
                }
            };

            // Re-stage against the current endpoint states: any pending link
            // data update is drift.
            let staged = handler
                .stage_changes(&LinkStageInput {
                    instance_id: node_instance_id,
                    link_id: link_id.clone(),
                    resource_a,
                    resource_b,
                    current_link: Some(link.clone()),
                    label_selector: None,
                })
                .await;
            match staged {
                Ok(changes) if changes.link_data_updates.is_empty() => {
                    if link.drifted {
                        store.remove_link_drift(node_instance_id, &link_id).await?;
                        if let Some(l) = node.links.get_mut(&link_id) {
                            l.drifted = false;
                        }
                        *dirty = true;
                    }
                }
                Ok(changes) => {
                    let now = Utc::now();
                    store
                        .save_link_drift(&LinkDriftState {
                            link_id: link_id.clone(),
                            instance_id: node_instance_id,
                            link_data_updates: changes.link_data_updates.clone(),
                            detected_at: now,
                        })
                        .await?;
                    if let Some(l) = node.links.get_mut(&link_id) {
                        l.drifted = true;
                        l.last_drift_detected = Some(now);
                    }
                    *dirty = true;

                    result.links.push(LinkReconciliationEntry {
                        link_id: link_id.clone(),
                        child_path: child_path.clone(),
                        kind: ReconciliationKind::Drift,
                        action: RecommendedAction::AcceptExternal,
                        link_data_updates: changes.link_data_updates,
                    });
                }
                Err(e) => {
                    result.errors.push(format!("link {qualified}: {e}"));
                }
            }
        }

        // ── Children ──────────────────────────────────────────────────────────
        let child_names: Vec<String> = node.children.keys().cloned().collect();
        for name in child_names {
            let path = Some(qualify(&child_path, &name));
            if let Some(child) = node.children.get_mut(&name) {
                check_node(child, path, scope, store, registry, result, dirty).await?;
            }
        }

        Ok(())
    })
}

/// Target precise status for a cleanly interrupted resource.
fn suggested_status(status: ResourceStatus, exists: bool) -> PreciseResourceStatus {
    match (status, exists) {
        (ResourceStatus::Creating, true) => PreciseResourceStatus::Created,
        (ResourceStatus::Creating, false) => PreciseResourceStatus::CreateFailed,
        (ResourceStatus::Updating, true) => PreciseResourceStatus::Updated,
        (ResourceStatus::Updating, false) => PreciseResourceStatus::CreateFailed,
        (ResourceStatus::RollingBack, true) => PreciseResourceStatus::Updated,
        (ResourceStatus::RollingBack, false) => PreciseResourceStatus::CreateFailed,
        (ResourceStatus::Destroying, true) => PreciseResourceStatus::DestroyFailed,
        (ResourceStatus::Destroying, false) => PreciseResourceStatus::Destroyed,
        (other, _) => match other {
            ResourceStatus::Created => PreciseResourceStatus::Created,
            ResourceStatus::Updated => PreciseResourceStatus::Updated,
            _ => PreciseResourceStatus::Unknown,
        },
    }
}

/// Difference for a resource that vanished externally: every persisted
/// top-level field is gone.
fn missing_difference(spec_data: &Value) -> DriftDifference {
    let removed_fields = match spec_data {
        Value::Object(map) => {
            let mut fields: Vec<String> = map.keys().map(|k| format!("spec.{k}")).collect();
            fields.sort();
            fields
        }
        _ => vec!["spec".to_string()],
    };
    DriftDifference {
        new_fields: Vec::new(),
        modified_fields: Vec::new(),
        removed_fields,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::report::ReconciliationScope;
    use bluelink_domain::{InstanceId, LinkId, ResourceTypeId};
    use bluelink_provider::{ResourceLockTable, StubBehavior, StubProvider};
    use bluelink_state::{InstanceState, LinkState, MemfileStateContainer, ResourceState};
    use serde_json::json;
    use std::time::Duration;

    pub(crate) struct Harness {
        pub store: Arc<dyn StateContainer>,
        pub registry: Arc<ResourceRegistry>,
        pub provider: Arc<StubProvider>,
        _dir: tempfile::TempDir,
    }

    pub(crate) fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateContainer> = Arc::new(
            MemfileStateContainer::open(dir.path(), 1024 * 1024, 10 * 1024 * 1024).unwrap(),
        );
        let provider = Arc::new(StubProvider::new("aws"));
        let locks = Arc::new(ResourceLockTable::new(
            Duration::from_secs(180),
            Duration::from_millis(5),
        ));
        let mut registry = ResourceRegistry::new(Duration::from_millis(5), locks);
        registry.register_provider(provider.clone());
        Harness {
            store,
            registry: Arc::new(registry),
            provider,
            _dir: dir,
        }
    }

    fn table_type() -> ResourceTypeId {
        ResourceTypeId::new("aws/dynamodb/table")
    }

    async fn seed_instance(store: &Arc<dyn StateContainer>) -> InstanceState {
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut resource = ResourceState::new(instance_id, "ordersTable", table_type());
        resource.spec_data = json!({"id": "stub://aws/ordersTable", "tags": {"env": "prod"}});
        resource.mark_deployed(false);
        instance.put_resource(resource);
        store.save_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn detects_field_level_drift() {
        let h = harness();
        let instance = seed_instance(&h.store).await;
        h.provider.set_behavior(
            "ordersTable",
            StubBehavior {
                external_spec: Some(
                    json!({"id": "stub://aws/ordersTable", "tags": {"env": "staging"}}),
                ),
                ..Default::default()
            },
        );

        let result = check(
            CheckRequest {
                instance_id: instance.id,
                changeset_id: None,
                scope: ReconciliationScope::All,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        assert!(result.has_drift);
        assert_eq!(result.resources.len(), 1);
        let entry = &result.resources[0];
        assert_eq!(entry.kind, ReconciliationKind::Drift);
        assert_eq!(entry.action, RecommendedAction::AcceptExternal);
        let difference = entry.difference.as_ref().unwrap();
        assert!(difference
            .modified_fields
            .iter()
            .any(|f| f.field_path == "spec.tags.env"));

        // The drift flag and evidence are persisted.
        let saved = h.store.get_instance(instance.id).await.unwrap().unwrap();
        let resource = saved.resource_by_name("ordersTable").unwrap();
        assert!(resource.drifted);
        assert!(h
            .store
            .get_resource_drift(resource.id)
            .await
            .unwrap()
            .is_some());

        // Indexed under the instance, newest first.
        let indexed = h
            .store
            .reconciliation_results_for_instance(instance.id)
            .await
            .unwrap();
        assert_eq!(indexed[0].id, result.id);
    }

    #[tokio::test]
    async fn clean_instance_reports_nothing() {
        let h = harness();
        let instance = seed_instance(&h.store).await;

        let result = check(
            CheckRequest {
                instance_id: instance.id,
                changeset_id: None,
                scope: ReconciliationScope::All,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        assert!(!result.has_drift);
        assert!(result.resources.is_empty());
        assert!(result.links.is_empty());
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn interrupted_resource_with_lookup_suggests_status() {
        let h = harness();
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut resource = ResourceState::new(instance_id, "halfMade", table_type());
        resource.status = bluelink_state::ResourceStatus::Creating;
        instance.put_resource(resource);
        h.store.save_instance(&instance).await.unwrap();

        h.provider.set_behavior(
            "halfMade",
            StubBehavior {
                lookup_exists: Some(true),
                ..Default::default()
            },
        );

        let result = check(
            CheckRequest {
                instance_id,
                changeset_id: None,
                scope: ReconciliationScope::InterruptedOnly,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        assert_eq!(result.resources.len(), 1);
        let entry = &result.resources[0];
        assert_eq!(entry.kind, ReconciliationKind::Interrupted);
        assert_eq!(entry.action, RecommendedAction::UpdateStatus);
        assert_eq!(entry.exists_externally, Some(true));
        assert_eq!(
            entry.suggested_precise_status,
            Some(PreciseResourceStatus::Created)
        );
        // Interrupted state alone is not drift.
        assert!(!result.has_drift);
    }

    #[tokio::test]
    async fn interrupted_without_lookup_requires_manual_cleanup() {
        let h = harness();
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut resource = ResourceState::new(instance_id, "halfMade", table_type());
        resource.status = bluelink_state::ResourceStatus::Creating;
        instance.put_resource(resource);
        h.store.save_instance(&instance).await.unwrap();

        let result = check(
            CheckRequest {
                instance_id,
                changeset_id: None,
                scope: ReconciliationScope::All,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        assert_eq!(
            result.resources[0].action,
            RecommendedAction::ManualCleanupRequired
        );
    }

    #[tokio::test]
    async fn link_restage_detects_pending_updates() {
        let h = harness();
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());

        let mut api = ResourceState::new(
            instance_id,
            "ordersApi",
            ResourceTypeId::new("aws/lambda/function"),
        );
        api.spec_data = json!({"id": "stub://aws/ordersApi"});
        api.mark_deployed(false);
        instance.put_resource(api);

        let mut table = ResourceState::new(instance_id, "ordersTable", table_type());
        table.spec_data = json!({"id": "stub://aws/ordersTable"});
        table.mark_deployed(false);
        instance.put_resource(table);

        // Link persisted with no data: staging will propose the payload.
        let link_id = LinkId::from_endpoints("ordersApi", "ordersTable");
        instance
            .links
            .insert(link_id.clone(), LinkState::new(instance_id, link_id.clone()));
        h.store.save_instance(&instance).await.unwrap();

        let result = check(
            CheckRequest {
                instance_id,
                changeset_id: None,
                scope: ReconciliationScope::All,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        assert!(result.has_drift);
        assert_eq!(result.links.len(), 1);
        assert!(!result.links[0].link_data_updates.is_empty());
        assert!(h
            .store
            .get_link_drift(instance_id, &link_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn child_resources_carry_dotted_paths() {
        let h = harness();
        let root_id = InstanceId::generate();
        let mut root = InstanceState::new(root_id, "root", Utc::now());

        let child_id = InstanceId::generate();
        let mut child = InstanceState::new(child_id, "networking", Utc::now());
        let mut resource = ResourceState::new(child_id, "vpc", ResourceTypeId::new("aws/ec2/vpc"));
        resource.spec_data = json!({"id": "stub://aws/vpc", "cidr": "10.0.0.0/16"});
        resource.mark_deployed(false);
        child.put_resource(resource);
        root.children.insert("networking".into(), child);
        h.store.save_instance(&root).await.unwrap();

        h.provider.set_behavior(
            "vpc",
            StubBehavior {
                external_spec: Some(json!({"id": "stub://aws/vpc", "cidr": "10.1.0.0/16"})),
                ..Default::default()
            },
        );

        let result = check(
            CheckRequest {
                instance_id: root_id,
                changeset_id: None,
                scope: ReconciliationScope::All,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        assert_eq!(result.resources.len(), 1);
        assert_eq!(result.resources[0].child_path.as_deref(), Some("networking"));
    }

    #[tokio::test]
    async fn missing_external_resource_requires_manual_cleanup() {
        let h = harness();
        let instance = seed_instance(&h.store).await;
        h.provider.set_behavior(
            "ordersTable",
            StubBehavior {
                external_missing: true,
                ..Default::default()
            },
        );

        let result = check(
            CheckRequest {
                instance_id: instance.id,
                changeset_id: None,
                scope: ReconciliationScope::All,
            },
            h.store.clone(),
            h.registry.clone(),
        )
        .await
        .unwrap();

        let entry = &result.resources[0];
        assert_eq!(entry.action, RecommendedAction::ManualCleanupRequired);
        assert_eq!(entry.exists_externally, Some(false));
        assert!(entry
            .difference
            .as_ref()
            .unwrap()
            .removed_fields
            .contains(&"spec.tags".to_string()));
    }
}
