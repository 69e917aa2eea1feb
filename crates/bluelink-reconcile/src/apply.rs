use std::sync::Arc;

use bluelink_state::{
    InstanceState, PreciseResourceStatus, RecommendedAction, ResourceStatus, StateContainer,
};
use tracing::debug;

use crate::error::ReconcileError;
use crate::report::{ApplyAction, ApplyOutcome, ApplyRequest, ApplyTarget};

/// Apply operator decisions from a reconciliation result.
///
/// Each action is all-or-nothing for its node; the run is best-effort —
/// per-node failures collect into the outcome's `errors` and do not abort
/// siblings. `accept-external` also clears the persisted drift evidence so
/// an immediately following check comes back clean.
pub async fn apply(
    req: ApplyRequest,
    store: Arc<dyn StateContainer>,
) -> Result<ApplyOutcome, ReconcileError> {
    let mut instance = store
        .get_instance(req.instance_id)
        .await?
        .ok_or_else(|| ReconcileError::InstanceNotFound(req.instance_id.to_string()))?;

    let mut outcome = ApplyOutcome::default();
    for action in &req.actions {
        match apply_one(&mut instance, action, &store).await {
            Ok(true) => outcome.applied += 1,
            Ok(false) => {} // manual-cleanup-required: surfaced, nothing to do
            Err(e) => outcome.errors.push(format!("{}: {e}", action.target)),
        }
    }

    store.save_instance(&instance).await?;
    debug!(
        instance_id = %req.instance_id,
        applied = outcome.applied,
        errors = outcome.errors.len(),
        "reconciliation apply complete"
    );
    Ok(outcome)
}

async fn apply_one(
    instance: &mut InstanceState,
    action: &ApplyAction,
    store: &Arc<dyn StateContainer>,
) -> Result<bool, ReconcileError> {
    if action.action == RecommendedAction::ManualCleanupRequired {
        return Ok(false);
    }

    match &action.target {
        ApplyTarget::Resource { name, child_path } => {
            let node = descend(instance, child_path)?;
            let resource_id = node
                .resource_ids
                .get(name)
                .copied()
                .ok_or_else(|| ReconcileError::Internal(format!("unknown resource '{name}'")))?;
            let resource = node
                .resources
                .get_mut(&resource_id)
                .ok_or_else(|| ReconcileError::Internal(format!("unknown resource '{name}'")))?;

            match action.action {
                RecommendedAction::AcceptExternal => {
                    let external = action.external_spec.clone().ok_or_else(|| {
                        ReconcileError::Internal(
                            "accept-external requires the external spec".to_string(),
                        )
                    })?;
                    // Overwrite persisted spec with external reality; the
                    // status stays deployed.
                    resource.spec_data = external;
                    resource.clear_drift();
                    store.remove_resource_drift(resource_id).await?;
                }
                RecommendedAction::UpdateStatus => {
                    let precise = action.new_precise_status.ok_or_else(|| {
                        ReconcileError::Internal(
                            "update-status requires a target status".to_string(),
                        )
                    })?;
                    resource.precise_status = precise;
                    resource.status = coarse_for(precise);
                }
                RecommendedAction::ManualCleanupRequired => return Ok(false),
            }
        }
        ApplyTarget::Link { link_id, child_path } => {
            let node = descend(instance, child_path)?;
            let node_id = node.id;
            let link = node
                .links
                .get_mut(link_id)
                .ok_or_else(|| ReconcileError::Internal(format!("unknown link '{link_id}'")))?;

            match action.action {
                RecommendedAction::AcceptExternal => {
                    for (consumer, value) in &action.link_data_updates {
                        link.data.insert(consumer.clone(), value.clone());
                    }
                    link.drifted = false;
                    store.remove_link_drift(node_id, link_id).await?;
                }
                RecommendedAction::UpdateStatus => {
                    return Err(ReconcileError::Internal(
                        "update-status does not apply to links".to_string(),
                    ));
                }
                RecommendedAction::ManualCleanupRequired => return Ok(false),
            }
        }
    }
    Ok(true)
}

fn descend<'a>(
    instance: &'a mut InstanceState,
    child_path: &Option<String>,
) -> Result<&'a mut InstanceState, ReconcileError> {
    match child_path {
        None => Ok(instance),
        Some(path) => instance
            .descendant_mut(path)
            .ok_or_else(|| ReconcileError::Internal(format!("unknown child path '{path}'"))),
    }
}

fn coarse_for(precise: PreciseResourceStatus) -> ResourceStatus {
    match precise {
        PreciseResourceStatus::Unknown => ResourceStatus::Pending,
        PreciseResourceStatus::Creating
        | PreciseResourceStatus::ConfigComplete
        | PreciseResourceStatus::Stabilising => ResourceStatus::Creating,
        PreciseResourceStatus::Created => ResourceStatus::Created,
        PreciseResourceStatus::CreateFailed => ResourceStatus::CreateFailed,
        PreciseResourceStatus::Updating | PreciseResourceStatus::UpdateConfigComplete => {
            ResourceStatus::Updating
        }
        PreciseResourceStatus::Updated => ResourceStatus::Updated,
        PreciseResourceStatus::UpdateFailed => ResourceStatus::UpdateFailed,
        PreciseResourceStatus::Destroying => ResourceStatus::Destroying,
        PreciseResourceStatus::Destroyed => ResourceStatus::Destroyed,
        PreciseResourceStatus::DestroyFailed => ResourceStatus::DestroyFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::check;
    use crate::report::{CheckRequest, ReconciliationScope};
    use bluelink_domain::{InstanceId, ResourceTypeId};
    use bluelink_provider::StubBehavior;
    use bluelink_state::{ReconciliationKind, ResourceState};
    use chrono::Utc;
    use serde_json::json;

    // Shared harness lives in check::tests.
    use crate::check::tests::{harness, Harness};

    async fn seed_drifted(h: &Harness) -> InstanceId {
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut resource = ResourceState::new(
            instance_id,
            "ordersTable",
            ResourceTypeId::new("aws/dynamodb/table"),
        );
        resource.spec_data = json!({"id": "stub://aws/ordersTable", "tags": {"env": "prod"}});
        resource.mark_deployed(false);
        instance.put_resource(resource);
        h.store.save_instance(&instance).await.unwrap();

        h.provider.set_behavior(
            "ordersTable",
            StubBehavior {
                external_spec: Some(
                    json!({"id": "stub://aws/ordersTable", "tags": {"env": "staging"}}),
                ),
                ..Default::default()
            },
        );
        instance_id
    }

    fn accept_external_actions(
        result: &bluelink_state::ReconciliationResult,
    ) -> Vec<ApplyAction> {
        result
            .resources
            .iter()
            .filter(|e| e.kind == ReconciliationKind::Drift)
            .map(|e| ApplyAction {
                target: ApplyTarget::Resource {
                    name: e.resource_name.clone(),
                    child_path: e.child_path.clone(),
                },
                action: e.action,
                external_spec: e.external_spec.clone(),
                new_precise_status: None,
                link_data_updates: Default::default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn check_apply_check_is_idempotent() {
        let h = harness();
        let instance_id = seed_drifted(&h).await;

        let first = check(
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
        assert!(first.has_drift);

        let outcome = apply(
            ApplyRequest {
                instance_id,
                actions: accept_external_actions(&first),
            },
            h.store.clone(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(outcome.errors.is_empty());

        // Persisted spec now mirrors external reality; status stays deployed.
        let saved = h.store.get_instance(instance_id).await.unwrap().unwrap();
        let resource = saved.resource_by_name("ordersTable").unwrap();
        assert_eq!(resource.spec_data["tags"]["env"], json!("staging"));
        assert!(resource.status.is_terminal_success());
        assert!(!resource.drifted);

        // No external change since: the second check is clean.
        let second = check(
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
        assert!(!second.has_drift);
        assert!(second.resources.is_empty());
        assert!(second.links.is_empty());
    }

    #[tokio::test]
    async fn update_status_transitions_without_touching_spec() {
        let h = harness();
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut resource = ResourceState::new(
            instance_id,
            "halfMade",
            ResourceTypeId::new("aws/dynamodb/table"),
        );
        resource.status = ResourceStatus::Creating;
        resource.spec_data = json!({"tableName": "half"});
        instance.put_resource(resource);
        h.store.save_instance(&instance).await.unwrap();

        let outcome = apply(
            ApplyRequest {
                instance_id,
                actions: vec![ApplyAction {
                    target: ApplyTarget::Resource {
                        name: "halfMade".into(),
                        child_path: None,
                    },
                    action: RecommendedAction::UpdateStatus,
                    external_spec: None,
                    new_precise_status: Some(PreciseResourceStatus::Created),
                    link_data_updates: Default::default(),
                }],
            },
            h.store.clone(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.applied, 1);

        let saved = h.store.get_instance(instance_id).await.unwrap().unwrap();
        let resource = saved.resource_by_name("halfMade").unwrap();
        assert_eq!(resource.status, ResourceStatus::Created);
        assert_eq!(resource.precise_status, PreciseResourceStatus::Created);
        assert_eq!(resource.spec_data, json!({"tableName": "half"}));
    }

    #[tokio::test]
    async fn per_action_errors_do_not_abort_siblings() {
        let h = harness();
        let instance_id = seed_drifted(&h).await;
        let first = check(
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

        let mut actions = vec![ApplyAction {
            target: ApplyTarget::Resource {
                name: "doesNotExist".into(),
                child_path: None,
            },
            action: RecommendedAction::AcceptExternal,
            external_spec: Some(json!({})),
            new_precise_status: None,
            link_data_updates: Default::default(),
        }];
        actions.extend(accept_external_actions(&first));

        let outcome = apply(
            ApplyRequest {
                instance_id,
                actions,
            },
            h.store.clone(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.applied, 1, "valid sibling still applies");
        assert_eq!(outcome.errors.len(), 1);
    }
}
