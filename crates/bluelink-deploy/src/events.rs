use bluelink_domain::{ChangesetId, InstanceId, LinkId};
use bluelink_state::{
    BlueprintChanges, InstanceStatus, LinkChanges, LinkStatus, PreciseLinkStatus,
    PreciseResourceStatus, ReconciliationResult, ResourceChanges, ResourceStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted on a deploy/destroy channel.
///
/// The orchestrator guarantees the first `deployment-update` carries the
/// instance ID, so consumers that do not know the ID in advance learn it
/// before any other event; `finish` is always last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DeployEvent {
    ResourceUpdate {
        instance_id: InstanceId,
        resource_name: String,
        status: ResourceStatus,
        precise_status: PreciseResourceStatus,
        #[serde(default)]
        rollback: bool,
        #[serde(default)]
        failure_reasons: Vec<String>,
    },
    ChildUpdate {
        instance_id: InstanceId,
        child_name: String,
        status: InstanceStatus,
        #[serde(default)]
        rollback: bool,
    },
    LinkUpdate {
        instance_id: InstanceId,
        link_id: LinkId,
        status: LinkStatus,
        precise_status: PreciseLinkStatus,
        #[serde(default)]
        rollback: bool,
    },
    DeploymentUpdate {
        instance_id: InstanceId,
        status: InstanceStatus,
    },
    Finish {
        instance_id: InstanceId,
        status: InstanceStatus,
    },
}

impl DeployEvent {
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Option<DeployEvent> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Events emitted on a staging channel. `final-blueprint-changes` is the
/// terminal event; `drift-detected` is informational, distinct from errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StageEvent {
    ResourceChanges {
        changeset_id: ChangesetId,
        resource_name: String,
        changes: ResourceChanges,
        new: bool,
        removed: bool,
    },
    ChildChanges {
        changeset_id: ChangesetId,
        child_name: String,
        changes: BlueprintChanges,
    },
    LinkChanges {
        changeset_id: ChangesetId,
        link_id: LinkId,
        changes: LinkChanges,
        new: bool,
        removed: bool,
    },
    DriftDetected {
        changeset_id: ChangesetId,
        reconciliation_result: ReconciliationResult,
    },
    FinalBlueprintChanges {
        changeset_id: ChangesetId,
        instance_id: Option<InstanceId>,
        changes: BlueprintChanges,
    },
}

impl StageEvent {
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Option<StageEvent> {
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_domain::InstanceId;

    #[test]
    fn deploy_events_are_kind_tagged() {
        let event = DeployEvent::DeploymentUpdate {
            instance_id: InstanceId::generate(),
            status: InstanceStatus::Preparing,
        };
        let payload = event.payload();
        assert_eq!(payload["kind"], "deployment-update");
        assert_eq!(payload["status"], "preparing");
        assert!(payload["instanceId"].is_string());

        let back = DeployEvent::from_payload(&payload).unwrap();
        assert!(matches!(back, DeployEvent::DeploymentUpdate { .. }));
    }

    #[test]
    fn stage_events_are_kind_tagged() {
        let event = StageEvent::FinalBlueprintChanges {
            changeset_id: ChangesetId::generate(),
            instance_id: None,
            changes: BlueprintChanges::default(),
        };
        let payload = event.payload();
        assert_eq!(payload["kind"], "final-blueprint-changes");
        assert!(payload["changesetId"].is_string());
    }
}
