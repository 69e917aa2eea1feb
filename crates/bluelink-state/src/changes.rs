use std::collections::HashMap;

use bluelink_domain::{BlueprintDocument, ChangesetId, InstanceId, ResourceTypeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::records::ReconciliationResult;

/// One field-level difference between two spec payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Dotted path from the spec root, e.g. `spec.tags`.
    pub field_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChanges {
    pub resource_type: ResourceTypeId,
    #[serde(default)]
    pub new_fields: Vec<FieldChange>,
    #[serde(default)]
    pub modified_fields: Vec<FieldChange>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
    #[serde(default)]
    pub unchanged_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkChanges {
    /// Pending link data payload changes keyed by consumer resource name.
    #[serde(default)]
    pub link_data_updates: HashMap<String, Value>,
}

/// The computed diff between a blueprint document and the current state of
/// an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintChanges {
    #[serde(default)]
    pub new_resources: HashMap<String, ResourceChanges>,
    #[serde(default)]
    pub resource_changes: HashMap<String, ResourceChanges>,
    #[serde(default)]
    pub removed_resources: Vec<String>,
    #[serde(default)]
    pub unchanged_resources: Vec<String>,
    #[serde(default)]
    pub new_links: Vec<String>,
    #[serde(default)]
    pub link_changes: HashMap<String, LinkChanges>,
    #[serde(default)]
    pub removed_links: Vec<String>,
    #[serde(default)]
    pub new_children: Vec<String>,
    #[serde(default)]
    pub child_changes: HashMap<String, BlueprintChanges>,
    #[serde(default)]
    pub removed_children: Vec<String>,
}

impl BlueprintChanges {
    /// True when the deploy would be a no-op.
    pub fn is_empty(&self) -> bool {
        self.new_resources.is_empty()
            && self.resource_changes.is_empty()
            && self.removed_resources.is_empty()
            && self.new_links.is_empty()
            && self.link_changes.is_empty()
            && self.removed_links.is_empty()
            && self.new_children.is_empty()
            && self.child_changes.values().all(|c| c.is_empty())
            && self.removed_children.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangesetStatus {
    StagingInProgress,
    Complete,
    Failed,
}

/// A staged set of changes. Immutable once `status` is `Complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub id: ChangesetId,
    /// Present when staging against an existing instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    pub instance_name: String,
    /// True for a staged destroy rather than a deploy.
    #[serde(default)]
    pub destroy: bool,
    pub status: ChangesetStatus,
    /// The document the changes were staged from; executed by the deploy.
    pub blueprint: BlueprintDocument,
    pub changes: BlueprintChanges,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_result: Option<ReconciliationResult>,
    pub created_at: DateTime<Utc>,
}

impl Changeset {
    pub fn new(
        instance_name: impl Into<String>,
        instance_id: Option<InstanceId>,
        blueprint: BlueprintDocument,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ChangesetId::generate(),
            instance_id,
            instance_name: instance_name.into(),
            destroy: false,
            status: ChangesetStatus::StagingInProgress,
            blueprint,
            changes: BlueprintChanges::default(),
            reconciliation_result: None,
            created_at: now,
        }
    }
}
