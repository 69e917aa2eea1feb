use std::collections::HashMap;

use bluelink_domain::{InstanceId, LinkId, ResourceId, ResourceTypeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ── Instance lifecycle ────────────────────────────────────────────────────────

/// The lifecycle state of a blueprint instance.
///
/// Transitions:
///   Preparing → Deploying → Deployed | DeployFailed
///   Deploying → RollingBack → Deployed (prior state) | DeployFailed
///   Deployed → Destroying → Destroyed | DestroyFailed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    #[default]
    Preparing,
    Deploying,
    Deployed,
    DeployFailed,
    RollingBack,
    Destroying,
    Destroyed,
    DestroyFailed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Preparing => "preparing",
            InstanceStatus::Deploying => "deploying",
            InstanceStatus::Deployed => "deployed",
            InstanceStatus::DeployFailed => "deploy-failed",
            InstanceStatus::RollingBack => "rolling-back",
            InstanceStatus::Destroying => "destroying",
            InstanceStatus::Destroyed => "destroyed",
            InstanceStatus::DestroyFailed => "destroy-failed",
        };
        write!(f, "{}", s)
    }
}

// ── Resource lifecycle ────────────────────────────────────────────────────────

/// Coarse resource lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    #[default]
    Pending,
    Creating,
    Created,
    CreateFailed,
    Updating,
    Updated,
    UpdateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl ResourceStatus {
    /// True for statuses a deployed resource can legitimately rest in.
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Created | ResourceStatus::Updated | ResourceStatus::RolledBack
        )
    }

    /// True for in-flight statuses a crashed operation leaves behind.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Creating
                | ResourceStatus::Updating
                | ResourceStatus::Destroying
                | ResourceStatus::RollingBack
        )
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Creating => "creating",
            ResourceStatus::Created => "created",
            ResourceStatus::CreateFailed => "create-failed",
            ResourceStatus::Updating => "updating",
            ResourceStatus::Updated => "updated",
            ResourceStatus::UpdateFailed => "update-failed",
            ResourceStatus::Destroying => "destroying",
            ResourceStatus::Destroyed => "destroyed",
            ResourceStatus::DestroyFailed => "destroy-failed",
            ResourceStatus::RollingBack => "rolling-back",
            ResourceStatus::RolledBack => "rolled-back",
            ResourceStatus::RollbackFailed => "rollback-failed",
        };
        write!(f, "{}", s)
    }
}

/// Fine-grained phase within the coarse lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PreciseResourceStatus {
    #[default]
    Unknown,
    Creating,
    /// Provider accepted the spec; computed fields are merged.
    ConfigComplete,
    /// Waiting for the provider's has-stabilised predicate.
    Stabilising,
    Created,
    CreateFailed,
    Updating,
    UpdateConfigComplete,
    Updated,
    UpdateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
}

impl std::fmt::Display for PreciseResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PreciseResourceStatus::Unknown => "unknown",
            PreciseResourceStatus::Creating => "creating",
            PreciseResourceStatus::ConfigComplete => "config-complete",
            PreciseResourceStatus::Stabilising => "stabilising",
            PreciseResourceStatus::Created => "created",
            PreciseResourceStatus::CreateFailed => "create-failed",
            PreciseResourceStatus::Updating => "updating",
            PreciseResourceStatus::UpdateConfigComplete => "update-config-complete",
            PreciseResourceStatus::Updated => "updated",
            PreciseResourceStatus::UpdateFailed => "update-failed",
            PreciseResourceStatus::Destroying => "destroying",
            PreciseResourceStatus::Destroyed => "destroyed",
            PreciseResourceStatus::DestroyFailed => "destroy-failed",
        };
        write!(f, "{}", s)
    }
}

// ── Link lifecycle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    #[default]
    Pending,
    Creating,
    Created,
    CreateFailed,
    Updating,
    Updated,
    UpdateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Creating => "creating",
            LinkStatus::Created => "created",
            LinkStatus::CreateFailed => "create-failed",
            LinkStatus::Updating => "updating",
            LinkStatus::Updated => "updated",
            LinkStatus::UpdateFailed => "update-failed",
            LinkStatus::Destroying => "destroying",
            LinkStatus::Destroyed => "destroyed",
            LinkStatus::DestroyFailed => "destroy-failed",
        };
        write!(f, "{}", s)
    }
}

/// The link state machine: resource-A update, resource-B update,
/// intermediary management and rollback phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PreciseLinkStatus {
    #[default]
    Pending,
    StagingChanges,
    UpdatingResourceA,
    ResourceAUpdated,
    ResourceAUpdateFailed,
    UpdatingResourceB,
    ResourceBUpdated,
    ResourceBUpdateFailed,
    CreatingIntermediaries,
    UpdatingIntermediaries,
    IntermediariesUpdated,
    IntermediaryUpdateFailed,
    Complete,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl std::fmt::Display for PreciseLinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PreciseLinkStatus::Pending => "pending",
            PreciseLinkStatus::StagingChanges => "staging-changes",
            PreciseLinkStatus::UpdatingResourceA => "updating-resource-a",
            PreciseLinkStatus::ResourceAUpdated => "resource-a-updated",
            PreciseLinkStatus::ResourceAUpdateFailed => "resource-a-update-failed",
            PreciseLinkStatus::UpdatingResourceB => "updating-resource-b",
            PreciseLinkStatus::ResourceBUpdated => "resource-b-updated",
            PreciseLinkStatus::ResourceBUpdateFailed => "resource-b-update-failed",
            PreciseLinkStatus::CreatingIntermediaries => "creating-intermediaries",
            PreciseLinkStatus::UpdatingIntermediaries => "updating-intermediaries",
            PreciseLinkStatus::IntermediariesUpdated => "intermediaries-updated",
            PreciseLinkStatus::IntermediaryUpdateFailed => "intermediary-update-failed",
            PreciseLinkStatus::Complete => "complete",
            PreciseLinkStatus::RollingBack => "rolling-back",
            PreciseLinkStatus::RolledBack => "rolled-back",
            PreciseLinkStatus::RollbackFailed => "rollback-failed",
        };
        write!(f, "{}", s)
    }
}

// ── Provenance & durations ────────────────────────────────────────────────────

/// Which engine and plugin provisioned a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProvenance {
    pub engine_version: String,
    pub provider_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCompletionDurations {
    /// Time to reach config-complete, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_complete_ms: Option<u64>,
    /// Total time including stabilisation, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
    /// One entry per deploy attempt, milliseconds.
    #[serde(default)]
    pub attempt_durations_ms: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCompletionDurations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_a_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_b_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediaries_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDurations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
}

// ── ResourceState ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    /// Stable across updates once the resource is first deployed.
    pub id: ResourceId,
    /// Logical name within the blueprint.
    pub name: String,
    pub resource_type: ResourceTypeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    pub instance_id: InstanceId,
    pub status: ResourceStatus,
    pub precise_status: PreciseResourceStatus,
    /// Resolved spec merged with provider-computed fields.
    pub spec_data: Value,
    /// Dotted paths within `spec_data` the provider computed; change staging
    /// excludes these from desired-vs-persisted diffs.
    #[serde(default)]
    pub computed_fields: Vec<String>,
    pub metadata: bluelink_domain::ResourceMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<SystemProvenance>,
    #[serde(default)]
    pub depends_on_resources: Vec<String>,
    #[serde(default)]
    pub depends_on_children: Vec<String>,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub durations: ResourceCompletionDurations,
    #[serde(default)]
    pub drifted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drift_detected: Option<DateTime<Utc>>,
}

impl ResourceState {
    pub fn new(
        instance_id: InstanceId,
        name: impl Into<String>,
        resource_type: ResourceTypeId,
    ) -> Self {
        Self {
            id: ResourceId::generate(),
            name: name.into(),
            resource_type,
            template_name: None,
            instance_id,
            status: ResourceStatus::Pending,
            precise_status: PreciseResourceStatus::Unknown,
            spec_data: Value::Null,
            computed_fields: Vec::new(),
            metadata: bluelink_domain::ResourceMetadata::default(),
            provenance: None,
            depends_on_resources: Vec::new(),
            depends_on_children: Vec::new(),
            failure_reasons: Vec::new(),
            durations: ResourceCompletionDurations::default(),
            drifted: false,
            last_drift_detected: None,
        }
    }

    /// Transition to terminal success after a create or update.
    pub fn mark_deployed(&mut self, update: bool) {
        if update {
            self.status = ResourceStatus::Updated;
            self.precise_status = PreciseResourceStatus::Updated;
        } else {
            self.status = ResourceStatus::Created;
            self.precise_status = PreciseResourceStatus::Created;
        }
        self.failure_reasons.clear();
    }

    pub fn mark_deploy_failed(&mut self, update: bool, reason: impl Into<String>) {
        if update {
            self.status = ResourceStatus::UpdateFailed;
            self.precise_status = PreciseResourceStatus::UpdateFailed;
        } else {
            self.status = ResourceStatus::CreateFailed;
            self.precise_status = PreciseResourceStatus::CreateFailed;
        }
        self.failure_reasons.push(reason.into());
    }

    pub fn set_drifted(&mut self, at: DateTime<Utc>) {
        self.drifted = true;
        self.last_drift_detected = Some(at);
    }

    pub fn clear_drift(&mut self) {
        self.drifted = false;
    }
}

// ── LinkState ─────────────────────────────────────────────────────────────────

/// Intermediary resources are owned by the link, not by the blueprint,
/// so they carry a reduced state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkIntermediaryResourceState {
    pub resource_id: ResourceId,
    pub resource_type: ResourceTypeId,
    pub status: ResourceStatus,
    pub spec_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub id: LinkId,
    pub instance_id: InstanceId,
    pub status: LinkStatus,
    pub precise_status: PreciseLinkStatus,
    /// Link data payloads keyed by consumer resource name.
    #[serde(default)]
    pub data: HashMap<String, Value>,
    /// Reverse index: consumer resource field path → link data path.
    #[serde(default)]
    pub resource_data_mappings: HashMap<String, String>,
    #[serde(default)]
    pub intermediary_resource_states: Vec<LinkIntermediaryResourceState>,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    #[serde(default)]
    pub durations: LinkCompletionDurations,
    #[serde(default)]
    pub drifted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drift_detected: Option<DateTime<Utc>>,
}

impl LinkState {
    pub fn new(instance_id: InstanceId, id: LinkId) -> Self {
        Self {
            id,
            instance_id,
            status: LinkStatus::Pending,
            precise_status: PreciseLinkStatus::Pending,
            data: HashMap::new(),
            resource_data_mappings: HashMap::new(),
            intermediary_resource_states: Vec::new(),
            failure_reasons: Vec::new(),
            durations: LinkCompletionDurations::default(),
            drifted: false,
            last_drift_detected: None,
        }
    }
}

// ── ExportState ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportState {
    /// Dotted path the export was resolved from.
    pub field: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── InstanceState ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub id: InstanceId,
    /// User-provided unique name.
    pub name: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deploy_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_update_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub durations: InstanceDurations,
    /// Logical resource name → resource ID.
    #[serde(default)]
    pub resource_ids: HashMap<String, ResourceId>,
    #[serde(default)]
    pub resources: HashMap<ResourceId, ResourceState>,
    #[serde(default)]
    pub links: HashMap<LinkId, LinkState>,
    /// Nested child instances keyed by child name.
    #[serde(default)]
    pub children: HashMap<String, InstanceState>,
    #[serde(default)]
    pub exports: HashMap<String, ExportState>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InstanceState {
    pub fn new(id: InstanceId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            status: InstanceStatus::Preparing,
            created_at: now,
            last_deploy_attempt_at: None,
            last_deployed_at: None,
            last_status_update_at: Some(now),
            durations: InstanceDurations::default(),
            resource_ids: HashMap::new(),
            resources: HashMap::new(),
            links: HashMap::new(),
            children: HashMap::new(),
            exports: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn set_status(&mut self, status: InstanceStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_status_update_at = Some(now);
    }

    pub fn resource_by_name(&self, name: &str) -> Option<&ResourceState> {
        let id = self.resource_ids.get(name)?;
        self.resources.get(id)
    }

    /// Insert or replace a resource, keeping the name index consistent.
    pub fn put_resource(&mut self, state: ResourceState) {
        self.resource_ids.insert(state.name.clone(), state.id);
        self.resources.insert(state.id, state);
    }

    pub fn remove_resource(&mut self, id: ResourceId) -> Option<ResourceState> {
        let removed = self.resources.remove(&id)?;
        self.resource_ids.remove(&removed.name);
        Some(removed)
    }

    /// Walk a dotted child path (`networking.subnets`) to a descendant.
    pub fn descendant(&self, child_path: &str) -> Option<&InstanceState> {
        let mut current = self;
        for segment in child_path.split('.') {
            current = current.children.get(segment)?;
        }
        Some(current)
    }

    pub fn descendant_mut(&mut self, child_path: &str) -> Option<&mut InstanceState> {
        let mut current = self;
        for segment in child_path.split('.') {
            current = current.children.get_mut(segment)?;
        }
        Some(current)
    }

    /// True when a resource with the given name exists here or in a
    /// descendant child (dotted paths).
    pub fn has_resource_named(&self, name: &str) -> bool {
        if self.resource_by_name(name).is_some() {
            return true;
        }
        match name.split_once('.') {
            Some((child, rest)) => self
                .children
                .get(child)
                .map_or(false, |c| c.has_resource_named(rest)),
            None => false,
        }
    }
}

// ── Canonical spec hash ───────────────────────────────────────────────────────

/// Serialize `value` to canonical JSON (object keys sorted) and return its
/// SHA-256 hex digest. Used as the unchanged fast-path during change staging.
pub fn compute_spec_hash<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(Value::Null);
    let canonical = sort_json_keys(v);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

/// Recursively sort JSON object keys so map field ordering doesn't affect
/// the hash.
fn sort_json_keys(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(compute_spec_hash(&a), compute_spec_hash(&b));
    }

    #[test]
    fn spec_hash_detects_value_change() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(compute_spec_hash(&a), compute_spec_hash(&b));
    }

    #[test]
    fn put_resource_keeps_name_index_consistent() {
        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let resource = ResourceState::new(
            instance_id,
            "ordersTable",
            ResourceTypeId::new("aws/dynamodb/table"),
        );
        let id = resource.id;
        instance.put_resource(resource);

        assert_eq!(instance.resource_ids["ordersTable"], id);
        assert_eq!(instance.resource_by_name("ordersTable").unwrap().id, id);

        instance.remove_resource(id);
        assert!(instance.resource_by_name("ordersTable").is_none());
        assert!(instance.resource_ids.is_empty());
    }

    #[test]
    fn descendant_walks_dotted_paths() {
        let now = Utc::now();
        let root_id = InstanceId::generate();
        let mut root = InstanceState::new(root_id, "root", now);
        let mut child = InstanceState::new(InstanceId::generate(), "networking", now);
        let grandchild = InstanceState::new(InstanceId::generate(), "subnets", now);
        child.children.insert("subnets".into(), grandchild);
        root.children.insert("networking".into(), child);

        assert!(root.descendant("networking").is_some());
        assert!(root.descendant("networking.subnets").is_some());
        assert!(root.descendant("networking.missing").is_none());
    }

    #[test]
    fn has_resource_named_descends_children() {
        let now = Utc::now();
        let child_id = InstanceId::generate();
        let mut child = InstanceState::new(child_id, "messaging", now);
        child.put_resource(ResourceState::new(
            child_id,
            "queue",
            ResourceTypeId::new("aws/sqs/queue"),
        ));
        let mut root = InstanceState::new(InstanceId::generate(), "root", now);
        root.children.insert("messaging".into(), child);

        assert!(root.has_resource_named("messaging.queue"));
        assert!(!root.has_resource_named("queue"));
    }

    #[test]
    fn resource_status_classification() {
        assert!(ResourceStatus::Created.is_terminal_success());
        assert!(ResourceStatus::Updated.is_terminal_success());
        assert!(!ResourceStatus::Creating.is_terminal_success());
        assert!(ResourceStatus::Creating.is_transitional());
        assert!(ResourceStatus::RollingBack.is_transitional());
        assert!(!ResourceStatus::CreateFailed.is_transitional());
    }

    #[test]
    fn mark_deployed_clears_failures() {
        let instance_id = InstanceId::generate();
        let mut r = ResourceState::new(instance_id, "r", ResourceTypeId::new("t/c/k"));
        r.mark_deploy_failed(false, "boom");
        assert_eq!(r.status, ResourceStatus::CreateFailed);
        assert_eq!(r.failure_reasons.len(), 1);

        r.mark_deployed(false);
        assert_eq!(r.status, ResourceStatus::Created);
        assert!(r.failure_reasons.is_empty());
    }
}
