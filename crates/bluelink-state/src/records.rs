use std::collections::HashMap;

use bluelink_domain::{ChangesetId, InstanceId, LinkId, ResourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::changes::FieldChange;
use crate::state::PreciseResourceStatus;

// ── Drift records ─────────────────────────────────────────────────────────────
//
// Drift records are the persisted evidence of a divergence; reconciliation
// results below are the per-run analysis that referenced them.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftDifference {
    /// Fields present externally but absent from persisted state.
    #[serde(default)]
    pub new_fields: Vec<FieldChange>,
    /// Fields whose external value differs from the persisted one.
    #[serde(default)]
    pub modified_fields: Vec<FieldChange>,
    /// Fields persisted but absent externally.
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl DriftDifference {
    pub fn is_empty(&self) -> bool {
        self.new_fields.is_empty()
            && self.modified_fields.is_empty()
            && self.removed_fields.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDriftState {
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub instance_id: InstanceId,
    /// The externally observed spec at detection time.
    pub external_spec: Value,
    pub difference: DriftDifference,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDriftState {
    pub link_id: LinkId,
    pub instance_id: InstanceId,
    /// Pending link data changes keyed by consumer resource name.
    pub link_data_updates: HashMap<String, Value>,
    pub detected_at: DateTime<Utc>,
}

// ── Reconciliation results ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconciliationKind {
    /// External field values diverge from persisted state.
    Drift,
    /// A prior operation left the node in a transitional status.
    Interrupted,
    /// External state was re-read without differences worth acting on.
    StateRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    /// Overwrite persisted spec with external state; status stays deployed.
    AcceptExternal,
    /// Transition to a new precise status without touching spec data.
    UpdateStatus,
    /// External lookup unsupported; an operator has to intervene.
    ManualCleanupRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReconciliationEntry {
    pub resource_name: String,
    /// Dotted path when the resource lives in a descendant child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_path: Option<String>,
    pub kind: ReconciliationKind,
    pub action: RecommendedAction,
    /// Whether the resource exists externally (interrupted resources only;
    /// `None` when the provider does not support tag-based lookup).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists_externally: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difference: Option<DriftDifference>,
    /// Target status for an `update-status` action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_precise_status: Option<PreciseResourceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReconciliationEntry {
    pub link_id: LinkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_path: Option<String>,
    pub kind: ReconciliationKind,
    pub action: RecommendedAction,
    #[serde(default)]
    pub link_data_updates: HashMap<String, Value>,
}

/// The analysis produced by one reconciliation check. Append-only; indexed
/// newest-first by both changeset and instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub id: Uuid,
    pub instance_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset_id: Option<ChangesetId>,
    pub has_drift: bool,
    #[serde(default)]
    pub resources: Vec<ResourceReconciliationEntry>,
    #[serde(default)]
    pub links: Vec<LinkReconciliationEntry>,
    /// Per-node failures collected during a best-effort run.
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn new(instance_id: InstanceId, changeset_id: Option<ChangesetId>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            changeset_id,
            has_drift: false,
            resources: Vec::new(),
            links: Vec::new(),
            errors: Vec::new(),
            created_at: now,
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.has_drift && self.resources.is_empty() && self.links.is_empty()
    }
}

// ── Blueprint validations ─────────────────────────────────────────────────────
//
// Produced by the upstream validation pipeline; persisted and swept here.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationStatus {
    Running,
    Validated,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintValidation {
    pub id: Uuid,
    pub status: ValidationStatus,
    pub blueprint_location: String,
    pub created_at: DateTime<Utc>,
}

// ── Cleanup operations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupType {
    Events,
    Validations,
    Changesets,
    ReconciliationResults,
}

impl std::fmt::Display for CleanupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CleanupType::Events => "events",
            CleanupType::Validations => "validations",
            CleanupType::Changesets => "changesets",
            CleanupType::ReconciliationResults => "reconciliation-results",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupStatus {
    Running,
    Complete,
    Failed,
}

/// One run of a retention sweep. A rolling window of the 50 most recent
/// operations per type is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOperation {
    pub id: Uuid,
    pub cleanup_type: CleanupType,
    pub status: CleanupStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub items_deleted: u64,
    /// Records older than this were swept.
    pub threshold: DateTime<Utc>,
}

/// Rolling window of cleanup history kept per cleanup type.
pub const CLEANUP_HISTORY_WINDOW: usize = 50;
