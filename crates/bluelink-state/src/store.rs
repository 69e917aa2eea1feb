use async_trait::async_trait;
use bluelink_domain::{ChangesetId, ChannelId, InstanceId, LinkId, ResourceId};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::changes::Changeset;
use crate::error::StateError;
use crate::events::EventRecord;
use crate::records::{
    BlueprintValidation, CleanupOperation, CleanupType, LinkDriftState, ReconciliationResult,
    ResourceDriftState,
};
use crate::state::{InstanceState, LinkState, ResourceState};

/// The shared contract both storage backends satisfy.
///
/// Resources and links are persisted nested inside their instance record;
/// the per-entity accessors load, mutate and re-save that record. The store
/// serialises writes per entity class but offers no multi-entity
/// transactions — callers order their writes so a crash leaves recoverable
/// state.
#[async_trait]
pub trait StateContainer: Send + Sync + 'static {
    // ── Instances ─────────────────────────────────────────────────────────────

    async fn get_instance(&self, id: InstanceId) -> Result<Option<InstanceState>, StateError>;

    /// Resolve a user-provided instance name to its ID.
    async fn lookup_instance_id(&self, name: &str) -> Result<Option<InstanceId>, StateError>;

    async fn save_instance(&self, state: &InstanceState) -> Result<(), StateError>;

    async fn remove_instance(&self, id: InstanceId) -> Result<(), StateError>;

    // ── Resources (nested) ────────────────────────────────────────────────────

    async fn get_resource(
        &self,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceState>, StateError>;

    async fn save_resource(
        &self,
        instance_id: InstanceId,
        state: &ResourceState,
    ) -> Result<(), StateError>;

    async fn remove_resource(
        &self,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<(), StateError>;

    // ── Links (nested) ────────────────────────────────────────────────────────

    async fn get_link(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<Option<LinkState>, StateError>;

    async fn save_link(
        &self,
        instance_id: InstanceId,
        state: &LinkState,
    ) -> Result<(), StateError>;

    async fn remove_link(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<(), StateError>;

    // ── Changesets ────────────────────────────────────────────────────────────

    async fn get_changeset(&self, id: ChangesetId) -> Result<Option<Changeset>, StateError>;

    async fn save_changeset(&self, changeset: &Changeset) -> Result<(), StateError>;

    // ── Validations ───────────────────────────────────────────────────────────

    async fn get_validation(&self, id: Uuid) -> Result<Option<BlueprintValidation>, StateError>;

    async fn save_validation(&self, validation: &BlueprintValidation) -> Result<(), StateError>;

    // ── Drift records ─────────────────────────────────────────────────────────

    async fn get_resource_drift(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceDriftState>, StateError>;

    async fn save_resource_drift(&self, drift: &ResourceDriftState) -> Result<(), StateError>;

    async fn remove_resource_drift(&self, resource_id: ResourceId) -> Result<(), StateError>;

    async fn get_link_drift(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<Option<LinkDriftState>, StateError>;

    async fn save_link_drift(&self, drift: &LinkDriftState) -> Result<(), StateError>;

    async fn remove_link_drift(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<(), StateError>;

    // ── Reconciliation results ────────────────────────────────────────────────

    async fn save_reconciliation_result(
        &self,
        result: &ReconciliationResult,
    ) -> Result<(), StateError>;

    /// Newest first.
    async fn reconciliation_results_for_changeset(
        &self,
        changeset_id: ChangesetId,
    ) -> Result<Vec<ReconciliationResult>, StateError>;

    /// Newest first.
    async fn reconciliation_results_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<ReconciliationResult>, StateError>;

    // ── Events ────────────────────────────────────────────────────────────────

    async fn append_event(&self, record: &EventRecord) -> Result<(), StateError>;

    /// Events on `channel` with `id > after_id` (all events when `None`),
    /// in id order.
    async fn list_events(
        &self,
        channel: &ChannelId,
        after_id: Option<u64>,
    ) -> Result<Vec<EventRecord>, StateError>;

    async fn last_event_id(&self, channel: &ChannelId) -> Result<Option<u64>, StateError>;

    // ── Retention sweeps ──────────────────────────────────────────────────────

    async fn cleanup_events(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError>;

    async fn cleanup_changesets(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError>;

    async fn cleanup_validations(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError>;

    async fn cleanup_reconciliation_results(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError>;

    /// Newest first, capped at the rolling history window.
    async fn list_cleanup_operations(
        &self,
        cleanup_type: CleanupType,
    ) -> Result<Vec<CleanupOperation>, StateError>;
}
