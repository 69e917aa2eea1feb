use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bluelink_domain::{ChangesetId, ChannelId, InstanceId, LinkId, ResourceId};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::changes::Changeset;
use crate::chunks::{ChunkRecord, ChunkedCollection, EventLog};
use crate::error::StateError;
use crate::events::EventRecord;
use crate::records::{
    BlueprintValidation, CleanupOperation, CleanupStatus, CleanupType, LinkDriftState,
    ReconciliationResult, ResourceDriftState, CLEANUP_HISTORY_WINDOW,
};
use crate::state::{InstanceState, LinkState, ResourceState};
use crate::store::StateContainer;

impl ChunkRecord for InstanceState {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl ChunkRecord for Changeset {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl ChunkRecord for BlueprintValidation {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl ChunkRecord for ResourceDriftState {
    fn record_id(&self) -> String {
        self.resource_id.to_string()
    }
}

impl ChunkRecord for LinkDriftState {
    fn record_id(&self) -> String {
        link_drift_key(self.instance_id, &self.link_id)
    }
}

impl ChunkRecord for ReconciliationResult {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl ChunkRecord for CleanupOperation {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

fn link_drift_key(instance_id: InstanceId, link_id: &LinkId) -> String {
    format!("{instance_id}/{link_id}")
}

// ── Instance store with name index ────────────────────────────────────────────

struct InstanceStore {
    records: ChunkedCollection<InstanceState>,
    /// Secondary map rebuilt on load; persisted for external inspection.
    name_index: HashMap<String, InstanceId>,
    index_path: PathBuf,
}

impl InstanceStore {
    fn load(dir: &Path, max_chunk_size: u64) -> Result<Self, StateError> {
        let records: ChunkedCollection<InstanceState> =
            ChunkedCollection::load("instance", dir, max_chunk_size)?;
        let name_index: HashMap<String, InstanceId> = records
            .values()
            .map(|i| (i.name.clone(), i.id))
            .collect();
        let store = Self {
            records,
            name_index,
            index_path: dir.join("instance_name_index.json"),
        };
        store.write_name_index()?;
        Ok(store)
    }

    fn save(&mut self, state: &InstanceState) -> Result<(), StateError> {
        // Drop a stale mapping if this instance was known under another name.
        self.name_index.retain(|_, id| *id != state.id);
        self.name_index.insert(state.name.clone(), state.id);
        self.records.insert(state.clone())?;
        self.write_name_index()
    }

    fn remove(&mut self, id: InstanceId) -> Result<(), StateError> {
        self.records.remove(&id.to_string())?;
        self.name_index.retain(|_, mapped| *mapped != id);
        self.write_name_index()
    }

    fn write_name_index(&self) -> Result<(), StateError> {
        let serializable: HashMap<&String, String> = self
            .name_index
            .iter()
            .map(|(name, id)| (name, id.to_string()))
            .collect();
        let bytes = serde_json::to_vec(&serializable)?;
        std::fs::write(&self.index_path, bytes).map_err(|e| StateError::Io {
            path: self.index_path.display().to_string(),
            source: e,
        })
    }
}

// ── Reconciliation results with secondary indexes ─────────────────────────────

struct ReconciliationStore {
    records: ChunkedCollection<ReconciliationResult>,
    /// Newest-first result IDs per changeset, refreshed on every write.
    by_changeset: HashMap<ChangesetId, Vec<Uuid>>,
    /// Newest-first result IDs per instance.
    by_instance: HashMap<InstanceId, Vec<Uuid>>,
}

impl ReconciliationStore {
    fn load(dir: &Path, max_chunk_size: u64) -> Result<Self, StateError> {
        let records = ChunkedCollection::load("reconciliation_result", dir, max_chunk_size)?;
        let mut store = Self {
            records,
            by_changeset: HashMap::new(),
            by_instance: HashMap::new(),
        };
        store.rebuild_indexes();
        Ok(store)
    }

    fn rebuild_indexes(&mut self) {
        self.by_changeset.clear();
        self.by_instance.clear();
        let mut all: Vec<&ReconciliationResult> = self.records.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for result in all {
            if let Some(changeset_id) = result.changeset_id {
                self.by_changeset
                    .entry(changeset_id)
                    .or_default()
                    .push(result.id);
            }
            self.by_instance
                .entry(result.instance_id)
                .or_default()
                .push(result.id);
        }
    }

    fn save(&mut self, result: &ReconciliationResult) -> Result<(), StateError> {
        self.records.insert(result.clone())?;
        self.rebuild_indexes();
        Ok(())
    }

    fn for_changeset(&self, changeset_id: ChangesetId) -> Vec<ReconciliationResult> {
        self.collect(self.by_changeset.get(&changeset_id))
    }

    fn for_instance(&self, instance_id: InstanceId) -> Vec<ReconciliationResult> {
        self.collect(self.by_instance.get(&instance_id))
    }

    fn collect(&self, ids: Option<&Vec<Uuid>>) -> Vec<ReconciliationResult> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.records.get(&id.to_string()).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

// ── The container ─────────────────────────────────────────────────────────────

/// In-memory state container with chunked file persistence.
///
/// One lock per entity class guards both the in-memory map and that class's
/// files, so per-class writes serialise while unrelated classes proceed.
pub struct MemfileStateContainer {
    instances: RwLock<InstanceStore>,
    changesets: RwLock<ChunkedCollection<Changeset>>,
    validations: RwLock<ChunkedCollection<BlueprintValidation>>,
    resource_drift: RwLock<ChunkedCollection<ResourceDriftState>>,
    link_drift: RwLock<ChunkedCollection<LinkDriftState>>,
    reconciliations: RwLock<ReconciliationStore>,
    cleanups: RwLock<ChunkedCollection<CleanupOperation>>,
    events: RwLock<EventLog>,
}

impl MemfileStateContainer {
    /// Open (or create) a state directory and load every entity class.
    pub fn open(
        dir: &Path,
        max_guide_file_size: u64,
        max_event_partition_size: u64,
    ) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir).map_err(|e| StateError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        debug!(dir = %dir.display(), "opening memfile state container");

        Ok(Self {
            instances: RwLock::new(InstanceStore::load(dir, max_guide_file_size)?),
            changesets: RwLock::new(ChunkedCollection::load(
                "changeset",
                dir,
                max_guide_file_size,
            )?),
            validations: RwLock::new(ChunkedCollection::load(
                "validation",
                dir,
                max_guide_file_size,
            )?),
            resource_drift: RwLock::new(ChunkedCollection::load(
                "resource_drift",
                dir,
                max_guide_file_size,
            )?),
            link_drift: RwLock::new(ChunkedCollection::load(
                "link_drift",
                dir,
                max_guide_file_size,
            )?),
            reconciliations: RwLock::new(ReconciliationStore::load(dir, max_guide_file_size)?),
            cleanups: RwLock::new(ChunkedCollection::load(
                "cleanup_operation",
                dir,
                max_guide_file_size,
            )?),
            events: RwLock::new(EventLog::load(&dir.join("events"), max_event_partition_size)?),
        })
    }

    async fn record_cleanup(&self, op: &CleanupOperation) -> Result<(), StateError> {
        let mut guard = self.cleanups.write().await;
        guard.insert(op.clone())?;

        // Enforce the rolling history window per cleanup type.
        let mut of_type: Vec<CleanupOperation> = guard
            .values()
            .filter(|o| o.cleanup_type == op.cleanup_type)
            .cloned()
            .collect();
        if of_type.len() > CLEANUP_HISTORY_WINDOW {
            of_type.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            for stale in of_type.iter().skip(CLEANUP_HISTORY_WINDOW) {
                guard.remove(&stale.id.to_string())?;
            }
        }
        Ok(())
    }

    async fn run_sweep<F>(
        &self,
        cleanup_type: CleanupType,
        threshold: DateTime<Utc>,
        sweep: F,
    ) -> Result<CleanupOperation, StateError>
    where
        F: std::future::Future<Output = Result<u64, StateError>>,
    {
        let mut op = CleanupOperation {
            id: Uuid::new_v4(),
            cleanup_type,
            status: CleanupStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            items_deleted: 0,
            threshold,
        };
        self.record_cleanup(&op).await?;

        match sweep.await {
            Ok(deleted) => {
                op.status = CleanupStatus::Complete;
                op.items_deleted = deleted;
            }
            Err(e) => {
                op.status = CleanupStatus::Failed;
                op.finished_at = Some(Utc::now());
                self.record_cleanup(&op).await?;
                return Err(e);
            }
        }
        op.finished_at = Some(Utc::now());
        self.record_cleanup(&op).await?;
        debug!(cleanup_type = %cleanup_type, deleted = op.items_deleted, "retention sweep complete");
        Ok(op)
    }
}

fn sweep_collection<T: ChunkRecord>(
    collection: &mut ChunkedCollection<T>,
    keep: impl Fn(&T) -> bool,
) -> Result<u64, StateError> {
    let survivors: Vec<T> = collection.values().filter(|r| keep(r)).cloned().collect();
    let deleted = (collection.len() - survivors.len()) as u64;
    collection.replace_all(survivors)?;
    Ok(deleted)
}

#[async_trait]
impl StateContainer for MemfileStateContainer {
    // ── Instances ─────────────────────────────────────────────────────────────

    async fn get_instance(&self, id: InstanceId) -> Result<Option<InstanceState>, StateError> {
        let guard = self.instances.read().await;
        Ok(guard.records.get(&id.to_string()).cloned())
    }

    async fn lookup_instance_id(&self, name: &str) -> Result<Option<InstanceId>, StateError> {
        let guard = self.instances.read().await;
        Ok(guard.name_index.get(name).copied())
    }

    async fn save_instance(&self, state: &InstanceState) -> Result<(), StateError> {
        let mut guard = self.instances.write().await;
        guard.save(state)
    }

    async fn remove_instance(&self, id: InstanceId) -> Result<(), StateError> {
        let mut guard = self.instances.write().await;
        guard.remove(id)
    }

    // ── Resources ─────────────────────────────────────────────────────────────

    async fn get_resource(
        &self,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceState>, StateError> {
        let guard = self.instances.read().await;
        Ok(guard
            .records
            .get(&instance_id.to_string())
            .and_then(|i| i.resources.get(&resource_id))
            .cloned())
    }

    async fn save_resource(
        &self,
        instance_id: InstanceId,
        state: &ResourceState,
    ) -> Result<(), StateError> {
        let mut guard = self.instances.write().await;
        let mut instance = guard
            .records
            .get(&instance_id.to_string())
            .cloned()
            .ok_or_else(|| StateError::InstanceNotFound(instance_id.to_string()))?;
        instance.put_resource(state.clone());
        guard.save(&instance)
    }

    async fn remove_resource(
        &self,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<(), StateError> {
        let mut guard = self.instances.write().await;
        let mut instance = guard
            .records
            .get(&instance_id.to_string())
            .cloned()
            .ok_or_else(|| StateError::InstanceNotFound(instance_id.to_string()))?;
        instance.remove_resource(resource_id);
        guard.save(&instance)
    }

    // ── Links ─────────────────────────────────────────────────────────────────

    async fn get_link(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<Option<LinkState>, StateError> {
        let guard = self.instances.read().await;
        Ok(guard
            .records
            .get(&instance_id.to_string())
            .and_then(|i| i.links.get(link_id))
            .cloned())
    }

    async fn save_link(
        &self,
        instance_id: InstanceId,
        state: &LinkState,
    ) -> Result<(), StateError> {
        let mut guard = self.instances.write().await;
        let mut instance = guard
            .records
            .get(&instance_id.to_string())
            .cloned()
            .ok_or_else(|| StateError::InstanceNotFound(instance_id.to_string()))?;
        instance.links.insert(state.id.clone(), state.clone());
        guard.save(&instance)
    }

    async fn remove_link(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<(), StateError> {
        let mut guard = self.instances.write().await;
        let mut instance = guard
            .records
            .get(&instance_id.to_string())
            .cloned()
            .ok_or_else(|| StateError::InstanceNotFound(instance_id.to_string()))?;
        instance.links.remove(link_id);
        guard.save(&instance)
    }

    // ── Changesets ────────────────────────────────────────────────────────────

    async fn get_changeset(&self, id: ChangesetId) -> Result<Option<Changeset>, StateError> {
        let guard = self.changesets.read().await;
        Ok(guard.get(&id.to_string()).cloned())
    }

    async fn save_changeset(&self, changeset: &Changeset) -> Result<(), StateError> {
        let mut guard = self.changesets.write().await;
        guard.insert(changeset.clone())
    }

    // ── Validations ───────────────────────────────────────────────────────────

    async fn get_validation(&self, id: Uuid) -> Result<Option<BlueprintValidation>, StateError> {
        let guard = self.validations.read().await;
        Ok(guard.get(&id.to_string()).cloned())
    }

    async fn save_validation(&self, validation: &BlueprintValidation) -> Result<(), StateError> {
        let mut guard = self.validations.write().await;
        guard.insert(validation.clone())
    }

    // ── Drift records ─────────────────────────────────────────────────────────

    async fn get_resource_drift(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceDriftState>, StateError> {
        let guard = self.resource_drift.read().await;
        Ok(guard.get(&resource_id.to_string()).cloned())
    }

    async fn save_resource_drift(&self, drift: &ResourceDriftState) -> Result<(), StateError> {
        let mut guard = self.resource_drift.write().await;
        guard.insert(drift.clone())
    }

    async fn remove_resource_drift(&self, resource_id: ResourceId) -> Result<(), StateError> {
        let mut guard = self.resource_drift.write().await;
        guard.remove(&resource_id.to_string())?;
        Ok(())
    }

    async fn get_link_drift(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<Option<LinkDriftState>, StateError> {
        let guard = self.link_drift.read().await;
        Ok(guard.get(&link_drift_key(instance_id, link_id)).cloned())
    }

    async fn save_link_drift(&self, drift: &LinkDriftState) -> Result<(), StateError> {
        let mut guard = self.link_drift.write().await;
        guard.insert(drift.clone())
    }

    async fn remove_link_drift(
        &self,
        instance_id: InstanceId,
        link_id: &LinkId,
    ) -> Result<(), StateError> {
        let mut guard = self.link_drift.write().await;
        guard.remove(&link_drift_key(instance_id, link_id))?;
        Ok(())
    }

    // ── Reconciliation results ────────────────────────────────────────────────

    async fn save_reconciliation_result(
        &self,
        result: &ReconciliationResult,
    ) -> Result<(), StateError> {
        let mut guard = self.reconciliations.write().await;
        guard.save(result)
    }

    async fn reconciliation_results_for_changeset(
        &self,
        changeset_id: ChangesetId,
    ) -> Result<Vec<ReconciliationResult>, StateError> {
        let guard = self.reconciliations.read().await;
        Ok(guard.for_changeset(changeset_id))
    }

    async fn reconciliation_results_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<ReconciliationResult>, StateError> {
        let guard = self.reconciliations.read().await;
        Ok(guard.for_instance(instance_id))
    }

    // ── Events ────────────────────────────────────────────────────────────────

    async fn append_event(&self, record: &EventRecord) -> Result<(), StateError> {
        let mut guard = self.events.write().await;
        guard.append(record)
    }

    async fn list_events(
        &self,
        channel: &ChannelId,
        after_id: Option<u64>,
    ) -> Result<Vec<EventRecord>, StateError> {
        let guard = self.events.read().await;
        Ok(guard.list(channel, after_id))
    }

    async fn last_event_id(&self, channel: &ChannelId) -> Result<Option<u64>, StateError> {
        let guard = self.events.read().await;
        Ok(guard.last_id(channel))
    }

    // ── Retention sweeps ──────────────────────────────────────────────────────

    async fn cleanup_events(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError> {
        self.run_sweep(CleanupType::Events, threshold, async {
            let mut guard = self.events.write().await;
            guard.cleanup(threshold)
        })
        .await
    }

    async fn cleanup_changesets(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError> {
        self.run_sweep(CleanupType::Changesets, threshold, async {
            let mut guard = self.changesets.write().await;
            sweep_collection(&mut guard, |c| c.created_at >= threshold)
        })
        .await
    }

    async fn cleanup_validations(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError> {
        self.run_sweep(CleanupType::Validations, threshold, async {
            let mut guard = self.validations.write().await;
            sweep_collection(&mut guard, |v| v.created_at >= threshold)
        })
        .await
    }

    async fn cleanup_reconciliation_results(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<CleanupOperation, StateError> {
        self.run_sweep(CleanupType::ReconciliationResults, threshold, async {
            let mut guard = self.reconciliations.write().await;
            let deleted = sweep_collection(&mut guard.records, |r| r.created_at >= threshold)?;
            guard.rebuild_indexes();
            Ok(deleted)
        })
        .await
    }

    async fn list_cleanup_operations(
        &self,
        cleanup_type: CleanupType,
    ) -> Result<Vec<CleanupOperation>, StateError> {
        let guard = self.cleanups.read().await;
        let mut ops: Vec<CleanupOperation> = guard
            .values()
            .filter(|o| o.cleanup_type == cleanup_type)
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        ops.truncate(CLEANUP_HISTORY_WINDOW);
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DriftDifference, ReconciliationKind, RecommendedAction};
    use crate::state::ResourceStatus;
    use bluelink_domain::ResourceTypeId;
    use serde_json::json;

    fn open(dir: &tempfile::TempDir) -> MemfileStateContainer {
        MemfileStateContainer::open(dir.path(), 1024 * 1024, 10 * 1024 * 1024).unwrap()
    }

    fn dummy_instance(name: &str) -> InstanceState {
        InstanceState::new(InstanceId::generate(), name, Utc::now())
    }

    fn dummy_resource(instance_id: InstanceId, name: &str) -> ResourceState {
        let mut r = ResourceState::new(
            instance_id,
            name,
            ResourceTypeId::new("aws/dynamodb/table"),
        );
        r.spec_data = json!({"tableName": name});
        r.status = ResourceStatus::Created;
        r
    }

    #[tokio::test]
    async fn save_and_get_instance_by_id_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let instance = dummy_instance("orders");
        store.save_instance(&instance).await.unwrap();

        let got = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(got.name, "orders");

        let id = store.lookup_instance_id("orders").await.unwrap();
        assert_eq!(id, Some(instance.id));
        assert!(store.lookup_instance_id("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let instance = dummy_instance("persistent");

        {
            let store = open(&dir);
            store.save_instance(&instance).await.unwrap();
        }
        {
            let store = open(&dir);
            let got = store.get_instance(instance.id).await.unwrap();
            assert!(got.is_some(), "data should survive store reopen");
            let id = store.lookup_instance_id("persistent").await.unwrap();
            assert_eq!(id, Some(instance.id), "name index should rebuild on load");
        }
    }

    #[tokio::test]
    async fn nested_resource_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let instance = dummy_instance("orders");
        store.save_instance(&instance).await.unwrap();

        let resource = dummy_resource(instance.id, "ordersTable");
        store.save_resource(instance.id, &resource).await.unwrap();

        let got = store
            .get_resource(instance.id, resource.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "ordersTable");

        // Name index inside the instance record stays consistent.
        let instance = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(instance.resource_ids["ordersTable"], resource.id);

        store
            .remove_resource(instance.id, resource.id)
            .await
            .unwrap();
        assert!(store
            .get_resource(instance.id, resource.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn save_resource_for_missing_instance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let ghost = InstanceId::generate();
        let resource = dummy_resource(ghost, "r");
        let err = store.save_resource(ghost, &resource).await.unwrap_err();
        assert!(matches!(err, StateError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn drift_chunks_split_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        // 100-byte guide cap; each record serializes well past 40 bytes.
        let store = MemfileStateContainer::open(dir.path(), 100, 10 * 1024 * 1024).unwrap();

        let instance_id = InstanceId::generate();
        let mut ids = Vec::new();
        for i in 0..5 {
            let drift = ResourceDriftState {
                resource_id: ResourceId::generate(),
                resource_name: format!("resource-{i}"),
                instance_id,
                external_spec: json!({"field": format!("external-value-{i}")}),
                difference: DriftDifference::default(),
                detected_at: Utc::now(),
            };
            ids.push(drift.resource_id);
            store.save_resource_drift(&drift).await.unwrap();
        }

        let chunk_files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("resource_drift_c"))
            .collect();
        assert!(
            chunk_files.len() >= 2,
            "expected at least two chunk files, got {chunk_files:?}"
        );

        // Every record round-trips through a fresh container load.
        let reloaded = MemfileStateContainer::open(dir.path(), 100, 10 * 1024 * 1024).unwrap();
        for id in ids {
            assert!(reloaded.get_resource_drift(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn reconciliation_results_index_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let instance_id = InstanceId::generate();
        let changeset_id = ChangesetId::generate();
        let base = Utc::now();

        for i in 0..3 {
            let mut result =
                ReconciliationResult::new(instance_id, Some(changeset_id), base + chrono::Duration::seconds(i));
            result.has_drift = i == 2;
            result.resources.push(crate::records::ResourceReconciliationEntry {
                resource_name: format!("r{i}"),
                child_path: None,
                kind: ReconciliationKind::Drift,
                action: RecommendedAction::AcceptExternal,
                exists_externally: None,
                external_spec: None,
                difference: None,
                suggested_precise_status: None,
            });
            store.save_reconciliation_result(&result).await.unwrap();
        }

        let by_changeset = store
            .reconciliation_results_for_changeset(changeset_id)
            .await
            .unwrap();
        assert_eq!(by_changeset.len(), 3);
        assert!(by_changeset[0].has_drift, "newest result first");
        assert_eq!(by_changeset[0].resources[0].resource_name, "r2");

        let by_instance = store
            .reconciliation_results_for_instance(instance_id)
            .await
            .unwrap();
        assert_eq!(by_instance.len(), 3);
        assert_eq!(by_instance[0].id, by_changeset[0].id);
    }

    #[tokio::test]
    async fn changeset_cleanup_rebuilds_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let old = {
            let mut c = Changeset::new(
                "orders",
                None,
                Default::default(),
                Utc::now() - chrono::Duration::days(30),
            );
            c.status = crate::changes::ChangesetStatus::Complete;
            c
        };
        let recent = {
            let mut c = Changeset::new("orders", None, Default::default(), Utc::now());
            c.status = crate::changes::ChangesetStatus::Complete;
            c
        };
        store.save_changeset(&old).await.unwrap();
        store.save_changeset(&recent).await.unwrap();

        let op = store
            .cleanup_changesets(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(op.items_deleted, 1);
        assert_eq!(op.status, CleanupStatus::Complete);
        assert!(op.finished_at.is_some());

        assert!(store.get_changeset(old.id).await.unwrap().is_none());
        assert!(store.get_changeset(recent.id).await.unwrap().is_some());

        // Cleanup history is recorded and queryable newest-first.
        let history = store
            .list_cleanup_operations(CleanupType::Changesets)
            .await
            .unwrap();
        assert!(!history.is_empty());
        assert_eq!(history[0].id, op.id);
    }

    #[tokio::test]
    async fn event_append_list_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let channel = ChannelId::new("deploy-1");

        for id in 1..=4u64 {
            store
                .append_event(&EventRecord {
                    id,
                    channel_id: channel.clone(),
                    payload: json!({"seq": id}),
                    timestamp: Utc::now(),
                    end: id == 4,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.last_event_id(&channel).await.unwrap(), Some(4));

        let from_two = store.list_events(&channel, Some(2)).await.unwrap();
        let ids: Vec<u64> = from_two.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(from_two.last().unwrap().end);
    }
}
