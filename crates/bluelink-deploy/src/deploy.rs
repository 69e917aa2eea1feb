use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bluelink_config::{CoreConfig, RetryPolicy};
use bluelink_domain::{
    BlueprintDocument, ChangesetId, ChannelId, InstanceId, LinkId, ResourceDefinition,
    ENGINE_VERSION,
};
use bluelink_events::EventBus;
use bluelink_graph::{collect_spec_references, ExecutionPlan, NodeKind};
use bluelink_provider::{path, ResourceDeployInput, ResourceRegistry};
use bluelink_state::{
    Changeset, ChangesetStatus, ExportState, InstanceState, InstanceStatus, LinkState,
    ResourceState, ResourceStatus, StateContainer, SystemProvenance,
};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::destroy::{destroy_resource, DestroyRequest};
use crate::error::DeployError;
use crate::events::DeployEvent;
use crate::links;
use crate::operation::{OperationKind, OperationTokens};
use crate::resolve::{resolve_spec, ResolutionContext};
use crate::retry::with_retries;

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub changeset_id: ChangesetId,
    /// Defeats drift gating.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    /// Event channel the operation streamed on.
    pub channel: ChannelId,
}

/// The deployment orchestrator: stages changes, executes deploys and
/// destroys against the dependency graph, rolls back on failure, and streams
/// events through the bus.
pub struct Deployer {
    pub(crate) store: Arc<dyn StateContainer>,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) config: CoreConfig,
    pub(crate) operations: OperationTokens,
}

/// One successfully finished node, recorded for rollback.
pub(crate) enum CompletedNode {
    Resource {
        child_path: Option<String>,
        name: String,
        /// `None` when the resource was created by this operation.
        prior: Option<ResourceState>,
    },
    Link {
        child_path: Option<String>,
        link_id: LinkId,
        prior: Option<LinkState>,
    },
    Child {
        parent_path: Option<String>,
        name: String,
    },
}

/// Shared state for one in-flight operation's worker tree.
pub(crate) struct OpCtx {
    pub store: Arc<dyn StateContainer>,
    pub registry: Arc<ResourceRegistry>,
    pub bus: Arc<EventBus>,
    pub retry: RetryPolicy,
    pub channel: ChannelId,
    pub cancel: CancellationToken,
    pub root_instance_id: InstanceId,
    pub working: tokio::sync::RwLock<InstanceState>,
    pub completed: std::sync::Mutex<Vec<CompletedNode>>,
    pub data_sources: HashMap<String, Value>,
    /// Resource types some downstream dependency wants stabilised.
    pub stabilise_types: HashSet<bluelink_domain::ResourceTypeId>,
}

impl OpCtx {
    pub async fn node_snapshot(
        &self,
        child_path: Option<&str>,
    ) -> Result<InstanceState, DeployError> {
        let working = self.working.read().await;
        match child_path {
            None => Ok(working.clone()),
            Some(path) => working
                .descendant(path)
                .cloned()
                .ok_or_else(|| DeployError::Internal(format!("unknown child path '{path}'"))),
        }
    }

    pub async fn with_node_mut<R>(
        &self,
        child_path: Option<&str>,
        mutate: impl FnOnce(&mut InstanceState) -> R,
    ) -> Result<R, DeployError> {
        let mut working = self.working.write().await;
        let node = match child_path {
            None => &mut *working,
            Some(path) => working
                .descendant_mut(path)
                .ok_or_else(|| DeployError::Internal(format!("unknown child path '{path}'")))?,
        };
        Ok(mutate(node))
    }

    /// Persist the whole working instance tree. Node workers call this after
    /// every state transition so a crash leaves recoverable state.
    pub async fn persist(&self) -> Result<(), DeployError> {
        let snapshot = self.working.read().await.clone();
        self.store.save_instance(&snapshot).await?;
        Ok(())
    }

    pub async fn emit(&self, event: DeployEvent) -> Result<(), DeployError> {
        self.bus.publish(&self.channel, event.payload(), false).await?;
        Ok(())
    }

    pub fn record(&self, node: CompletedNode) {
        let mut completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
        completed.push(node);
    }
}

impl Deployer {
    pub fn new(
        store: Arc<dyn StateContainer>,
        registry: Arc<ResourceRegistry>,
        bus: Arc<EventBus>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            config,
            operations: OperationTokens::new(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn operations(&self) -> &OperationTokens {
        &self.operations
    }

    /// Preempt the in-flight operation on an instance, if any.
    pub fn cancel(&self, instance_id: InstanceId) -> bool {
        self.operations.cancel(instance_id)
    }

    /// Execute a staged changeset.
    ///
    /// Fails fast with `drift-blocked` when the changeset carries an
    /// unforced drift result, and with `instance-busy` when another
    /// mutating operation holds the instance.
    pub async fn deploy(&self, req: DeployRequest) -> Result<DeployOutcome, DeployError> {
        let changeset = self
            .store
            .get_changeset(req.changeset_id)
            .await?
            .ok_or(DeployError::ChangesetNotFound(req.changeset_id))?;
        if changeset.status != ChangesetStatus::Complete {
            return Err(DeployError::ChangesetIncomplete(changeset.id));
        }
        if changeset.destroy {
            return self
                .destroy(DestroyRequest {
                    instance_id: changeset.instance_id,
                    instance_name: Some(changeset.instance_name.clone()),
                })
                .await;
        }

        if !req.force {
            if let Some(result) = &changeset.reconciliation_result {
                if result.has_drift {
                    return Err(DeployError::DriftBlocked {
                        reconciliation_result: Box::new(result.clone()),
                    });
                }
            }
        }

        let now = Utc::now();
        let (mut instance, is_new) = self.load_or_create_instance(&changeset, now).await?;
        let instance_id = instance.id;
        let channel = ChannelId::new(format!("deploy-{}", changeset.id));
        let guard = self.operations.begin(
            instance_id,
            OperationKind::Deploy {
                changeset_id: changeset.id,
            },
            channel.clone(),
        )?;
        info!(instance_id = %instance_id, changeset_id = %changeset.id, "starting deploy");

        let started = Instant::now();
        instance.set_status(InstanceStatus::Preparing, now);
        instance.last_deploy_attempt_at = Some(now);
        self.store.save_instance(&instance).await?;
        // First event on the channel always carries the instance ID.
        self.bus
            .publish(
                &channel,
                DeployEvent::DeploymentUpdate {
                    instance_id,
                    status: InstanceStatus::Preparing,
                }
                .payload(),
                false,
            )
            .await?;

        let prepared = self.prepare(&changeset).await;
        let prepare_ms = started.elapsed().as_millis() as u64;

        let (ctx, run_result) = match prepared {
            Ok((plan, data_sources, stabilise_types)) => {
                let ctx = Arc::new(OpCtx {
                    store: Arc::clone(&self.store),
                    registry: Arc::clone(&self.registry),
                    bus: Arc::clone(&self.bus),
                    retry: self.config.retry.clone(),
                    channel: channel.clone(),
                    cancel: guard.cancel.clone(),
                    root_instance_id: instance_id,
                    working: tokio::sync::RwLock::new(instance),
                    completed: std::sync::Mutex::new(Vec::new()),
                    data_sources,
                    stabilise_types,
                });
                let result = self.execute(&ctx, &changeset, &plan).await;
                (Some(ctx), result)
            }
            Err(e) => (None, Err(e)),
        };

        if let Err(e) = run_result {
            warn!(instance_id = %instance_id, error = %e, "deploy failed, rolling back");
            if let Some(ctx) = &ctx {
                self.rollback(ctx, is_new).await;
            } else if is_new {
                // Failed before any node ran; drop the prepared record.
                self.store.remove_instance(instance_id).await.ok();
            }
            self.bus
                .publish(
                    &channel,
                    DeployEvent::DeploymentUpdate {
                        instance_id,
                        status: InstanceStatus::DeployFailed,
                    }
                    .payload(),
                    false,
                )
                .await
                .ok();
            self.bus
                .publish(
                    &channel,
                    DeployEvent::Finish {
                        instance_id,
                        status: InstanceStatus::DeployFailed,
                    }
                    .payload(),
                    true,
                )
                .await
                .ok();
            return Err(e);
        }
        let Some(ctx) = ctx else {
            return Err(DeployError::Internal(
                "deploy completed without an operation context".to_string(),
            ));
        };

        let finished = Utc::now();
        {
            let mut working = ctx.working.write().await;
            working.set_status(InstanceStatus::Deployed, finished);
            working.last_deployed_at = Some(finished);
            working.durations.prepare_ms = Some(prepare_ms);
            working.durations.total_ms = Some(started.elapsed().as_millis() as u64);
        }
        ctx.persist().await?;
        ctx.emit(DeployEvent::DeploymentUpdate {
            instance_id,
            status: InstanceStatus::Deployed,
        })
        .await?;
        self.bus
            .publish(
                &channel,
                DeployEvent::Finish {
                    instance_id,
                    status: InstanceStatus::Deployed,
                }
                .payload(),
                true,
            )
            .await?;
        info!(instance_id = %instance_id, "deploy complete");
        Ok(DeployOutcome {
            instance_id,
            status: InstanceStatus::Deployed,
            channel,
        })
    }

    async fn load_or_create_instance(
        &self,
        changeset: &Changeset,
        now: chrono::DateTime<Utc>,
    ) -> Result<(InstanceState, bool), DeployError> {
        if let Some(id) = changeset.instance_id {
            let instance = self
                .store
                .get_instance(id)
                .await?
                .ok_or_else(|| DeployError::InstanceNotFound(id.to_string()))?;
            return Ok((instance, false));
        }
        if let Some(id) = self
            .store
            .lookup_instance_id(&changeset.instance_name)
            .await?
        {
            let instance = self
                .store
                .get_instance(id)
                .await?
                .ok_or_else(|| DeployError::InstanceNotFound(id.to_string()))?;
            return Ok((instance, false));
        }
        Ok((
            InstanceState::new(InstanceId::generate(), &changeset.instance_name, now),
            true,
        ))
    }

    /// Validate the graph, pre-fetch data sources, and collect the set of
    /// resource types some dependency wants stabilised.
    async fn prepare(
        &self,
        changeset: &Changeset,
    ) -> Result<
        (
            ExecutionPlan,
            HashMap<String, Value>,
            HashSet<bluelink_domain::ResourceTypeId>,
        ),
        DeployError,
    > {
        let plan = bluelink_graph::plan(&changeset.blueprint)?;

        let mut docs: Vec<&BlueprintDocument> = Vec::new();
        collect_docs(&changeset.blueprint, &mut docs);

        let mut data_sources = HashMap::new();
        for doc in &docs {
            for (name, def) in &doc.data_sources {
                let handler = self.registry.data_source_handler(&def.source_type)?;
                data_sources.insert(name.clone(), handler.fetch(&def.filters).await?);
            }
        }

        let mut stabilise_types = HashSet::new();
        for doc in &docs {
            for def in doc.resources.values() {
                for dep in self.registry.stabilised_dependencies(&def.resource_type)? {
                    stabilise_types.insert(dep);
                }
            }
        }
        Ok((plan, data_sources, stabilise_types))
    }

    async fn execute(
        &self,
        ctx: &Arc<OpCtx>,
        changeset: &Changeset,
        plan: &ExecutionPlan,
    ) -> Result<(), DeployError> {
        {
            let mut working = ctx.working.write().await;
            working.set_status(InstanceStatus::Deploying, Utc::now());
        }
        ctx.persist().await?;

        let doc = Arc::new(changeset.blueprint.clone());
        let changes = &changeset.changes;

        self.apply_removals(ctx, changeset).await?;

        // Parallel waves: one worker per node, barrier between waves.
        for wave in &plan.waves {
            let mut join = tokio::task::JoinSet::new();
            for node in wave {
                match node.kind {
                    NodeKind::Resource => {
                        let needs = changes.new_resources.contains_key(&node.name)
                            || changes.resource_changes.contains_key(&node.name);
                        let Some(def) = doc.resources.get(&node.name) else {
                            continue;
                        };
                        if !needs {
                            continue;
                        }
                        let ctx = Arc::clone(ctx);
                        let doc = Arc::clone(&doc);
                        let name = node.name.clone();
                        let def = def.clone();
                        join.spawn(async move {
                            deploy_resource(ctx, None, doc, name, def).await
                        });
                    }
                    NodeKind::Child => {
                        let needs = changes.new_children.contains(&node.name)
                            || changes
                                .child_changes
                                .get(&node.name)
                                .map_or(false, |c| !c.is_empty());
                        let Some(child_doc) = doc.children.get(&node.name) else {
                            continue;
                        };
                        if !needs {
                            continue;
                        }
                        let ctx = Arc::clone(ctx);
                        let name = node.name.clone();
                        let child_doc = Arc::new(child_doc.clone());
                        join.spawn(async move { deploy_child(ctx, None, name, child_doc).await });
                    }
                }
            }

            let mut errors = Vec::new();
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // Cancel the remaining workers in this and later waves.
                        ctx.cancel.cancel();
                        errors.push(e);
                    }
                    Err(join_err) => {
                        ctx.cancel.cancel();
                        errors.push(DeployError::Internal(join_err.to_string()));
                    }
                }
            }
            if !errors.is_empty() {
                return Err(DeployError::aggregate(errors));
            }
        }

        // Links run after both endpoints have completed their resource-side
        // operations.
        for def in &doc.links {
            let link_id = def.link_id();
            let needs = changes.new_links.contains(&link_id.to_string())
                || changes.link_changes.contains_key(link_id.as_str());
            if !needs {
                continue;
            }
            links::run_link(ctx, None, def).await?;
        }

        resolve_exports(ctx, &doc, None).await?;
        Ok(())
    }

    /// Removed links, resources (reverse dependency order) and children are
    /// torn down before new work starts.
    async fn apply_removals(
        &self,
        ctx: &Arc<OpCtx>,
        changeset: &Changeset,
    ) -> Result<(), DeployError> {
        let changes = &changeset.changes;
        let node = ctx.node_snapshot(None).await?;

        // Links ahead of their endpoints.
        for link_name in &changes.removed_links {
            let link_id = LinkId::new(link_name.clone());
            if node.links.contains_key(&link_id) {
                ctx.with_node_mut(None, |n| {
                    n.links.remove(&link_id);
                })
                .await?;
                ctx.persist().await?;
                ctx.emit(DeployEvent::LinkUpdate {
                    instance_id: ctx.root_instance_id,
                    link_id: LinkId::new(link_name.clone()),
                    status: bluelink_state::LinkStatus::Destroyed,
                    precise_status: bluelink_state::PreciseLinkStatus::Complete,
                    rollback: false,
                })
                .await?;
            }
        }

        if !changes.removed_resources.is_empty() {
            let removed: HashSet<&String> = changes.removed_resources.iter().collect();
            let mut nodes = Vec::new();
            let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
            for name in &changes.removed_resources {
                let Some(resource) = node.resource_by_name(name) else {
                    continue;
                };
                nodes.push(bluelink_graph::DeploymentNode {
                    name: name.clone(),
                    kind: NodeKind::Resource,
                });
                deps.insert(
                    name.clone(),
                    resource
                        .depends_on_resources
                        .iter()
                        .filter(|d| removed.contains(d))
                        .cloned()
                        .collect(),
                );
            }
            let removal_plan = bluelink_graph::plan_from_edges(nodes, &deps)?;
            for wave in removal_plan.waves.iter().rev() {
                for graph_node in wave {
                    destroy_resource(ctx, None, &graph_node.name, false).await?;
                }
            }
        }

        for child_name in &changes.removed_children {
            crate::destroy::destroy_child_tree(ctx, None, child_name).await?;
        }
        Ok(())
    }

    /// Undo this operation's completed nodes in reverse order, then either
    /// remove a brand-new instance or restore the prior one to
    /// `deploy-failed`. Rollback never masks the original failure.
    async fn rollback(&self, ctx: &Arc<OpCtx>, is_new: bool) {
        let instance_id = ctx.root_instance_id;
        info!(instance_id = %instance_id, is_new, "rolling back");

        {
            let mut working = ctx.working.write().await;
            working.set_status(InstanceStatus::RollingBack, Utc::now());
        }
        if let Err(e) = ctx.persist().await {
            warn!(error = %e, "failed to persist rolling-back status");
        }

        let completed: Vec<CompletedNode> = {
            let mut completed = ctx.completed.lock().unwrap_or_else(|e| e.into_inner());
            completed.drain(..).collect()
        };
        for node in completed.into_iter().rev() {
            let step = match node {
                CompletedNode::Resource {
                    child_path,
                    name,
                    prior,
                } => rollback_resource(ctx, child_path, name, prior).await,
                CompletedNode::Link {
                    child_path,
                    link_id,
                    prior,
                } => links::rollback_link(ctx, child_path, link_id, prior).await,
                CompletedNode::Child { parent_path, name } => {
                    rollback_child(ctx, parent_path, name).await
                }
            };
            if let Err(e) = step {
                warn!(error = %e, "rollback step failed");
            }
        }

        if is_new {
            if let Err(e) = self.store.remove_instance(instance_id).await {
                warn!(error = %e, "failed to remove partially-created instance");
            }
        } else {
            {
                let mut working = ctx.working.write().await;
                working.set_status(InstanceStatus::DeployFailed, Utc::now());
            }
            if let Err(e) = ctx.persist().await {
                warn!(error = %e, "failed to persist deploy-failed status");
            }
        }

        // Any locks left behind by interrupted workers.
        self.registry.release_instance_locks(instance_id);
    }
}

fn collect_docs<'a>(doc: &'a BlueprintDocument, out: &mut Vec<&'a BlueprintDocument>) {
    out.push(doc);
    for child in doc.children.values() {
        collect_docs(child, out);
    }
}

/// Deploy one resource node: resolve substitutions against the accumulated
/// state, dispatch through the registry under the retry policy, persist each
/// transition and emit its resource-update events.
pub(crate) async fn deploy_resource(
    ctx: Arc<OpCtx>,
    child_path: Option<String>,
    doc: Arc<BlueprintDocument>,
    name: String,
    def: ResourceDefinition,
) -> Result<(), DeployError> {
    let node = ctx.node_snapshot(child_path.as_deref()).await?;
    let node_instance_id = node.id;
    let resolution = ResolutionContext {
        blueprint: &doc,
        instance: Some(&node),
        data_sources: &ctx.data_sources,
    };
    let resolved_spec = resolve_spec(&name, &def.spec, &resolution)?;

    let existing = node.resource_by_name(&name).cloned();
    let update = existing.is_some();
    let resolved_handler = ctx.registry.resolve(&def.resource_type)?;

    let mut state = existing
        .clone()
        .unwrap_or_else(|| ResourceState::new(node_instance_id, &name, def.resource_type.clone()));
    state.template_name = def.template_name.clone();
    state.metadata = def.metadata.clone();
    state.provenance = Some(SystemProvenance {
        engine_version: ENGINE_VERSION.to_string(),
        provider_namespace: resolved_handler.plugin_namespace.clone(),
        provider_version: Some(resolved_handler.plugin_version.clone()),
    });

    let references = collect_spec_references(&def.spec);
    let mut depends_on_resources: Vec<String> = def
        .depends_on
        .iter()
        .chain(references.iter())
        .filter(|d| doc.resources.contains_key(*d) && **d != name)
        .cloned()
        .collect();
    depends_on_resources.sort();
    depends_on_resources.dedup();
    state.depends_on_resources = depends_on_resources;
    let mut depends_on_children: Vec<String> = def
        .depends_on
        .iter()
        .chain(references.iter())
        .filter(|d| doc.children.contains_key(*d))
        .cloned()
        .collect();
    depends_on_children.sort();
    depends_on_children.dedup();
    state.depends_on_children = depends_on_children;

    if update {
        state.status = ResourceStatus::Updating;
        state.precise_status = bluelink_state::PreciseResourceStatus::Updating;
    } else {
        state.status = ResourceStatus::Creating;
        state.precise_status = bluelink_state::PreciseResourceStatus::Creating;
    }

    ctx.with_node_mut(child_path.as_deref(), {
        let state = state.clone();
        move |n| n.put_resource(state)
    })
    .await?;
    ctx.persist().await?;
    ctx.emit(DeployEvent::ResourceUpdate {
        instance_id: ctx.root_instance_id,
        resource_name: name.clone(),
        status: state.status,
        precise_status: state.precise_status,
        rollback: false,
        failure_reasons: Vec::new(),
    })
    .await?;

    let wait_until_stable = ctx.stabilise_types.contains(&def.resource_type);
    let attempts: Arc<std::sync::Mutex<Vec<u64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let started = Instant::now();
    let deploy_result = with_retries(&ctx.retry, &ctx.cancel, |_attempt| {
        let input = ResourceDeployInput {
            instance_id: node_instance_id,
            resource_id: state.id,
            resource_name: name.clone(),
            resolved_spec: resolved_spec.clone(),
            current_state: existing.clone(),
            rollback: false,
        };
        let registry = Arc::clone(&ctx.registry);
        let resource_type = def.resource_type.clone();
        let cancel = ctx.cancel.clone();
        let attempts = Arc::clone(&attempts);
        async move {
            let attempt_started = Instant::now();
            let result = registry
                .deploy(&resource_type, &input, wait_until_stable, &cancel)
                .await;
            attempts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(attempt_started.elapsed().as_millis() as u64);
            result
        }
    })
    .await;

    match deploy_result {
        Ok(deployed) => {
            let total_ms = started.elapsed().as_millis() as u64;
            let attempt_durations = attempts.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let (status, precise_status) = ctx
                .with_node_mut(child_path.as_deref(), {
                    let resource_id = state.id;
                    move |n| {
                        let Some(resource) = n.resources.get_mut(&resource_id) else {
                            return (ResourceStatus::Pending, Default::default());
                        };
                        resource.spec_data = deployed.spec_data;
                        resource.computed_fields = deployed.computed_field_paths;
                        resource.mark_deployed(update);
                        resource.durations.config_complete_ms =
                            attempt_durations.last().copied();
                        resource.durations.attempt_durations_ms = attempt_durations;
                        resource.durations.total_ms = Some(total_ms);
                        (resource.status, resource.precise_status)
                    }
                })
                .await?;
            ctx.persist().await?;
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name.clone(),
                status,
                precise_status,
                rollback: false,
                failure_reasons: Vec::new(),
            })
            .await?;
            debug!(resource = %name, update, "resource deployed");
            ctx.record(CompletedNode::Resource {
                child_path,
                name,
                prior: existing,
            });
            Ok(())
        }
        Err(e) => {
            let reason = e.to_string();
            let (status, precise_status) = ctx
                .with_node_mut(child_path.as_deref(), {
                    let resource_id = state.id;
                    let reason = reason.clone();
                    move |n| {
                        let Some(resource) = n.resources.get_mut(&resource_id) else {
                            return (ResourceStatus::Pending, Default::default());
                        };
                        resource.mark_deploy_failed(update, reason);
                        (resource.status, resource.precise_status)
                    }
                })
                .await?;
            ctx.persist().await?;
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name,
                status,
                precise_status,
                rollback: false,
                failure_reasons: vec![reason],
            })
            .await?;
            Err(e.into())
        }
    }
}

/// Deploy a child blueprint as one node: its own waves run sequentially
/// inside the parent's worker slot.
pub(crate) fn deploy_child(
    ctx: Arc<OpCtx>,
    parent_path: Option<String>,
    name: String,
    doc: Arc<BlueprintDocument>,
) -> Pin<Box<dyn Future<Output = Result<(), DeployError>> + Send>> {
    Box::pin(async move {
        let child_path = match &parent_path {
            Some(parent) => format!("{parent}.{name}"),
            None => name.clone(),
        };

        let created = ctx
            .with_node_mut(parent_path.as_deref(), {
                let name = name.clone();
                move |n| {
                    if n.children.contains_key(&name) {
                        false
                    } else {
                        n.children.insert(
                            name.clone(),
                            InstanceState::new(InstanceId::generate(), &name, Utc::now()),
                        );
                        true
                    }
                }
            })
            .await?;
        if created {
            ctx.record(CompletedNode::Child {
                parent_path: parent_path.clone(),
                name: name.clone(),
            });
        }

        ctx.with_node_mut(Some(&child_path), |n| {
            n.set_status(InstanceStatus::Deploying, Utc::now())
        })
        .await?;
        ctx.persist().await?;
        ctx.emit(DeployEvent::ChildUpdate {
            instance_id: ctx.root_instance_id,
            child_name: child_path.clone(),
            status: InstanceStatus::Deploying,
            rollback: false,
        })
        .await?;

        let plan = bluelink_graph::plan(&doc)?;
        for wave in &plan.waves {
            for graph_node in wave {
                match graph_node.kind {
                    NodeKind::Resource => {
                        let Some(def) = doc.resources.get(&graph_node.name) else {
                            continue;
                        };
                        deploy_resource(
                            Arc::clone(&ctx),
                            Some(child_path.clone()),
                            Arc::clone(&doc),
                            graph_node.name.clone(),
                            def.clone(),
                        )
                        .await?;
                    }
                    NodeKind::Child => {
                        let Some(grandchild) = doc.children.get(&graph_node.name) else {
                            continue;
                        };
                        deploy_child(
                            Arc::clone(&ctx),
                            Some(child_path.clone()),
                            graph_node.name.clone(),
                            Arc::new(grandchild.clone()),
                        )
                        .await?;
                    }
                }
            }
        }

        for def in &doc.links {
            links::run_link(&ctx, Some(child_path.clone()), def).await?;
        }
        resolve_exports(&ctx, &doc, Some(&child_path)).await?;

        ctx.with_node_mut(Some(&child_path), |n| {
            let now = Utc::now();
            n.set_status(InstanceStatus::Deployed, now);
            n.last_deployed_at = Some(now);
        })
        .await?;
        ctx.persist().await?;
        ctx.emit(DeployEvent::ChildUpdate {
            instance_id: ctx.root_instance_id,
            child_name: child_path,
            status: InstanceStatus::Deployed,
            rollback: false,
        })
        .await?;
        Ok(())
    })
}

/// Materialise blueprint exports from the deployed resource specs.
pub(crate) async fn resolve_exports(
    ctx: &Arc<OpCtx>,
    doc: &BlueprintDocument,
    child_path: Option<&str>,
) -> Result<(), DeployError> {
    if doc.exports.is_empty() {
        return Ok(());
    }
    let node = ctx.node_snapshot(child_path).await?;
    let mut exports = HashMap::new();
    for (name, def) in &doc.exports {
        let Some((resource_name, field_path)) = def.field.split_once('.') else {
            continue;
        };
        let field_path = field_path.strip_prefix("spec.").unwrap_or(field_path);
        let value = node
            .resource_by_name(resource_name)
            .and_then(|r| path::get_path(&r.spec_data, field_path))
            .cloned();
        if let Some(value) = value {
            exports.insert(
                name.clone(),
                ExportState {
                    field: def.field.clone(),
                    value,
                    description: def.description.clone(),
                },
            );
        }
    }
    ctx.with_node_mut(child_path, move |n| n.exports.extend(exports))
        .await?;
    ctx.persist().await
}

async fn rollback_resource(
    ctx: &Arc<OpCtx>,
    child_path: Option<String>,
    name: String,
    prior: Option<ResourceState>,
) -> Result<(), DeployError> {
    let node = ctx.node_snapshot(child_path.as_deref()).await?;
    let node_instance_id = node.id;
    let Some(current) = node.resource_by_name(&name).cloned() else {
        return Ok(());
    };

    match prior {
        None => {
            // Created by this operation: destroy it again.
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name.clone(),
                status: ResourceStatus::Destroying,
                precise_status: bluelink_state::PreciseResourceStatus::Destroying,
                rollback: true,
                failure_reasons: Vec::new(),
            })
            .await?;
            let input = bluelink_provider::ResourceDestroyInput {
                instance_id: node_instance_id,
                resource_id: current.id,
                resource_name: name.clone(),
                spec_data: current.spec_data.clone(),
                rollback: true,
            };
            ctx.registry.destroy(&current.resource_type, &input).await?;
            ctx.with_node_mut(child_path.as_deref(), move |n| {
                n.remove_resource(current.id);
            })
            .await?;
            ctx.persist().await?;
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name,
                status: ResourceStatus::Destroyed,
                precise_status: bluelink_state::PreciseResourceStatus::Destroyed,
                rollback: true,
                failure_reasons: Vec::new(),
            })
            .await
        }
        Some(prev) => {
            // Modified by this operation: redeploy the prior spec.
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name.clone(),
                status: ResourceStatus::RollingBack,
                precise_status: prev.precise_status,
                rollback: true,
                failure_reasons: Vec::new(),
            })
            .await?;
            let input = ResourceDeployInput {
                instance_id: node_instance_id,
                resource_id: prev.id,
                resource_name: name.clone(),
                resolved_spec: prev.spec_data.clone(),
                current_state: Some(current),
                rollback: true,
            };
            ctx.registry
                .deploy(&prev.resource_type, &input, false, &ctx.cancel)
                .await?;
            ctx.with_node_mut(child_path.as_deref(), {
                let prev = prev.clone();
                move |n| n.put_resource(prev)
            })
            .await?;
            ctx.persist().await?;
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name,
                status: ResourceStatus::RolledBack,
                precise_status: prev.precise_status,
                rollback: true,
                failure_reasons: Vec::new(),
            })
            .await
        }
    }
}

async fn rollback_child(
    ctx: &Arc<OpCtx>,
    parent_path: Option<String>,
    name: String,
) -> Result<(), DeployError> {
    let child_path = match &parent_path {
        Some(parent) => format!("{parent}.{name}"),
        None => name.clone(),
    };
    ctx.with_node_mut(parent_path.as_deref(), {
        let name = name.clone();
        move |n| {
            n.children.remove(&name);
        }
    })
    .await?;
    ctx.persist().await?;
    ctx.emit(DeployEvent::ChildUpdate {
        instance_id: ctx.root_instance_id,
        child_name: child_path,
        status: InstanceStatus::Destroyed,
        rollback: true,
    })
    .await
}
