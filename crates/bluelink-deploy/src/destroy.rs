use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bluelink_domain::{ChannelId, InstanceId};
use bluelink_graph::{plan_from_edges, DeploymentNode, NodeKind};
use bluelink_provider::ResourceDestroyInput;
use bluelink_state::{InstanceStatus, ResourceStatus};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::deploy::{DeployOutcome, Deployer, OpCtx};
use crate::error::DeployError;
use crate::events::DeployEvent;
use crate::operation::OperationKind;

#[derive(Debug, Clone, Default)]
pub struct DestroyRequest {
    pub instance_id: Option<InstanceId>,
    /// Fallback lookup when no ID is supplied.
    pub instance_name: Option<String>,
}

impl Deployer {
    /// Tear an instance down: links ahead of their endpoints, resources in
    /// reverse dependency order, children recursively, and the instance
    /// record last. Tolerates resources whose external state never fully
    /// materialised.
    pub async fn destroy(&self, req: DestroyRequest) -> Result<DeployOutcome, DeployError> {
        let instance_id = match req.instance_id {
            Some(id) => id,
            None => {
                let name = req.instance_name.as_deref().unwrap_or_default();
                self.store
                    .lookup_instance_id(name)
                    .await?
                    .ok_or_else(|| DeployError::InstanceNotFound(name.to_string()))?
            }
        };
        let mut instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| DeployError::InstanceNotFound(instance_id.to_string()))?;

        let channel = ChannelId::new(format!("destroy-{}", Uuid::new_v4()));
        let guard = self
            .operations
            .begin(instance_id, OperationKind::Destroy, channel.clone())?;
        info!(instance_id = %instance_id, "starting destroy");

        let now = Utc::now();
        instance.set_status(InstanceStatus::Destroying, now);
        self.store.save_instance(&instance).await?;
        self.bus
            .publish(
                &channel,
                DeployEvent::DeploymentUpdate {
                    instance_id,
                    status: InstanceStatus::Destroying,
                }
                .payload(),
                false,
            )
            .await?;

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
            data_sources: HashMap::new(),
            stabilise_types: HashSet::new(),
        });

        let result = destroy_node(&ctx, None).await;
        let final_status = match &result {
            Ok(()) => {
                self.store.remove_instance(instance_id).await?;
                InstanceStatus::Destroyed
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "destroy failed");
                {
                    let mut working = ctx.working.write().await;
                    working.set_status(InstanceStatus::DestroyFailed, Utc::now());
                }
                ctx.persist().await.ok();
                InstanceStatus::DestroyFailed
            }
        };

        self.registry.release_instance_locks(instance_id);
        self.bus
            .publish(
                &channel,
                DeployEvent::DeploymentUpdate {
                    instance_id,
                    status: final_status,
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
                    status: final_status,
                }
                .payload(),
                true,
            )
            .await
            .ok();

        result.map(|()| DeployOutcome {
            instance_id,
            status: InstanceStatus::Destroyed,
            channel,
        })
    }
}

/// Destroy everything inside one instance node (recursively through its
/// children), leaving the node itself for the caller to remove.
fn destroy_node<'a>(
    ctx: &'a Arc<OpCtx>,
    child_path: Option<String>,
) -> Pin<Box<dyn Future<Output = Result<(), DeployError>> + Send + 'a>> {
    Box::pin(async move {
        let node = ctx.node_snapshot(child_path.as_deref()).await?;

        // Link records go ahead of their endpoint resources.
        let link_ids: Vec<_> = node.links.keys().cloned().collect();
        for link_id in link_ids {
            ctx.with_node_mut(child_path.as_deref(), {
                let link_id = link_id.clone();
                move |n| {
                    n.links.remove(&link_id);
                }
            })
            .await?;
            ctx.persist().await?;
            ctx.emit(DeployEvent::LinkUpdate {
                instance_id: ctx.root_instance_id,
                link_id,
                status: bluelink_state::LinkStatus::Destroyed,
                precise_status: bluelink_state::PreciseLinkStatus::Complete,
                rollback: false,
            })
            .await?;
        }

        // Resources and children in reverse dependency order.
        let mut nodes: Vec<DeploymentNode> = Vec::new();
        let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
        for resource in node.resources.values() {
            nodes.push(DeploymentNode {
                name: resource.name.clone(),
                kind: NodeKind::Resource,
            });
            let mut resource_deps: HashSet<String> =
                resource.depends_on_resources.iter().cloned().collect();
            resource_deps.extend(resource.depends_on_children.iter().cloned());
            deps.insert(resource.name.clone(), resource_deps);
        }
        for child_name in node.children.keys() {
            nodes.push(DeploymentNode {
                name: child_name.clone(),
                kind: NodeKind::Child,
            });
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        let plan = plan_from_edges(nodes, &deps)?;

        for wave in plan.waves.iter().rev() {
            for graph_node in wave {
                match graph_node.kind {
                    NodeKind::Resource => {
                        destroy_resource(ctx, child_path.clone(), &graph_node.name, false).await?;
                    }
                    NodeKind::Child => {
                        destroy_child_tree(ctx, child_path.clone(), &graph_node.name).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

/// Destroy one resource through its provider and drop its record.
///
/// A plugin failure on a resource that never reached a terminal success
/// state is tolerated — a partially-failed instance must still be removable.
pub(crate) async fn destroy_resource(
    ctx: &Arc<OpCtx>,
    child_path: Option<String>,
    name: &str,
    rollback: bool,
) -> Result<(), DeployError> {
    let node = ctx.node_snapshot(child_path.as_deref()).await?;
    let Some(resource) = node.resource_by_name(name).cloned() else {
        return Ok(());
    };
    let was_deployed = resource.status.is_terminal_success();

    ctx.with_node_mut(child_path.as_deref(), {
        let id = resource.id;
        move |n| {
            if let Some(r) = n.resources.get_mut(&id) {
                r.status = ResourceStatus::Destroying;
                r.precise_status = bluelink_state::PreciseResourceStatus::Destroying;
            }
        }
    })
    .await?;
    ctx.persist().await?;
    ctx.emit(DeployEvent::ResourceUpdate {
        instance_id: ctx.root_instance_id,
        resource_name: name.to_string(),
        status: ResourceStatus::Destroying,
        precise_status: bluelink_state::PreciseResourceStatus::Destroying,
        rollback,
        failure_reasons: Vec::new(),
    })
    .await?;

    let input = ResourceDestroyInput {
        instance_id: node.id,
        resource_id: resource.id,
        resource_name: name.to_string(),
        spec_data: resource.spec_data.clone(),
        rollback,
    };
    match ctx.registry.destroy(&resource.resource_type, &input).await {
        Ok(()) => {}
        Err(e) if !was_deployed => {
            // Missing plugin state for a half-created resource.
            warn!(resource = %name, error = %e, "tolerating destroy failure for undeployed resource");
        }
        Err(e) => {
            ctx.with_node_mut(child_path.as_deref(), {
                let id = resource.id;
                let reason = e.to_string();
                move |n| {
                    if let Some(r) = n.resources.get_mut(&id) {
                        r.status = ResourceStatus::DestroyFailed;
                        r.precise_status = bluelink_state::PreciseResourceStatus::DestroyFailed;
                        r.failure_reasons.push(reason);
                    }
                }
            })
            .await?;
            ctx.persist().await?;
            ctx.emit(DeployEvent::ResourceUpdate {
                instance_id: ctx.root_instance_id,
                resource_name: name.to_string(),
                status: ResourceStatus::DestroyFailed,
                precise_status: bluelink_state::PreciseResourceStatus::DestroyFailed,
                rollback,
                failure_reasons: vec![e.to_string()],
            })
            .await?;
            return Err(e.into());
        }
    }

    ctx.with_node_mut(child_path.as_deref(), {
        let id = resource.id;
        move |n| {
            n.remove_resource(id);
        }
    })
    .await?;
    ctx.persist().await?;
    ctx.emit(DeployEvent::ResourceUpdate {
        instance_id: ctx.root_instance_id,
        resource_name: name.to_string(),
        status: ResourceStatus::Destroyed,
        precise_status: bluelink_state::PreciseResourceStatus::Destroyed,
        rollback,
        failure_reasons: Vec::new(),
    })
    .await
}

/// Recursively destroy a child instance and remove its entry.
pub(crate) async fn destroy_child_tree(
    ctx: &Arc<OpCtx>,
    parent_path: Option<String>,
    name: &str,
) -> Result<(), DeployError> {
    let child_path = match &parent_path {
        Some(parent) => format!("{parent}.{name}"),
        None => name.to_string(),
    };
    {
        let working = ctx.working.read().await;
        let parent = match parent_path.as_deref() {
            None => &*working,
            Some(path) => working
                .descendant(path)
                .ok_or_else(|| DeployError::Internal(format!("unknown child path '{path}'")))?,
        };
        if !parent.children.contains_key(name) {
            return Ok(());
        }
    }

    destroy_node(ctx, Some(child_path.clone())).await?;

    ctx.with_node_mut(parent_path.as_deref(), {
        let name = name.to_string();
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
        rollback: false,
    })
    .await
}
