use std::sync::Arc;

use bluelink_domain::{LinkDefinition, LinkId};
use bluelink_provider::{LinkPriorityResource, LinkStageInput, LinkUpdateInput, ProviderError};
use bluelink_state::{
    LinkState, LinkStatus, PreciseLinkStatus, ResourceState,
};
use tracing::{debug, warn};

use crate::deploy::{CompletedNode, OpCtx};
use crate::error::DeployError;
use crate::events::DeployEvent;

/// Drive one link through its state machine:
/// stage-changes → update resource A/B (priority endpoint first) →
/// update-intermediary-resources → complete.
///
/// The link locks both endpoints for the duration of its mutations and
/// releases everything it acquired before a failure surfaces to the
/// orchestrator, so contenders never wait on a dead holder.
pub(crate) async fn run_link(
    ctx: &Arc<OpCtx>,
    child_path: Option<String>,
    def: &LinkDefinition,
) -> Result<(), DeployError> {
    let link_id = def.link_id();
    let acquired_by = format!("link:{link_id}");

    let node = ctx.node_snapshot(child_path.as_deref()).await?;
    let node_instance_id = node.id;
    let resource_a = node.resource_by_name(&def.resource_a).cloned();
    let resource_b = node.resource_by_name(&def.resource_b).cloned();

    let (type_a, type_b) = match (&resource_a, &resource_b) {
        (Some(a), Some(b)) => (a.resource_type.clone(), b.resource_type.clone()),
        _ => {
            return Err(DeployError::Internal(format!(
                "link {link_id}: endpoint resources must deploy before the link"
            )));
        }
    };
    let handler = ctx.registry.link_handler(&type_a, &type_b)?;

    let existing = node.links.get(&link_id).cloned();
    let update = existing.is_some();
    let mut link = existing
        .clone()
        .unwrap_or_else(|| LinkState::new(node_instance_id, link_id.clone()));
    link.status = if update {
        LinkStatus::Updating
    } else {
        LinkStatus::Creating
    };
    link.failure_reasons.clear();

    set_phase(ctx, &child_path, &mut link, PreciseLinkStatus::StagingChanges).await?;
    let staged = handler
        .stage_changes(&LinkStageInput {
            instance_id: node_instance_id,
            link_id: link_id.clone(),
            resource_a: resource_a.clone(),
            resource_b: resource_b.clone(),
            current_link: existing.clone(),
            label_selector: def.label_selector.clone(),
        })
        .await;
    let changes = match staged {
        Ok(changes) => changes,
        Err(e) => {
            return fail(
                ctx,
                &child_path,
                &mut link,
                update,
                PreciseLinkStatus::ResourceAUpdateFailed,
                &acquired_by,
                e,
            )
            .await;
        }
    };

    if changes.link_data_updates.is_empty() && update {
        debug!(link = %link_id, "link already settled");
        link.status = LinkStatus::Updated;
        set_phase(ctx, &child_path, &mut link, PreciseLinkStatus::Complete).await?;
        return Ok(());
    }
    for (consumer, value) in changes.link_data_updates {
        link.data.insert(consumer, value);
    }

    // Lock both endpoints: each sub-phase mutates resources outside its own
    // worker.
    for endpoint in [&def.resource_a, &def.resource_b] {
        if let Err(e) = ctx
            .registry
            .acquire_resource_lock(node_instance_id, endpoint, &acquired_by, &ctx.cancel)
            .await
        {
            return fail(
                ctx,
                &child_path,
                &mut link,
                update,
                PreciseLinkStatus::ResourceAUpdateFailed,
                &acquired_by,
                e,
            )
            .await;
        }
    }

    // The priority endpoint updates first.
    let a_first = !matches!(handler.priority_resource(), LinkPriorityResource::ResourceB);
    let order: [(bool, &Option<ResourceState>, &Option<ResourceState>); 2] = if a_first {
        [(true, &resource_a, &resource_b), (false, &resource_b, &resource_a)]
    } else {
        [(false, &resource_b, &resource_a), (true, &resource_a, &resource_b)]
    };

    for (is_a, endpoint, other) in order {
        let (updating, updated, failed) = if is_a {
            (
                PreciseLinkStatus::UpdatingResourceA,
                PreciseLinkStatus::ResourceAUpdated,
                PreciseLinkStatus::ResourceAUpdateFailed,
            )
        } else {
            (
                PreciseLinkStatus::UpdatingResourceB,
                PreciseLinkStatus::ResourceBUpdated,
                PreciseLinkStatus::ResourceBUpdateFailed,
            )
        };
        set_phase(ctx, &child_path, &mut link, updating).await?;

        let endpoint_state = endpoint
            .clone()
            .ok_or_else(|| DeployError::Internal(format!("link {link_id}: missing endpoint")))?;
        let input = LinkUpdateInput {
            instance_id: node_instance_id,
            link_id: link_id.clone(),
            resource: endpoint_state,
            other_resource: other.clone(),
            link_data: link.data.clone(),
            rollback: false,
        };
        let output = if is_a {
            handler.update_resource_a(&input).await
        } else {
            handler.update_resource_b(&input).await
        };
        match output {
            Ok(out) => {
                for (consumer, value) in out.link_data {
                    link.data.insert(consumer, value);
                }
                link.resource_data_mappings.extend(out.resource_data_mappings);
                set_phase(ctx, &child_path, &mut link, updated).await?;
            }
            Err(e) => {
                return fail(ctx, &child_path, &mut link, update, failed, &acquired_by, e)
                    .await;
            }
        }
    }

    // Intermediary resources owned by the link itself.
    let intermediaries_phase = if update {
        PreciseLinkStatus::UpdatingIntermediaries
    } else {
        PreciseLinkStatus::CreatingIntermediaries
    };
    set_phase(ctx, &child_path, &mut link, intermediaries_phase).await?;
    let out = handler
        .update_intermediary_resources(&bluelink_provider::LinkIntermediariesInput {
            instance_id: node_instance_id,
            link_id: link_id.clone(),
            link_data: link.data.clone(),
            current_intermediaries: link.intermediary_resource_states.clone(),
            rollback: false,
        })
        .await;
    match out {
        Ok(out) => {
            link.intermediary_resource_states = out.intermediaries;
            for (consumer, value) in out.link_data {
                link.data.insert(consumer, value);
            }
            set_phase(
                ctx,
                &child_path,
                &mut link,
                PreciseLinkStatus::IntermediariesUpdated,
            )
            .await?;
        }
        Err(e) => {
            return fail(
                ctx,
                &child_path,
                &mut link,
                update,
                PreciseLinkStatus::IntermediaryUpdateFailed,
                &acquired_by,
                e,
            )
            .await;
        }
    }

    // A link never completes until both endpoints rest in terminal success.
    let node = ctx.node_snapshot(child_path.as_deref()).await?;
    let endpoints_settled = [&def.resource_a, &def.resource_b].iter().all(|name| {
        node.resource_by_name(name)
            .map_or(false, |r| r.status.is_terminal_success())
    });
    if !endpoints_settled {
        let e = ProviderError::Internal(format!(
            "link {link_id}: endpoints not in a terminal success state"
        ));
        return fail(
            ctx,
            &child_path,
            &mut link,
            update,
            PreciseLinkStatus::IntermediaryUpdateFailed,
            &acquired_by,
            e,
        )
        .await;
    }

    link.status = if update {
        LinkStatus::Updated
    } else {
        LinkStatus::Created
    };
    set_phase(ctx, &child_path, &mut link, PreciseLinkStatus::Complete).await?;
    ctx.registry.release_locks_acquired_by(&acquired_by);
    ctx.record(CompletedNode::Link {
        child_path,
        link_id,
        prior: existing,
    });
    Ok(())
}

/// Persist a phase transition and emit its link-update event.
async fn set_phase(
    ctx: &Arc<OpCtx>,
    child_path: &Option<String>,
    link: &mut LinkState,
    precise: PreciseLinkStatus,
) -> Result<(), DeployError> {
    link.precise_status = precise;
    write_link(ctx, child_path, link).await?;
    ctx.emit(DeployEvent::LinkUpdate {
        instance_id: ctx.root_instance_id,
        link_id: link.id.clone(),
        status: link.status,
        precise_status: precise,
        rollback: false,
    })
    .await
}

async fn write_link(
    ctx: &Arc<OpCtx>,
    child_path: &Option<String>,
    link: &LinkState,
) -> Result<(), DeployError> {
    let link = link.clone();
    ctx.with_node_mut(child_path.as_deref(), move |node| {
        node.links.insert(link.id.clone(), link);
    })
    .await?;
    ctx.persist().await
}

/// Failure path: persist the failed phase, emit its event, and release every
/// lock this link acquired *before* the error surfaces to the orchestrator.
async fn fail(
    ctx: &Arc<OpCtx>,
    child_path: &Option<String>,
    link: &mut LinkState,
    update: bool,
    precise: PreciseLinkStatus,
    acquired_by: &str,
    error: ProviderError,
) -> Result<(), DeployError> {
    warn!(link = %link.id, error = %error, "link phase failed");
    link.status = if update {
        LinkStatus::UpdateFailed
    } else {
        LinkStatus::CreateFailed
    };
    link.precise_status = precise;
    link.failure_reasons.push(error.to_string());
    write_link(ctx, child_path, link).await?;
    ctx.registry.release_locks_acquired_by(acquired_by);
    ctx.emit(DeployEvent::LinkUpdate {
        instance_id: ctx.root_instance_id,
        link_id: link.id.clone(),
        status: link.status,
        precise_status: precise,
        rollback: false,
    })
    .await?;
    Err(error.into())
}

/// Restore (or remove) a link during rollback. Link rollback is pure state
/// restoration — endpoint resources roll back through their own records.
pub(crate) async fn rollback_link(
    ctx: &Arc<OpCtx>,
    child_path: Option<String>,
    link_id: LinkId,
    prior: Option<LinkState>,
) -> Result<(), DeployError> {
    let (status, precise) = match &prior {
        Some(prev) => (prev.status, prev.precise_status),
        None => (LinkStatus::Destroyed, PreciseLinkStatus::RolledBack),
    };
    ctx.with_node_mut(child_path.as_deref(), {
        let link_id = link_id.clone();
        move |node| match prior {
            Some(prev) => {
                node.links.insert(link_id, prev);
            }
            None => {
                node.links.remove(&link_id);
            }
        }
    })
    .await?;
    ctx.persist().await?;
    ctx.emit(DeployEvent::LinkUpdate {
        instance_id: ctx.root_instance_id,
        link_id,
        status,
        precise_status: precise,
        rollback: true,
    })
    .await
}
