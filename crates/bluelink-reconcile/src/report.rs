use bluelink_domain::{ChangesetId, InstanceId, LinkId};
use bluelink_state::{PreciseResourceStatus, RecommendedAction, ResourceStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which nodes a reconciliation check covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconciliationScope {
    All,
    /// Specific resources/links by name. Dotted paths address descendants.
    Named {
        resources: Vec<String>,
        links: Vec<String>,
    },
    InterruptedOnly,
}

impl ReconciliationScope {
    pub(crate) fn includes_resource(
        &self,
        qualified_name: &str,
        status: ResourceStatus,
    ) -> bool {
        match self {
            ReconciliationScope::All => true,
            ReconciliationScope::Named { resources, .. } => {
                resources.iter().any(|r| r == qualified_name)
            }
            ReconciliationScope::InterruptedOnly => status.is_transitional(),
        }
    }

    pub(crate) fn includes_link(&self, qualified_name: &str) -> bool {
        match self {
            ReconciliationScope::All => true,
            ReconciliationScope::Named { links, .. } => links.iter().any(|l| l == qualified_name),
            ReconciliationScope::InterruptedOnly => false,
        }
    }

    /// Whether this scope explicitly named the node (state-refresh entries
    /// are only produced for explicit requests).
    pub(crate) fn names_explicitly(&self, qualified_name: &str) -> bool {
        matches!(self, ReconciliationScope::Named { resources, .. }
            if resources.iter().any(|r| r == qualified_name))
    }
}

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub instance_id: InstanceId,
    /// Staging passes its changeset so the result indexes under it too.
    pub changeset_id: Option<ChangesetId>,
    pub scope: ReconciliationScope,
}

/// One operator decision to apply.
#[derive(Debug, Clone)]
pub struct ApplyAction {
    pub target: ApplyTarget,
    pub action: RecommendedAction,
    /// Required for `accept-external` on a resource.
    pub external_spec: Option<Value>,
    /// Required for `update-status`.
    pub new_precise_status: Option<PreciseResourceStatus>,
    /// Link data to merge for `accept-external` on a link.
    pub link_data_updates: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum ApplyTarget {
    Resource {
        name: String,
        child_path: Option<String>,
    },
    Link {
        link_id: LinkId,
        child_path: Option<String>,
    },
}

impl std::fmt::Display for ApplyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyTarget::Resource { name, child_path } => match child_path {
                Some(path) => write!(f, "resource {path}.{name}"),
                None => write!(f, "resource {name}"),
            },
            ApplyTarget::Link { link_id, child_path } => match child_path {
                Some(path) => write!(f, "link {path}.{link_id}"),
                None => write!(f, "link {link_id}"),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub instance_id: InstanceId,
    pub actions: Vec<ApplyAction>,
}

/// Best-effort apply summary: per-node failures collect into `errors`
/// without aborting siblings.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub errors: Vec<String>,
}
