use bluelink_domain::{ChangesetId, InstanceId};
use bluelink_state::ReconciliationResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("changeset not found: {0}")]
    ChangesetNotFound(ChangesetId),

    #[error("changeset {0} is not complete")]
    ChangesetIncomplete(ChangesetId),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// At-most-one in-flight mutation per instance.
    #[error("instance {instance_id} already has a {operation} in flight")]
    InstanceBusy {
        instance_id: InstanceId,
        operation: String,
    },

    /// Drift was detected during staging and the deploy was not forced.
    /// Maps to HTTP 409 with `{message, reconciliationResult}` upstream.
    #[error("deployment blocked: drift detected, rerun with force to override")]
    DriftBlocked {
        reconciliation_result: Box<ReconciliationResult>,
    },

    #[error("failed to resolve '{reference}' in resource '{resource}'")]
    ResolveFailed { resource: String, reference: String },

    #[error("graph error: {0}")]
    Graph(#[from] bluelink_graph::GraphError),

    #[error("state error: {0}")]
    State(#[from] bluelink_state::StateError),

    #[error("provider error: {0}")]
    Provider(#[from] bluelink_provider::ProviderError),

    #[error("event error: {0}")]
    Event(#[from] bluelink_events::EventError),

    #[error("reconciliation error: {0}")]
    Reconcile(#[from] bluelink_reconcile::ReconcileError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("multiple errors")]
    Multiple(Vec<DeployError>),
}

impl DeployError {
    /// Collapse parallel-worker failures, preferring a single error when
    /// only one worker failed.
    pub fn aggregate(mut errors: Vec<DeployError>) -> DeployError {
        if errors.len() == 1 {
            return errors.remove(0);
        }
        DeployError::Multiple(errors)
    }
}
