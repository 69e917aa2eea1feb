use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("state error: {0}")]
    State(#[from] bluelink_state::StateError),

    #[error("provider error: {0}")]
    Provider(#[from] bluelink_provider::ProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}
