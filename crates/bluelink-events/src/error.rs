use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("channel '{0}' already completed")]
    ChannelCompleted(String),

    #[error(transparent)]
    State(#[from] bluelink_state::StateError),
}
