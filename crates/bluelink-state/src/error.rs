use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("link not found: {0}")]
    LinkNotFound(String),

    #[error("changeset not found: {0}")]
    ChangesetNotFound(String),

    /// On-disk chunk/index disagreement. Fatal for the affected entity class.
    #[error("malformed state for entity '{entity}': {message}")]
    Malformed { entity: String, message: String },

    /// The per-channel event partition hit its hard size cap.
    #[error("event partition full for channel '{channel}': {size} bytes exceeds cap {cap}")]
    EventPartitionFull {
        channel: String,
        size: u64,
        cap: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal store error: {0}")]
    Internal(String),
}
