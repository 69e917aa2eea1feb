use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    #[error("invalid instance name: {0}")]
    InvalidInstanceName(String),

    #[error("invalid resource type '{0}': expected namespace/category/kind")]
    InvalidResourceType(String),

    #[error("invalid link id: {0}")]
    InvalidLinkId(String),

    #[error("invalid child path: {0}")]
    InvalidChildPath(String),
}
