use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown dependency: '{dependent}' depends on '{dependency}' which is not a resource or child of this blueprint")]
    UnknownDependency {
        dependent: String,
        dependency: String,
    },

    #[error("unknown link endpoint: link '{link}' references '{endpoint}' which does not exist in this blueprint or a descendant child")]
    UnknownLinkEndpoint { link: String, endpoint: String },

    #[error("name collision: '{name}' is declared as both a resource and a child blueprint")]
    NameCollision { name: String },

    #[error("cycle detected in resource dependency graph")]
    CycleDetected,

    #[error("multiple errors")]
    Multiple(Vec<GraphError>),
}
