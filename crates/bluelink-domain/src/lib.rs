mod error;
mod tests;
mod types;

pub use error::DomainError;
pub use types::{
    BlueprintDocument, ChannelId, ChangesetId, DataSourceDefinition, ExportDefinition, InstanceId,
    LinkDefinition, LinkId, ResourceDefinition, ResourceId, ResourceMetadata, ResourceTypeId,
};

/// Engine version stamped into resource provenance records.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
