pub mod error;
pub mod state;
pub mod changes;
pub mod records;
pub mod diff;
pub mod events;
pub mod store;
pub mod chunks;
pub mod memfile;
pub mod postgres;

pub use error::StateError;
pub use state::{
    compute_spec_hash, ExportState, InstanceDurations, InstanceState, InstanceStatus,
    LinkCompletionDurations, LinkIntermediaryResourceState, LinkState, LinkStatus,
    PreciseLinkStatus, PreciseResourceStatus, ResourceCompletionDurations, ResourceState,
    ResourceStatus, SystemProvenance,
};
pub use changes::{
    BlueprintChanges, Changeset, ChangesetStatus, FieldChange, LinkChanges, ResourceChanges,
};
pub use records::{
    BlueprintValidation, CleanupOperation, CleanupStatus, CleanupType, DriftDifference,
    LinkDriftState, LinkReconciliationEntry, ReconciliationKind, ReconciliationResult,
    RecommendedAction, ResourceDriftState, ResourceReconciliationEntry, ValidationStatus,
};
pub use diff::{diff_specs, SpecDiff};
pub use events::EventRecord;
pub use store::StateContainer;
pub use memfile::MemfileStateContainer;
pub use postgres::PostgresStateContainer;
