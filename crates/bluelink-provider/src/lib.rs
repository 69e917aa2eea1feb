pub mod error;
pub mod locks;
pub mod path;
pub mod provider;
pub mod registry;
pub mod stub;

pub use error::{ProviderError, SuggestedAction};
pub use locks::{ResourceLockKey, ResourceLockTable};
pub use provider::{
    CustomVariableTypeHandler, DataSourceHandler, DiagnosticLevel, ExternalLookupInput,
    ExternalLookupResult, ExternalStateInput, LinkChangesOutput, LinkHandler,
    LinkIntermediariesInput, LinkIntermediariesOutput, LinkPriorityResource, LinkStageInput,
    LinkUpdateInput, LinkUpdateOutput, Provider, ResourceDeployInput, ResourceDeployOutput,
    ResourceDestroyInput, ResourceHandler, ResourceSpecDefinition, StabilisationCheckInput,
    Transformer, ValidationDiagnostic,
};
pub use registry::{DeployedResource, ResolvedHandler, ResourceRegistry};
pub use stub::{CallRecord, StubBehavior, StubProvider, StubTransformer};
