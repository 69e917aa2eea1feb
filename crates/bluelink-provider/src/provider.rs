use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bluelink_domain::{InstanceId, LinkId, ResourceId, ResourceTypeId};
use bluelink_state::{LinkIntermediaryResourceState, LinkState, ResourceState};
use serde_json::Value;

use crate::error::ProviderError;

/// Spec metadata a plugin declares for one resource type.
#[derive(Debug, Clone)]
pub struct ResourceSpecDefinition {
    /// Dotted path within spec data holding the externally-assigned ID.
    pub id_field: String,
    /// Schema payload, opaque to the core.
    pub schema: Value,
}

impl ResourceSpecDefinition {
    /// True when the plugin effectively declared nothing.
    pub fn is_empty(&self) -> bool {
        self.id_field.is_empty() && self.schema.is_null()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone)]
pub struct ValidationDiagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub field_path: Option<String>,
}

// ── Resource operations ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResourceDeployInput {
    pub instance_id: InstanceId,
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub resolved_spec: Value,
    /// Present for updates; `None` for first-time creates.
    pub current_state: Option<ResourceState>,
    /// Set by the orchestrator when this deploy restores prior state.
    pub rollback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceDeployOutput {
    /// Provider-computed values merged into the resolved spec by the
    /// registry, keyed by dotted path.
    pub computed_fields: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ResourceDestroyInput {
    pub instance_id: InstanceId,
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub spec_data: Value,
    pub rollback: bool,
}

#[derive(Debug, Clone)]
pub struct StabilisationCheckInput {
    pub instance_id: InstanceId,
    pub resource_name: String,
    pub spec_data: Value,
}

#[derive(Debug, Clone)]
pub struct ExternalStateInput {
    pub instance_id: InstanceId,
    pub resource_name: String,
    pub spec_data: Value,
}

#[derive(Debug, Clone)]
pub struct ExternalLookupInput {
    pub instance_id: InstanceId,
    pub resource_name: String,
    pub resource_type: ResourceTypeId,
}

#[derive(Debug, Clone)]
pub struct ExternalLookupResult {
    pub exists: bool,
    pub external_spec: Option<Value>,
}

/// One concrete (or abstract) resource type's lifecycle operations.
///
/// Implementations must be safe under concurrent invocation; handles are
/// cached and shared across operations.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    fn spec_definition(&self) -> Result<ResourceSpecDefinition, ProviderError>;

    fn type_description(&self) -> String;

    /// Resource types whose stabilisation this type depends on. A deploy of
    /// an upstream resource waits for stabilisation when a downstream
    /// dependency lists the upstream type here.
    fn stabilised_dependencies(&self) -> Vec<ResourceTypeId> {
        Vec::new()
    }

    async fn custom_validate(
        &self,
        _spec: &Value,
    ) -> Result<Vec<ValidationDiagnostic>, ProviderError> {
        Ok(Vec::new())
    }

    async fn deploy(
        &self,
        input: &ResourceDeployInput,
    ) -> Result<ResourceDeployOutput, ProviderError>;

    async fn destroy(&self, input: &ResourceDestroyInput) -> Result<(), ProviderError>;

    async fn has_stabilised(
        &self,
        _input: &StabilisationCheckInput,
    ) -> Result<bool, ProviderError> {
        Ok(true)
    }

    /// Read the externally observable spec without modifying anything.
    /// `Ok(None)` means the resource no longer exists externally.
    async fn external_state(
        &self,
        input: &ExternalStateInput,
    ) -> Result<Option<Value>, ProviderError>;

    /// Tag-based existence lookup for interrupted resources. `Ok(None)`
    /// means the provider does not support this lookup.
    async fn lookup_external(
        &self,
        _input: &ExternalLookupInput,
    ) -> Result<Option<ExternalLookupResult>, ProviderError> {
        Ok(None)
    }
}

// ── Link operations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPriorityResource {
    /// Resource A's update runs first.
    ResourceA,
    /// Resource B's update runs first.
    ResourceB,
    /// No preference; A runs first.
    None,
}

#[derive(Debug, Clone)]
pub struct LinkStageInput {
    pub instance_id: InstanceId,
    pub link_id: LinkId,
    pub resource_a: Option<ResourceState>,
    pub resource_b: Option<ResourceState>,
    pub current_link: Option<LinkState>,
    pub label_selector: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkChangesOutput {
    /// Pending payload changes keyed by consumer resource name. Empty means
    /// the link is already settled.
    pub link_data_updates: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct LinkUpdateInput {
    pub instance_id: InstanceId,
    pub link_id: LinkId,
    /// The endpoint being updated in this phase.
    pub resource: ResourceState,
    pub other_resource: Option<ResourceState>,
    pub link_data: HashMap<String, Value>,
    pub rollback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LinkUpdateOutput {
    /// Replacement link data payloads keyed by consumer resource name.
    pub link_data: HashMap<String, Value>,
    /// Consumer field path → link data path.
    pub resource_data_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LinkIntermediariesInput {
    pub instance_id: InstanceId,
    pub link_id: LinkId,
    pub link_data: HashMap<String, Value>,
    pub current_intermediaries: Vec<LinkIntermediaryResourceState>,
    pub rollback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LinkIntermediariesOutput {
    pub intermediaries: Vec<LinkIntermediaryResourceState>,
    pub link_data: HashMap<String, Value>,
}

/// A link implementation: interleaves updates to its two endpoint resources
/// and manages any intermediary resources of its own.
#[async_trait]
pub trait LinkHandler: Send + Sync + 'static {
    /// Which endpoint updates first.
    fn priority_resource(&self) -> LinkPriorityResource {
        LinkPriorityResource::None
    }

    async fn stage_changes(
        &self,
        input: &LinkStageInput,
    ) -> Result<LinkChangesOutput, ProviderError>;

    async fn update_resource_a(
        &self,
        input: &LinkUpdateInput,
    ) -> Result<LinkUpdateOutput, ProviderError>;

    async fn update_resource_b(
        &self,
        input: &LinkUpdateInput,
    ) -> Result<LinkUpdateOutput, ProviderError>;

    async fn update_intermediary_resources(
        &self,
        input: &LinkIntermediariesInput,
    ) -> Result<LinkIntermediariesOutput, ProviderError>;
}

// ── Data sources & custom variable types ──────────────────────────────────────

#[async_trait]
pub trait DataSourceHandler: Send + Sync + 'static {
    /// Fetch external data matching the provider-interpreted filters.
    async fn fetch(&self, filters: &Value) -> Result<Value, ProviderError>;
}

pub trait CustomVariableTypeHandler: Send + Sync + 'static {
    /// Allowed values, consumed by the upstream validation pipeline.
    fn options(&self) -> Result<Vec<String>, ProviderError>;
}

// ── Plugin capability sets ────────────────────────────────────────────────────

/// A provider plugin: concrete resource types under one namespace, plus the
/// link, data-source and custom-variable-type capabilities it ships.
pub trait Provider: Send + Sync + 'static {
    /// The namespace this provider owns (first segment of its types).
    fn namespace(&self) -> &str;

    fn version(&self) -> &str;

    fn resource(&self, resource_type: &ResourceTypeId) -> Option<Arc<dyn ResourceHandler>>;

    fn link(
        &self,
        resource_type_a: &ResourceTypeId,
        resource_type_b: &ResourceTypeId,
    ) -> Option<Arc<dyn LinkHandler>>;

    fn data_source(&self, source_type: &ResourceTypeId) -> Option<Arc<dyn DataSourceHandler>>;

    fn custom_variable_type(
        &self,
        variable_type: &str,
    ) -> Option<Arc<dyn CustomVariableTypeHandler>>;

    fn list_resource_types(&self) -> Vec<ResourceTypeId>;
}

/// A transformer plugin: abstract resource types under a registration-time
/// unique prefix, expanded into concrete resources by the plugin.
pub trait Transformer: Send + Sync + 'static {
    /// The abstract type prefix this transformer owns.
    fn prefix(&self) -> &str;

    fn version(&self) -> &str;

    fn abstract_resource(&self, resource_type: &ResourceTypeId)
        -> Option<Arc<dyn ResourceHandler>>;

    fn list_abstract_types(&self) -> Vec<ResourceTypeId>;
}
