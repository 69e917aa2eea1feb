use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluelink_domain::ResourceTypeId;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{
    CustomVariableTypeHandler, DataSourceHandler, ExternalLookupInput, ExternalLookupResult,
    ExternalStateInput, LinkChangesOutput, LinkHandler, LinkIntermediariesInput,
    LinkIntermediariesOutput, LinkPriorityResource, LinkStageInput, LinkUpdateInput,
    LinkUpdateOutput, Provider, ResourceDeployInput, ResourceDeployOutput, ResourceDestroyInput,
    ResourceHandler, ResourceSpecDefinition, StabilisationCheckInput, Transformer,
};

/// One observed plugin call, recorded by the stub for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// `deploy`, `destroy`, `external-state`, `link:stage-changes`,
    /// `link:update-resource-a`, `link:update-resource-b`,
    /// `link:update-intermediaries`.
    pub operation: String,
    /// Resource name or link id.
    pub name: String,
    pub rollback: bool,
}

/// Scripted behaviour for one resource name (or link id).
#[derive(Debug, Clone, Default)]
pub struct StubBehavior {
    /// Fail this many deploys before succeeding.
    pub fail_times: u32,
    pub fail_always: bool,
    /// Whether injected failures are retryable.
    pub retryable: bool,
    pub fail_destroy: bool,
    /// External state returned instead of mirroring the persisted spec.
    pub external_spec: Option<Value>,
    /// Report the resource as absent externally.
    pub external_missing: bool,
    /// Tag-based lookup result; `None` marks the lookup unsupported.
    pub lookup_exists: Option<bool>,
    /// has-stabilised reports true from this poll count onward.
    pub stabilise_after_polls: u32,
    /// Fail the named link phase, e.g. `update-resource-b`.
    pub fail_link_phase: Option<String>,
    /// Desired link data payloads keyed by consumer resource name.
    pub link_data: Option<HashMap<String, Value>>,
}

struct StubInner {
    namespace: String,
    calls: Mutex<Vec<CallRecord>>,
    behaviors: Mutex<HashMap<String, StubBehavior>>,
    failures_left: Mutex<HashMap<String, u32>>,
    polls: Mutex<HashMap<String, u32>>,
    stabilised_deps: Mutex<HashMap<ResourceTypeId, Vec<ResourceTypeId>>>,
    data_sources: Mutex<HashMap<ResourceTypeId, Value>>,
    link_priority_b: AtomicBool,
}

impl StubInner {
    fn record(&self, operation: &str, name: &str, rollback: bool) {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.push(CallRecord {
            operation: operation.to_string(),
            name: name.to_string(),
            rollback,
        });
    }

    fn behavior(&self, name: &str) -> StubBehavior {
        let behaviors = self.behaviors.lock().unwrap_or_else(|e| e.into_inner());
        behaviors.get(name).cloned().unwrap_or_default()
    }

    fn next_deploy_failure(&self, name: &str, resource_type: &str) -> Option<ProviderError> {
        let behavior = self.behavior(name);
        let fail = if behavior.fail_always {
            true
        } else {
            let mut left = self.failures_left.lock().unwrap_or_else(|e| e.into_inner());
            let entry = left.entry(name.to_string()).or_insert(behavior.fail_times);
            if *entry > 0 {
                *entry -= 1;
                true
            } else {
                false
            }
        };
        fail.then(|| ProviderError::PluginCallFailed {
            resource_type: resource_type.to_string(),
            message: format!("simulated failure deploying '{name}'"),
            retryable: behavior.retryable,
        })
    }

    fn link_phase_failure(&self, link_id: &str, phase: &str) -> Option<ProviderError> {
        let behavior = self.behavior(link_id);
        (behavior.fail_link_phase.as_deref() == Some(phase)).then(|| {
            ProviderError::PluginCallFailed {
                resource_type: format!("{link_id} link"),
                message: format!("simulated failure in {phase} for '{link_id}'"),
                retryable: false,
            }
        })
    }
}

/// A provider that simulates infrastructure in process.
///
/// - Produces synthetic computed fields (`id = stub://<namespace>/<name>`).
/// - Scripted per-name failures, stabilisation delays and external state.
/// - Records every call (with its rollback flag) for assertions.
pub struct StubProvider {
    inner: Arc<StubInner>,
}

impl StubProvider {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StubInner {
                namespace: namespace.into(),
                calls: Mutex::new(Vec::new()),
                behaviors: Mutex::new(HashMap::new()),
                failures_left: Mutex::new(HashMap::new()),
                polls: Mutex::new(HashMap::new()),
                stabilised_deps: Mutex::new(HashMap::new()),
                data_sources: Mutex::new(HashMap::new()),
                link_priority_b: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_behavior(&self, name: impl Into<String>, behavior: StubBehavior) {
        let name = name.into();
        let mut behaviors = self
            .inner
            .behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        behaviors.insert(name.clone(), behavior);
        // Re-arm the failure budget so scripted failures apply from now on.
        let mut failures = self
            .inner
            .failures_left
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        failures.remove(&name);
    }

    pub fn set_stabilised_dependencies(
        &self,
        resource_type: ResourceTypeId,
        dependencies: Vec<ResourceTypeId>,
    ) {
        let mut deps = self
            .inner
            .stabilised_deps
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        deps.insert(resource_type, dependencies);
    }

    pub fn set_data_source(&self, source_type: ResourceTypeId, value: Value) {
        let mut sources = self
            .inner
            .data_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sources.insert(source_type, value);
    }

    /// Make links report resource B as the priority endpoint.
    pub fn set_link_priority_b(&self, priority_b: bool) {
        self.inner.link_priority_b.store(priority_b, Ordering::SeqCst);
    }

    /// Snapshot of every recorded call, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls_for(&self, operation: &str, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation == operation && c.name == name)
            .count()
    }

    pub fn stabilisation_polls(&self, name: &str) -> u32 {
        let polls = self.inner.polls.lock().unwrap_or_else(|e| e.into_inner());
        polls.get(name).copied().unwrap_or(0)
    }
}

impl Provider for StubProvider {
    fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn resource(&self, resource_type: &ResourceTypeId) -> Option<Arc<dyn ResourceHandler>> {
        if resource_type.namespace() != Some(self.inner.namespace.as_str()) {
            return None;
        }
        Some(Arc::new(StubResourceHandler {
            inner: Arc::clone(&self.inner),
            resource_type: resource_type.clone(),
        }))
    }

    fn link(
        &self,
        resource_type_a: &ResourceTypeId,
        resource_type_b: &ResourceTypeId,
    ) -> Option<Arc<dyn LinkHandler>> {
        let ns = Some(self.inner.namespace.as_str());
        if resource_type_a.namespace() != ns && resource_type_b.namespace() != ns {
            return None;
        }
        Some(Arc::new(StubLinkHandler {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn data_source(&self, source_type: &ResourceTypeId) -> Option<Arc<dyn DataSourceHandler>> {
        let sources = self
            .inner
            .data_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sources.get(source_type).map(|value| {
            Arc::new(StubDataSourceHandler {
                value: value.clone(),
            }) as Arc<dyn DataSourceHandler>
        })
    }

    fn custom_variable_type(
        &self,
        _variable_type: &str,
    ) -> Option<Arc<dyn CustomVariableTypeHandler>> {
        None
    }

    fn list_resource_types(&self) -> Vec<ResourceTypeId> {
        vec![ResourceTypeId::new(format!(
            "{}/stub/resource",
            self.inner.namespace
        ))]
    }
}

// ── Resource handler ──────────────────────────────────────────────────────────

struct StubResourceHandler {
    inner: Arc<StubInner>,
    resource_type: ResourceTypeId,
}

#[async_trait]
impl ResourceHandler for StubResourceHandler {
    fn spec_definition(&self) -> Result<ResourceSpecDefinition, ProviderError> {
        Ok(ResourceSpecDefinition {
            id_field: "id".to_string(),
            schema: json!({"type": "object"}),
        })
    }

    fn type_description(&self) -> String {
        format!("stub resource type {}", self.resource_type)
    }

    fn stabilised_dependencies(&self) -> Vec<ResourceTypeId> {
        let deps = self
            .inner
            .stabilised_deps
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        deps.get(&self.resource_type).cloned().unwrap_or_default()
    }

    async fn deploy(
        &self,
        input: &ResourceDeployInput,
    ) -> Result<ResourceDeployOutput, ProviderError> {
        self.inner.record("deploy", &input.resource_name, input.rollback);
        if let Some(err) = self
            .inner
            .next_deploy_failure(&input.resource_name, self.resource_type.as_str())
        {
            return Err(err);
        }
        debug!(resource = %input.resource_name, "StubProvider: deploy");
        let mut computed = HashMap::new();
        computed.insert(
            "id".to_string(),
            json!(format!(
                "stub://{}/{}",
                self.inner.namespace, input.resource_name
            )),
        );
        Ok(ResourceDeployOutput {
            computed_fields: computed,
        })
    }

    async fn destroy(&self, input: &ResourceDestroyInput) -> Result<(), ProviderError> {
        self.inner
            .record("destroy", &input.resource_name, input.rollback);
        let behavior = self.inner.behavior(&input.resource_name);
        if behavior.fail_destroy {
            return Err(ProviderError::PluginCallFailed {
                resource_type: self.resource_type.to_string(),
                message: format!("simulated failure destroying '{}'", input.resource_name),
                retryable: false,
            });
        }
        Ok(())
    }

    async fn has_stabilised(
        &self,
        input: &StabilisationCheckInput,
    ) -> Result<bool, ProviderError> {
        let behavior = self.inner.behavior(&input.resource_name);
        let mut polls = self.inner.polls.lock().unwrap_or_else(|e| e.into_inner());
        let count = polls.entry(input.resource_name.clone()).or_insert(0);
        *count += 1;
        Ok(*count >= behavior.stabilise_after_polls)
    }

    async fn external_state(
        &self,
        input: &ExternalStateInput,
    ) -> Result<Option<Value>, ProviderError> {
        self.inner
            .record("external-state", &input.resource_name, false);
        let behavior = self.inner.behavior(&input.resource_name);
        if behavior.external_missing {
            return Ok(None);
        }
        Ok(Some(
            behavior
                .external_spec
                .unwrap_or_else(|| input.spec_data.clone()),
        ))
    }

    async fn lookup_external(
        &self,
        input: &ExternalLookupInput,
    ) -> Result<Option<ExternalLookupResult>, ProviderError> {
        let behavior = self.inner.behavior(&input.resource_name);
        Ok(behavior.lookup_exists.map(|exists| ExternalLookupResult {
            exists,
            external_spec: behavior.external_spec.clone(),
        }))
    }
}

// ── Link handler ──────────────────────────────────────────────────────────────

struct StubLinkHandler {
    inner: Arc<StubInner>,
}

impl StubLinkHandler {
    fn desired_link_data(&self, input: &LinkStageInput) -> HashMap<String, Value> {
        let behavior = self.inner.behavior(input.link_id.as_str());
        if let Some(data) = behavior.link_data {
            return data;
        }
        let (Some(a), Some(b)) = (&input.resource_a, &input.resource_b) else {
            return HashMap::new();
        };
        HashMap::from([(
            b.name.clone(),
            json!({"sourceEndpoint": format!("stub://{}/{}", self.inner.namespace, a.name)}),
        )])
    }
}

#[async_trait]
impl LinkHandler for StubLinkHandler {
    fn priority_resource(&self) -> LinkPriorityResource {
        if self.inner.link_priority_b.load(Ordering::SeqCst) {
            LinkPriorityResource::ResourceB
        } else {
            LinkPriorityResource::ResourceA
        }
    }

    async fn stage_changes(
        &self,
        input: &LinkStageInput,
    ) -> Result<LinkChangesOutput, ProviderError> {
        self.inner
            .record("link:stage-changes", input.link_id.as_str(), false);
        if let Some(err) = self
            .inner
            .link_phase_failure(input.link_id.as_str(), "stage-changes")
        {
            return Err(err);
        }

        let desired = self.desired_link_data(input);
        let current = input
            .current_link
            .as_ref()
            .map(|l| l.data.clone())
            .unwrap_or_default();
        let link_data_updates: HashMap<String, Value> = desired
            .into_iter()
            .filter(|(consumer, value)| current.get(consumer) != Some(value))
            .collect();
        Ok(LinkChangesOutput { link_data_updates })
    }

    async fn update_resource_a(
        &self,
        input: &LinkUpdateInput,
    ) -> Result<LinkUpdateOutput, ProviderError> {
        self.inner.record(
            "link:update-resource-a",
            input.link_id.as_str(),
            input.rollback,
        );
        if let Some(err) = self
            .inner
            .link_phase_failure(input.link_id.as_str(), "update-resource-a")
        {
            return Err(err);
        }
        Ok(LinkUpdateOutput {
            link_data: input.link_data.clone(),
            resource_data_mappings: HashMap::from([(
                format!("{}.spec.linkEndpoint", input.resource.name),
                "sourceEndpoint".to_string(),
            )]),
        })
    }

    async fn update_resource_b(
        &self,
        input: &LinkUpdateInput,
    ) -> Result<LinkUpdateOutput, ProviderError> {
        self.inner.record(
            "link:update-resource-b",
            input.link_id.as_str(),
            input.rollback,
        );
        if let Some(err) = self
            .inner
            .link_phase_failure(input.link_id.as_str(), "update-resource-b")
        {
            return Err(err);
        }
        Ok(LinkUpdateOutput {
            link_data: input.link_data.clone(),
            resource_data_mappings: HashMap::from([(
                format!("{}.spec.linkEndpoint", input.resource.name),
                "sourceEndpoint".to_string(),
            )]),
        })
    }

    async fn update_intermediary_resources(
        &self,
        input: &LinkIntermediariesInput,
    ) -> Result<LinkIntermediariesOutput, ProviderError> {
        self.inner.record(
            "link:update-intermediaries",
            input.link_id.as_str(),
            input.rollback,
        );
        if let Some(err) = self
            .inner
            .link_phase_failure(input.link_id.as_str(), "update-intermediaries")
        {
            return Err(err);
        }
        Ok(LinkIntermediariesOutput {
            intermediaries: input.current_intermediaries.clone(),
            link_data: input.link_data.clone(),
        })
    }
}

// ── Data source handler ───────────────────────────────────────────────────────

struct StubDataSourceHandler {
    value: Value,
}

#[async_trait]
impl DataSourceHandler for StubDataSourceHandler {
    async fn fetch(&self, _filters: &Value) -> Result<Value, ProviderError> {
        Ok(self.value.clone())
    }
}

// ── Transformer ───────────────────────────────────────────────────────────────

/// A transformer serving every abstract type under one prefix.
pub struct StubTransformer {
    inner: Arc<StubInner>,
}

impl StubTransformer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StubInner {
                namespace: prefix.into(),
                calls: Mutex::new(Vec::new()),
                behaviors: Mutex::new(HashMap::new()),
                failures_left: Mutex::new(HashMap::new()),
                polls: Mutex::new(HashMap::new()),
                stabilised_deps: Mutex::new(HashMap::new()),
                data_sources: Mutex::new(HashMap::new()),
                link_priority_b: AtomicBool::new(false),
            }),
        }
    }
}

impl Transformer for StubTransformer {
    fn prefix(&self) -> &str {
        &self.inner.namespace
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn abstract_resource(
        &self,
        resource_type: &ResourceTypeId,
    ) -> Option<Arc<dyn ResourceHandler>> {
        if !resource_type.as_str().starts_with(self.inner.namespace.as_str()) {
            return None;
        }
        Some(Arc::new(StubResourceHandler {
            inner: Arc::clone(&self.inner),
            resource_type: resource_type.clone(),
        }))
    }

    fn list_abstract_types(&self) -> Vec<ResourceTypeId> {
        vec![ResourceTypeId::new(format!("{}handler", self.inner.namespace))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_domain::{InstanceId, LinkId, ResourceId};

    fn deploy_input(name: &str) -> ResourceDeployInput {
        ResourceDeployInput {
            instance_id: InstanceId::generate(),
            resource_id: ResourceId::generate(),
            resource_name: name.to_string(),
            resolved_spec: json!({}),
            current_state: None,
            rollback: false,
        }
    }

    #[tokio::test]
    async fn fail_times_scripts_transient_failures() {
        let provider = StubProvider::new("aws");
        provider.set_behavior(
            "flaky",
            StubBehavior {
                fail_times: 2,
                retryable: true,
                ..Default::default()
            },
        );
        let handler = provider
            .resource(&ResourceTypeId::new("aws/dynamodb/table"))
            .unwrap();

        let input = deploy_input("flaky");
        assert!(handler.deploy(&input).await.unwrap_err().is_retryable());
        assert!(handler.deploy(&input).await.is_err());
        assert!(handler.deploy(&input).await.is_ok());
        assert_eq!(provider.calls_for("deploy", "flaky"), 3);
    }

    #[tokio::test]
    async fn link_stage_changes_settles_once_applied() {
        let provider = StubProvider::new("aws");
        let handler = provider
            .link(
                &ResourceTypeId::new("aws/lambda/function"),
                &ResourceTypeId::new("aws/dynamodb/table"),
            )
            .unwrap();

        let instance_id = InstanceId::generate();
        let a = bluelink_state::ResourceState::new(
            instance_id,
            "ordersApi",
            ResourceTypeId::new("aws/lambda/function"),
        );
        let b = bluelink_state::ResourceState::new(
            instance_id,
            "ordersTable",
            ResourceTypeId::new("aws/dynamodb/table"),
        );

        let mut input = LinkStageInput {
            instance_id,
            link_id: LinkId::from_endpoints("ordersApi", "ordersTable"),
            resource_a: Some(a),
            resource_b: Some(b),
            current_link: None,
            label_selector: None,
        };
        let first = handler.stage_changes(&input).await.unwrap();
        assert!(!first.link_data_updates.is_empty());

        // Apply the staged data, then restage: no further updates.
        let mut link = bluelink_state::LinkState::new(instance_id, input.link_id.clone());
        link.data = first.link_data_updates.clone();
        input.current_link = Some(link);
        let second = handler.stage_changes(&input).await.unwrap();
        assert!(second.link_data_updates.is_empty());
    }
}
