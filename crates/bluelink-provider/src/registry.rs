use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bluelink_domain::{InstanceId, ResourceTypeId};
use bluelink_state::{InstanceState, ResourceState};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;
use crate::locks::{ResourceLockKey, ResourceLockTable};
use crate::path;
use crate::provider::{
    CustomVariableTypeHandler, DataSourceHandler, LinkHandler, Provider, ResourceDeployInput,
    ResourceDestroyInput, ResourceHandler, ResourceSpecDefinition, StabilisationCheckInput,
    Transformer, ValidationDiagnostic,
};

/// A cached type-string resolution: the handler plus the provenance of the
/// plugin that served it.
#[derive(Clone)]
pub struct ResolvedHandler {
    pub handler: Arc<dyn ResourceHandler>,
    pub plugin_namespace: String,
    pub plugin_version: String,
}

impl std::fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("plugin_namespace", &self.plugin_namespace)
            .field("plugin_version", &self.plugin_version)
            .finish()
    }
}

/// Result of a registry deploy: the merged spec plus which dotted paths the
/// plugin computed (as opposed to caller-resolved input).
#[derive(Debug, Clone)]
pub struct DeployedResource {
    pub spec_data: Value,
    pub computed_field_paths: Vec<String>,
}

/// Routes lifecycle operations to provider/transformer implementations,
/// caches plugin handles, polls for stabilisation and mediates the
/// cross-resource lock table.
///
/// Handler and spec lookups are pure functions of the type string, so both
/// caches live indefinitely and are shared by derived registries.
pub struct ResourceRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    /// Ordered by prefix so abstract dispatch is deterministic even if a
    /// transformer violates the disjoint-prefix convention upstream.
    transformers: BTreeMap<String, Arc<dyn Transformer>>,
    handler_cache: Arc<RwLock<HashMap<ResourceTypeId, ResolvedHandler>>>,
    spec_cache: Arc<RwLock<HashMap<ResourceTypeId, ResourceSpecDefinition>>>,
    locks: Arc<ResourceLockTable>,
    stabilisation_interval: Duration,
    params: HashMap<String, Value>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("stabilisation_interval", &self.stabilisation_interval)
            .field("params", &self.params)
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(stabilisation_interval: Duration, locks: Arc<ResourceLockTable>) -> Self {
        Self {
            providers: HashMap::new(),
            transformers: BTreeMap::new(),
            handler_cache: Arc::new(RwLock::new(HashMap::new())),
            spec_cache: Arc::new(RwLock::new(HashMap::new())),
            locks,
            stabilisation_interval,
            params: HashMap::new(),
        }
    }

    /// Register a provider under its namespace. Returns `&mut self` for
    /// chaining.
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers
            .insert(provider.namespace().to_string(), provider);
        self
    }

    /// Register a transformer. Abstract type prefixes must be unique.
    pub fn register_transformer(
        &mut self,
        transformer: Arc<dyn Transformer>,
    ) -> Result<&mut Self, ProviderError> {
        let prefix = transformer.prefix().to_string();
        if self.transformers.contains_key(&prefix) {
            return Err(ProviderError::DuplicateTransformerPrefix(prefix));
        }
        self.transformers.insert(prefix, transformer);
        Ok(self)
    }

    /// Derive a registry carrying different plugin parameters. The lock
    /// table and both caches are shared with the parent.
    pub fn with_params(&self, params: HashMap<String, Value>) -> Self {
        Self {
            providers: self.providers.clone(),
            transformers: self.transformers.clone(),
            handler_cache: Arc::clone(&self.handler_cache),
            spec_cache: Arc::clone(&self.spec_cache),
            locks: Arc::clone(&self.locks),
            stabilisation_interval: self.stabilisation_interval,
            params,
        }
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    pub fn locks(&self) -> &Arc<ResourceLockTable> {
        &self.locks
    }

    // ── Type lookup ───────────────────────────────────────────────────────────

    /// Resolve a type string to its handler, consulting the cache first.
    pub fn resolve(&self, resource_type: &ResourceTypeId) -> Result<ResolvedHandler, ProviderError> {
        {
            let cache = self.handler_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(resource_type) {
                return Ok(hit.clone());
            }
        }

        let resolved = self.resolve_uncached(resource_type)?;
        let mut cache = self.handler_cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(resource_type.clone(), resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(
        &self,
        resource_type: &ResourceTypeId,
    ) -> Result<ResolvedHandler, ProviderError> {
        if let Some(namespace) = resource_type.namespace() {
            if let Some(provider) = self.providers.get(namespace) {
                if let Some(handler) = provider.resource(resource_type) {
                    return Ok(ResolvedHandler {
                        handler,
                        plugin_namespace: provider.namespace().to_string(),
                        plugin_version: provider.version().to_string(),
                    });
                }
            }
        }

        // Abstract types: each transformer owns a disjoint prefix by
        // convention; the first non-null implementation wins.
        for (prefix, transformer) in &self.transformers {
            if let Some(handler) = transformer.abstract_resource(resource_type) {
                debug!(resource_type = %resource_type, prefix = %prefix, "abstract type served by transformer");
                return Ok(ResolvedHandler {
                    handler,
                    plugin_namespace: prefix.clone(),
                    plugin_version: transformer.version().to_string(),
                });
            }
        }

        Err(ProviderError::type_not_found(resource_type.as_str()))
    }

    pub fn has_resource_type(&self, resource_type: &ResourceTypeId) -> bool {
        self.resolve(resource_type).is_ok()
    }

    /// All resource types served by registered providers and transformers.
    pub fn list_resource_types(&self) -> Vec<ResourceTypeId> {
        let mut types: Vec<ResourceTypeId> = self
            .providers
            .values()
            .flat_map(|p| p.list_resource_types())
            .chain(
                self.transformers
                    .values()
                    .flat_map(|t| t.list_abstract_types()),
            )
            .collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types.dedup();
        types
    }

    pub fn get_spec_definition(
        &self,
        resource_type: &ResourceTypeId,
    ) -> Result<ResourceSpecDefinition, ProviderError> {
        {
            let cache = self.spec_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(resource_type) {
                return Ok(hit.clone());
            }
        }

        let resolved = self.resolve(resource_type)?;
        let definition = resolved.handler.spec_definition()?;
        if definition.is_empty() {
            return Err(ProviderError::EmptySpecDefinition(
                resource_type.to_string(),
            ));
        }
        let mut cache = self.spec_cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(resource_type.clone(), definition.clone());
        Ok(definition)
    }

    pub fn get_type_description(
        &self,
        resource_type: &ResourceTypeId,
    ) -> Result<String, ProviderError> {
        Ok(self.resolve(resource_type)?.handler.type_description())
    }

    pub fn stabilised_dependencies(
        &self,
        resource_type: &ResourceTypeId,
    ) -> Result<Vec<ResourceTypeId>, ProviderError> {
        Ok(self.resolve(resource_type)?.handler.stabilised_dependencies())
    }

    pub async fn custom_validate(
        &self,
        resource_type: &ResourceTypeId,
        spec: &Value,
    ) -> Result<Vec<ValidationDiagnostic>, ProviderError> {
        self.resolve(resource_type)?
            .handler
            .custom_validate(spec)
            .await
    }

    // ── Lifecycle dispatch ────────────────────────────────────────────────────

    /// Deploy a resource and return the merged spec data (resolved spec plus
    /// provider-computed fields).
    ///
    /// With `wait_until_stable`, polls the plugin's has-stabilised predicate
    /// at the configured interval until it reports true, the caller cancels,
    /// or the plugin errors. The registry imposes no deadline of its own —
    /// bounding total wait is the caller's job.
    pub async fn deploy(
        &self,
        resource_type: &ResourceTypeId,
        input: &ResourceDeployInput,
        wait_until_stable: bool,
        cancel: &CancellationToken,
    ) -> Result<DeployedResource, ProviderError> {
        let resolved = self.resolve(resource_type)?;
        let output = resolved.handler.deploy(input).await?;

        let mut spec_data = input.resolved_spec.clone();
        let mut computed_field_paths: Vec<String> =
            output.computed_fields.keys().cloned().collect();
        computed_field_paths.sort();
        for (field_path, value) in output.computed_fields {
            path::set_path(&mut spec_data, &field_path, value);
        }

        if wait_until_stable {
            let check = StabilisationCheckInput {
                instance_id: input.instance_id,
                resource_name: input.resource_name.clone(),
                spec_data: spec_data.clone(),
            };
            loop {
                if resolved.handler.has_stabilised(&check).await? {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(self.stabilisation_interval) => {}
                }
            }
        }

        Ok(DeployedResource {
            spec_data,
            computed_field_paths,
        })
    }

    pub async fn destroy(
        &self,
        resource_type: &ResourceTypeId,
        input: &ResourceDestroyInput,
    ) -> Result<(), ProviderError> {
        self.resolve(resource_type)?.handler.destroy(input).await
    }

    pub fn link_handler(
        &self,
        resource_type_a: &ResourceTypeId,
        resource_type_b: &ResourceTypeId,
    ) -> Result<Arc<dyn LinkHandler>, ProviderError> {
        for resource_type in [resource_type_a, resource_type_b] {
            let Some(namespace) = resource_type.namespace() else {
                continue;
            };
            if let Some(provider) = self.providers.get(namespace) {
                if let Some(handler) = provider.link(resource_type_a, resource_type_b) {
                    return Ok(handler);
                }
            }
        }
        Err(ProviderError::type_not_found(format!(
            "{resource_type_a} -> {resource_type_b} link"
        )))
    }

    pub fn data_source_handler(
        &self,
        source_type: &ResourceTypeId,
    ) -> Result<Arc<dyn DataSourceHandler>, ProviderError> {
        let handler = source_type
            .namespace()
            .and_then(|ns| self.providers.get(ns))
            .and_then(|p| p.data_source(source_type));
        handler.ok_or_else(|| ProviderError::type_not_found(source_type.as_str()))
    }

    pub fn custom_variable_type_handler(
        &self,
        variable_type: &str,
    ) -> Result<Arc<dyn CustomVariableTypeHandler>, ProviderError> {
        let handler = variable_type
            .split_once('/')
            .and_then(|(ns, _)| self.providers.get(ns))
            .and_then(|p| p.custom_variable_type(variable_type));
        handler.ok_or_else(|| ProviderError::type_not_found(variable_type))
    }

    // ── External-ID lookup ────────────────────────────────────────────────────

    /// Scan an instance for the resource of the given type whose `id_field`
    /// value equals `external_id`.
    pub fn lookup_resource_in_state(
        &self,
        instance: &InstanceState,
        resource_type: &ResourceTypeId,
        external_id: &str,
    ) -> Result<Option<ResourceState>, ProviderError> {
        let definition = self.get_spec_definition(resource_type)?;
        for resource in instance.resources.values() {
            if resource.resource_type != *resource_type {
                continue;
            }
            let matches = path::get_path(&resource.spec_data, &definition.id_field)
                .map_or(false, |v| match v {
                    Value::String(s) => s == external_id,
                    other => other.to_string() == external_id,
                });
            if matches {
                return Ok(Some(resource.clone()));
            }
        }
        Ok(None)
    }

    pub fn has_resource_in_state(
        &self,
        instance: &InstanceState,
        resource_type: &ResourceTypeId,
        external_id: &str,
    ) -> Result<bool, ProviderError> {
        Ok(self
            .lookup_resource_in_state(instance, resource_type, external_id)?
            .is_some())
    }

    // ── Resource locks ────────────────────────────────────────────────────────

    pub async fn acquire_resource_lock(
        &self,
        instance_id: InstanceId,
        resource_name: &str,
        acquired_by: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.locks
            .acquire(
                ResourceLockKey::new(instance_id, resource_name),
                acquired_by,
                cancel,
            )
            .await
    }

    pub fn release_resource_lock(&self, instance_id: InstanceId, resource_name: &str) {
        self.locks
            .release(&ResourceLockKey::new(instance_id, resource_name));
    }

    pub fn release_instance_locks(&self, instance_id: InstanceId) {
        self.locks.release_instance(instance_id);
    }

    pub fn release_locks_acquired_by(&self, acquired_by: &str) {
        self.locks.release_acquired_by(acquired_by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{StubBehavior, StubProvider, StubTransformer};
    use bluelink_domain::ResourceId;
    use chrono::Utc;
    use serde_json::json;

    fn registry_with(provider: Arc<StubProvider>) -> ResourceRegistry {
        let locks = Arc::new(ResourceLockTable::new(
            Duration::from_secs(180),
            Duration::from_millis(5),
        ));
        let mut registry = ResourceRegistry::new(Duration::from_millis(5), locks);
        registry.register_provider(provider);
        registry
    }

    fn deploy_input(name: &str, spec: Value) -> ResourceDeployInput {
        ResourceDeployInput {
            instance_id: InstanceId::generate(),
            resource_id: ResourceId::generate(),
            resource_name: name.to_string(),
            resolved_spec: spec,
            current_state: None,
            rollback: false,
        }
    }

    #[tokio::test]
    async fn dispatches_to_provider_by_namespace() {
        let provider = Arc::new(StubProvider::new("aws"));
        let registry = registry_with(provider.clone());
        let table = ResourceTypeId::new("aws/dynamodb/table");

        assert!(registry.has_resource_type(&table));
        assert!(!registry.has_resource_type(&ResourceTypeId::new("gcp/spanner/db")));

        let spec = registry.get_spec_definition(&table).unwrap();
        assert_eq!(spec.id_field, "id");
    }

    #[tokio::test]
    async fn handler_resolution_is_cached() {
        let provider = Arc::new(StubProvider::new("aws"));
        let registry = registry_with(provider);
        let table = ResourceTypeId::new("aws/dynamodb/table");

        let first = registry.resolve(&table).unwrap();
        let second = registry.resolve(&table).unwrap();
        assert!(Arc::ptr_eq(&first.handler, &second.handler));
    }

    #[tokio::test]
    async fn deploy_merges_computed_fields() {
        let provider = Arc::new(StubProvider::new("aws"));
        let registry = registry_with(provider);
        let table = ResourceTypeId::new("aws/dynamodb/table");

        let cancel = CancellationToken::new();
        let input = deploy_input("ordersTable", json!({"tableName": "orders"}));
        let deployed = registry.deploy(&table, &input, false, &cancel).await.unwrap();

        assert_eq!(deployed.spec_data["tableName"], json!("orders"));
        assert_eq!(deployed.spec_data["id"], json!("stub://aws/ordersTable"));
        assert_eq!(deployed.computed_field_paths, vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn stabilisation_polls_until_stable() {
        let provider = Arc::new(StubProvider::new("aws"));
        provider.set_behavior(
            "slowTable",
            StubBehavior {
                stabilise_after_polls: 3,
                ..Default::default()
            },
        );
        let registry = registry_with(provider.clone());
        let table = ResourceTypeId::new("aws/dynamodb/table");

        let cancel = CancellationToken::new();
        let input = deploy_input("slowTable", json!({}));
        registry.deploy(&table, &input, true, &cancel).await.unwrap();
        assert!(provider.stabilisation_polls("slowTable") >= 3);
    }

    #[tokio::test]
    async fn stabilisation_respects_cancellation() {
        let provider = Arc::new(StubProvider::new("aws"));
        provider.set_behavior(
            "neverStable",
            StubBehavior {
                stabilise_after_polls: u32::MAX,
                ..Default::default()
            },
        );
        let registry = registry_with(provider);
        let table = ResourceTypeId::new("aws/dynamodb/table");

        let cancel = CancellationToken::new();
        let input = deploy_input("neverStable", json!({}));
        let handle = {
            let cancel = cancel.clone();
            async move { registry.deploy(&table, &input, true, &cancel).await }
        };
        cancel.cancel();
        let err = handle.await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn abstract_types_resolve_through_transformers() {
        let provider = Arc::new(StubProvider::new("aws"));
        let mut registry = registry_with(provider);
        registry
            .register_transformer(Arc::new(StubTransformer::new("celerity/")))
            .unwrap();

        let abstract_type = ResourceTypeId::new("celerity/handler");
        assert!(registry.has_resource_type(&abstract_type));

        let err = registry
            .register_transformer(Arc::new(StubTransformer::new("celerity/")))
            .unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateTransformerPrefix(_)));
    }

    #[tokio::test]
    async fn unknown_type_carries_suggested_actions() {
        let provider = Arc::new(StubProvider::new("aws"));
        let registry = registry_with(provider);

        let err = registry
            .resolve(&ResourceTypeId::new("azure/storage/account"))
            .unwrap_err();
        match err {
            ProviderError::TypeNotFound {
                suggested_actions, ..
            } => assert!(suggested_actions.len() >= 3),
            other => panic!("expected TypeNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lookup_resource_in_state_matches_id_field() {
        let provider = Arc::new(StubProvider::new("aws"));
        let registry = registry_with(provider);
        let table = ResourceTypeId::new("aws/dynamodb/table");

        let instance_id = InstanceId::generate();
        let mut instance = InstanceState::new(instance_id, "orders", Utc::now());
        let mut resource = ResourceState::new(instance_id, "ordersTable", table.clone());
        resource.spec_data = json!({"id": "stub://aws/ordersTable"});
        instance.put_resource(resource);

        let found = registry
            .lookup_resource_in_state(&instance, &table, "stub://aws/ordersTable")
            .unwrap();
        assert_eq!(found.unwrap().name, "ordersTable");

        assert!(!registry
            .has_resource_in_state(&instance, &table, "stub://aws/other")
            .unwrap());
    }

    #[tokio::test]
    async fn with_params_shares_locks_and_caches() {
        let provider = Arc::new(StubProvider::new("aws"));
        let registry = registry_with(provider);
        let table = ResourceTypeId::new("aws/dynamodb/table");
        registry.resolve(&table).unwrap();

        let derived = registry.with_params(HashMap::from([(
            "region".to_string(),
            json!("us-east-1"),
        )]));
        assert_eq!(derived.params()["region"], json!("us-east-1"));
        assert!(Arc::ptr_eq(registry.locks(), derived.locks()));

        // Cache is shared: the derived registry sees the parent's entry.
        let resolved = derived.resolve(&table).unwrap();
        let parent = registry.resolve(&table).unwrap();
        assert!(Arc::ptr_eq(&resolved.handler, &parent.handler));
    }
}
