use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        InstanceId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, crate::DomainError> {
        Uuid::parse_str(s)
            .map(InstanceId)
            .map_err(|_| crate::DomainError::InvalidInstanceId(s.to_string()))
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    pub fn generate() -> Self {
        ResourceId(Uuid::new_v4())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangesetId(pub Uuid);

impl ChangesetId {
    pub fn generate() -> Self {
        ChangesetId(Uuid::new_v4())
    }
}

impl std::fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A link is identified by its two endpoint logical names joined as `a::b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub String);

impl LinkId {
    pub fn new(s: impl Into<String>) -> Self {
        LinkId(s.into())
    }

    pub fn from_endpoints(resource_a: &str, resource_b: &str) -> Self {
        LinkId(format!("{resource_a}::{resource_b}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into `(resource_a, resource_b)`.
    pub fn endpoints(&self) -> Option<(&str, &str)> {
        self.0.split_once("::")
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event channel key — one per staging/deploy/destroy operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(s: impl Into<String>) -> Self {
        ChannelId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A namespaced resource type, e.g. `aws/dynamodb/table`.
///
/// The segment before the first `/` selects the provider. Abstract resource
/// types dispatched through transformers use a transformer-owned prefix
/// instead of a provider namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceTypeId(pub String);

impl ResourceTypeId {
    pub fn new(s: impl Into<String>) -> Self {
        ResourceTypeId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Provider namespace: everything before the first `/`.
    pub fn namespace(&self) -> Option<&str> {
        let (ns, rest) = self.0.split_once('/')?;
        if ns.is_empty() || rest.is_empty() {
            return None;
        }
        Some(ns)
    }
}

impl std::fmt::Display for ResourceTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Blueprint document ────────────────────────────────────────────────────────

/// A parsed blueprint — the desired-state input to staging and deployment.
///
/// Parsing and schema validation happen upstream; by the time a document
/// reaches the deployment core it is structurally sound, though its resource
/// specs may still contain unresolved `${...}` substitution references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintDocument {
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub resources: HashMap<String, ResourceDefinition>,
    #[serde(default)]
    pub data_sources: HashMap<String, DataSourceDefinition>,
    #[serde(default)]
    pub links: Vec<LinkDefinition>,
    #[serde(default)]
    pub children: HashMap<String, BlueprintDocument>,
    #[serde(default)]
    pub exports: HashMap<String, ExportDefinition>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl BlueprintDocument {
    /// True when the document declares the given resource, directly or in a
    /// descendant child (dotted child paths, e.g. `networking.subnets`).
    pub fn has_resource(&self, name: &str) -> bool {
        if self.resources.contains_key(name) {
            return true;
        }
        match name.split_once('.') {
            Some((child, rest)) => self
                .children
                .get(child)
                .map_or(false, |doc| doc.has_resource(rest)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub resource_type: ResourceTypeId,
    /// Raw spec; `${...}` references are resolved at deploy time.
    pub spec: Value,
    #[serde(default)]
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Set for resources expanded from a templated (count) definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceDefinition {
    pub source_type: ResourceTypeId,
    /// Provider-interpreted filter payload.
    #[serde(default)]
    pub filters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDefinition {
    pub resource_a: String,
    pub resource_b: String,
    /// Forwarded opaquely to the link implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<Value>,
}

impl LinkDefinition {
    pub fn link_id(&self) -> LinkId {
        LinkId::from_endpoints(&self.resource_a, &self.resource_b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDefinition {
    /// Dotted path into a resource's resolved spec, e.g. `ordersTable.spec.arn`.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
