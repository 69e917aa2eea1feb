use std::collections::{HashMap, HashSet};

use bluelink_domain::BlueprintDocument;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

/// One schedulable unit in a deployment: a resource or a child blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentNode {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Resource,
    Child,
}

/// Result returned by [`plan`] on success.
///
/// `waves` holds the deployment order: every node in wave *n* depends only on
/// nodes in waves < *n*, so all nodes within a wave may run concurrently.
/// Destroy traverses the same waves in reverse.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<DeploymentNode>>,
}

impl ExecutionPlan {
    /// All nodes, flattened in wave order.
    pub fn nodes(&self) -> impl Iterator<Item = &DeploymentNode> {
        self.waves.iter().flatten()
    }
}

/// Validate a blueprint's dependency structure and compute parallel waves.
///
/// Checks:
/// 1. `depends_on` targets name a resource or child of this document
/// 2. Link endpoints exist in this document or a descendant child
/// 3. Resource/child name collisions
/// 4. Cycle detection over explicit and reference-implied dependencies
pub fn plan(doc: &BlueprintDocument) -> Result<ExecutionPlan, GraphError> {
    let mut errors: Vec<GraphError> = Vec::new();

    let mut nodes: Vec<DeploymentNode> = Vec::new();
    for name in doc.resources.keys() {
        nodes.push(DeploymentNode {
            name: name.clone(),
            kind: NodeKind::Resource,
        });
    }
    for name in doc.children.keys() {
        if doc.resources.contains_key(name) {
            errors.push(GraphError::NameCollision { name: name.clone() });
            continue;
        }
        nodes.push(DeploymentNode {
            name: name.clone(),
            kind: NodeKind::Child,
        });
    }
    // Deterministic planning regardless of map iteration order.
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    let known: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();

    // Dependency edges: explicit depends_on plus ${...} references in specs.
    let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
    for (name, def) in &doc.resources {
        let entry = deps.entry(name.clone()).or_default();
        for dep in &def.depends_on {
            if !known.contains(dep.as_str()) {
                errors.push(GraphError::UnknownDependency {
                    dependent: name.clone(),
                    dependency: dep.clone(),
                });
                continue;
            }
            entry.insert(dep.clone());
        }
        for dep in collect_spec_references(&def.spec) {
            // References to names outside this document (e.g. variables that
            // failed to parse upstream) are not planning errors here; the
            // resolver reports them with full context at deploy time.
            if known.contains(dep.as_str()) && dep != *name {
                entry.insert(dep);
            }
        }
    }

    for link in &doc.links {
        let link_id = link.link_id();
        for endpoint in [&link.resource_a, &link.resource_b] {
            if !doc.has_resource(endpoint) {
                errors.push(GraphError::UnknownLinkEndpoint {
                    link: link_id.to_string(),
                    endpoint: endpoint.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        if errors.len() == 1 {
            return Err(errors.remove(0));
        }
        return Err(GraphError::Multiple(errors));
    }

    plan_from_edges(nodes, &deps)
}

/// Wave-plan an explicit node/edge set. Used directly when no blueprint is
/// at hand — e.g. destroy ordering from persisted dependency lists.
pub fn plan_from_edges(
    nodes: Vec<DeploymentNode>,
    deps: &HashMap<String, HashSet<String>>,
) -> Result<ExecutionPlan, GraphError> {
    // --- Cycle detection ---
    let mut graph: DiGraph<&DeploymentNode, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = nodes
        .iter()
        .map(|n| (n.name.as_str(), graph.add_node(n)))
        .collect();

    // Edge direction: dependency → dependent ("dependency deploys first").
    // Edges touching unknown nodes are skipped — persisted dependency lists
    // may still name resources that have since been removed.
    for (dependent, dependencies) in deps {
        let Some(to) = index.get(dependent.as_str()) else {
            continue;
        };
        for dependency in dependencies {
            if let Some(from) = index.get(dependency.as_str()) {
                graph.add_edge(*from, *to, ());
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(GraphError::CycleDetected);
    }

    // --- Kahn layering into parallel waves ---
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.neighbors_directed(ix, Direction::Incoming).count()))
        .collect();

    let mut waves: Vec<Vec<DeploymentNode>> = Vec::new();
    let mut remaining: usize = graph.node_count();
    while remaining > 0 {
        let mut ready: Vec<NodeIndex> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(ix, _)| *ix)
            .collect();
        ready.sort_by(|a, b| graph[*a].name.cmp(&graph[*b].name));

        for ix in &ready {
            indegree.remove(ix);
            for next in graph.neighbors_directed(*ix, Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(&next) {
                    *d -= 1;
                }
            }
        }
        remaining -= ready.len();
        waves.push(ready.into_iter().map(|ix| (*graph[ix]).clone()).collect());
    }

    Ok(ExecutionPlan { waves })
}

/// Collect the node names referenced from `${resources.<name>...}` and
/// `${children.<name>...}` substitutions anywhere in a spec value.
pub fn collect_spec_references(spec: &Value) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_refs_inner(spec, &mut out);
    out
}

fn collect_refs_inner(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                let tail = &rest[start + 2..];
                let Some(end) = tail.find('}') else { break };
                let inner = tail[..end].trim();
                let mut parts = inner.splitn(3, '.');
                match (parts.next(), parts.next()) {
                    (Some("resources"), Some(name)) | (Some("children"), Some(name)) => {
                        out.insert(name.to_string());
                    }
                    _ => {}
                }
                rest = &tail[end + 1..];
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs_inner(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs_inner(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_domain::{LinkDefinition, ResourceDefinition, ResourceMetadata, ResourceTypeId};
    use serde_json::json;

    fn resource(spec: Value, depends_on: &[&str]) -> ResourceDefinition {
        ResourceDefinition {
            resource_type: ResourceTypeId::new("test/compute/unit"),
            spec,
            metadata: ResourceMetadata::default(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            template_name: None,
        }
    }

    fn doc_with(resources: Vec<(&str, ResourceDefinition)>) -> BlueprintDocument {
        let mut doc = BlueprintDocument::default();
        for (name, def) in resources {
            doc.resources.insert(name.to_string(), def);
        }
        doc
    }

    #[test]
    fn independent_resources_share_one_wave() {
        let doc = doc_with(vec![
            ("a", resource(json!({}), &[])),
            ("b", resource(json!({}), &[])),
        ]);
        let plan = plan(&doc).unwrap();
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(plan.waves[0].len(), 2);
    }

    #[test]
    fn depends_on_orders_waves() {
        let doc = doc_with(vec![
            ("table", resource(json!({}), &[])),
            ("api", resource(json!({}), &["table"])),
            ("alarm", resource(json!({}), &["api"])),
        ]);
        let plan = plan(&doc).unwrap();
        let names: Vec<Vec<&str>> = plan
            .waves
            .iter()
            .map(|w| w.iter().map(|n| n.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["table"], vec!["api"], vec!["alarm"]]);
    }

    #[test]
    fn spec_reference_implies_dependency() {
        let doc = doc_with(vec![
            ("table", resource(json!({}), &[])),
            (
                "api",
                resource(json!({"target": "${resources.table.spec.arn}"}), &[]),
            ),
        ]);
        let plan = plan(&doc).unwrap();
        assert_eq!(plan.waves[0][0].name, "table");
        assert_eq!(plan.waves[1][0].name, "api");
    }

    #[test]
    fn cycle_is_rejected() {
        let doc = doc_with(vec![
            ("a", resource(json!({}), &["b"])),
            ("b", resource(json!({}), &["a"])),
        ]);
        assert!(matches!(plan(&doc), Err(GraphError::CycleDetected)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let doc = doc_with(vec![("a", resource(json!({}), &["ghost"]))]);
        match plan(&doc) {
            Err(GraphError::UnknownDependency { dependent, dependency }) => {
                assert_eq!(dependent, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn link_endpoint_must_exist() {
        let mut doc = doc_with(vec![("a", resource(json!({}), &[]))]);
        doc.links.push(LinkDefinition {
            resource_a: "a".into(),
            resource_b: "missing".into(),
            label_selector: None,
        });
        assert!(matches!(
            plan(&doc),
            Err(GraphError::UnknownLinkEndpoint { .. })
        ));
    }

    #[test]
    fn link_endpoint_in_child_is_accepted() {
        let mut child = BlueprintDocument::default();
        child
            .resources
            .insert("queue".into(), resource(json!({}), &[]));
        let mut doc = doc_with(vec![("a", resource(json!({}), &[]))]);
        doc.children.insert("messaging".into(), child);
        doc.links.push(LinkDefinition {
            resource_a: "a".into(),
            resource_b: "messaging.queue".into(),
            label_selector: None,
        });
        assert!(plan(&doc).is_ok());
    }

    #[test]
    fn children_participate_in_waves() {
        let mut doc = doc_with(vec![("app", resource(json!({}), &["networking"]))]);
        doc.children
            .insert("networking".into(), BlueprintDocument::default());
        let plan = plan(&doc).unwrap();
        assert_eq!(plan.waves[0][0].kind, NodeKind::Child);
        assert_eq!(plan.waves[1][0].kind, NodeKind::Resource);
    }

    #[test]
    fn reference_collector_finds_nested_refs() {
        let refs = collect_spec_references(&json!({
            "a": "${resources.table.spec.arn}",
            "b": ["${children.networking.exports.vpcId}", "plain"],
            "c": {"d": "${variables.env}"},
        }));
        assert!(refs.contains("table"));
        assert!(refs.contains("networking"));
        assert!(!refs.contains("env"));
    }
}
