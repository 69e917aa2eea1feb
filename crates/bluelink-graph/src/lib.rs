mod error;
mod plan;

pub use error::GraphError;
pub use plan::{
    collect_spec_references, plan, plan_from_edges, DeploymentNode, ExecutionPlan, NodeKind,
};
