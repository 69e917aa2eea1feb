pub mod apply;
pub mod check;
pub mod error;
pub mod report;

pub use apply::apply;
pub use check::check;
pub use error::ReconcileError;
pub use report::{
    ApplyAction, ApplyOutcome, ApplyRequest, ApplyTarget, CheckRequest, ReconciliationScope,
};
