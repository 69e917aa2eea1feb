pub mod deploy;
pub mod destroy;
pub mod error;
pub mod events;
mod links;
pub mod operation;
pub mod resolve;
pub mod retry;
pub mod stage;

pub use deploy::{DeployOutcome, DeployRequest, Deployer};
pub use destroy::DestroyRequest;
pub use error::DeployError;
pub use events::{DeployEvent, StageEvent};
pub use operation::{ActiveOperation, OperationKind, OperationTokens};
pub use stage::StageRequest;
