mod bus;
mod error;

pub use bus::{EventBus, SubscribeFrom};
pub use error::EventError;
