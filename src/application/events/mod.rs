//! Engine events (pub/sub)
//!
//! State changes are published here for the external read-model.

pub mod event_bus;
pub mod types;

pub use event_bus::{create_event_bus, EventBus, EventSubscriber, SharedEventBus};
pub use types::*;
