//! Application layer: sessions, message handling, services and commands.

pub mod commands;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod services;
pub mod session;

pub use commands::{
    Availability, CommandDispatcher, CommandError, CommandSender, CommandTimeouts, ResetKind,
    SharedCommandDispatcher, SharedCommandSender, TriggerType,
};
pub use engine::{Collaborators, ConnectionSnapshot, Engine, EngineSettings, Housekeeping};
pub use events::{create_event_bus, Event, EventBus, EventSubscriber, SharedEventBus};
pub use handlers::OcppHandler;
pub use services::{ChargePointService, LivenessMonitor, TransactionManager};
pub use session::{SessionRegistry, SharedSessionRegistry};
