pub mod model;
pub mod state_machine;

pub use model::{ChargePoint, Connector, ConnectorSpec, ConnectorStatus, DeviceStatus};
pub use state_machine::{next_status, ConnectorEvent, Transition};
