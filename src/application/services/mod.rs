pub mod charge_point;
pub mod liveness;
pub mod transaction;

pub use charge_point::{BootDecision, BootInfo, ChargePointService, ConnectorSnapshot};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use transaction::{
    MeterReport, StartOutcome, StartRequest, StopRequest, StopResult, TransactionManager,
    TransactionSettings,
};
