//! Domain layer: charge points, connectors, transactions and the
//! collaborator contracts the engine consumes.

pub mod charge_point;
pub mod error;
pub mod ocpp;
pub mod ports;
pub mod transaction;

pub use charge_point::{
    next_status, ChargePoint, Connector, ConnectorEvent, ConnectorSpec, ConnectorStatus,
    DeviceStatus, Transition,
};
pub use error::{DomainError, DomainResult};
pub use ocpp::OcppVersion;
pub use ports::{
    AuthorizationDecision, Authorizer, BillingSink, ConnectorRef, StationDirectory,
    StationProfile, TariffProvider,
};
pub use transaction::{StopOutcome, TariffSnapshot, Transaction, TransactionStatus};
