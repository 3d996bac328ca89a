//! WebSocket interface
//!
//! - `ocpp_server`: accepts charge-point sessions and runs one worker each
//! - `negotiator`: subprotocol negotiation and identity extraction

pub mod negotiator;
pub mod ocpp_server;

pub use negotiator::{extract_charge_point_id, ProtocolNegotiator};
pub use ocpp_server::OcppServer;
