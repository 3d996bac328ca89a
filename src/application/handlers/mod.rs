//! Inbound OCPP message handling

pub mod ocpp_handler;
pub mod ocpp_v16;

pub use ocpp_handler::OcppHandler;
pub use ocpp_v16::{CallFailure, HandlerResult};
