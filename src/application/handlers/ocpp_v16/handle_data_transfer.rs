//! DataTransfer handler

use rust_ocpp::v1_6::messages::data_transfer::{DataTransferRequest, DataTransferResponse};
use rust_ocpp::v1_6::types::DataTransferStatus;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::OcppHandler;

pub async fn handle_data_transfer(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: DataTransferRequest = parse_payload(handler, "DataTransfer", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        vendor_id = req.vendor_string.as_str(),
        message_id = ?req.message_id,
        "DataTransfer"
    );

    to_payload(&DataTransferResponse {
        status: DataTransferStatus::Accepted,
        data: None,
    })
}
