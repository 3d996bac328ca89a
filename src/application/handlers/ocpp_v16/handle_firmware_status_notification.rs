//! FirmwareStatusNotification handler

use rust_ocpp::v1_6::messages::firmware_status_notification::{
    FirmwareStatusNotificationRequest, FirmwareStatusNotificationResponse,
};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::OcppHandler;

pub async fn handle_firmware_status_notification(
    handler: &OcppHandler,
    payload: Value,
) -> HandlerResult {
    let req: FirmwareStatusNotificationRequest =
        parse_payload(handler, "FirmwareStatusNotification", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        status = ?req.status,
        "FirmwareStatusNotification"
    );

    to_payload(&FirmwareStatusNotificationResponse {})
}
