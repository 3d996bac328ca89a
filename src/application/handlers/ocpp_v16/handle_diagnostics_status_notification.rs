//! DiagnosticsStatusNotification handler

use rust_ocpp::v1_6::messages::diagnostics_status_notification::{
    DiagnosticsStatusNotificationRequest, DiagnosticsStatusNotificationResponse,
};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::OcppHandler;

pub async fn handle_diagnostics_status_notification(
    handler: &OcppHandler,
    payload: Value,
) -> HandlerResult {
    let req: DiagnosticsStatusNotificationRequest =
        parse_payload(handler, "DiagnosticsStatusNotification", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        status = ?req.status,
        "DiagnosticsStatusNotification"
    );

    to_payload(&DiagnosticsStatusNotificationResponse {})
}
