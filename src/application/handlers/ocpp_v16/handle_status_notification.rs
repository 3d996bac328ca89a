//! StatusNotification handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::status_notification::{
    StatusNotificationRequest, StatusNotificationResponse,
};
use rust_ocpp::v1_6::types::{ChargePointErrorCode, ChargePointStatus};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::OcppHandler;
use crate::domain::ConnectorStatus;

/// Map an OCPP 1.6 status onto the engine's connector states. Suspended
/// states are still charging sessions; a reservation blocks the connector.
pub fn map_status(status: &ChargePointStatus) -> ConnectorStatus {
    match status {
        ChargePointStatus::Available => ConnectorStatus::Available,
        ChargePointStatus::Preparing => ConnectorStatus::Preparing,
        ChargePointStatus::Charging
        | ChargePointStatus::SuspendedEV
        | ChargePointStatus::SuspendedEVSE => ConnectorStatus::Charging,
        ChargePointStatus::Finishing => ConnectorStatus::Finishing,
        ChargePointStatus::Reserved | ChargePointStatus::Unavailable => {
            ConnectorStatus::Unavailable
        }
        ChargePointStatus::Faulted => ConnectorStatus::Faulted,
    }
}

pub async fn handle_status_notification(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: StatusNotificationRequest = parse_payload(handler, "StatusNotification", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        connector_id = req.connector_id,
        status = ?req.status,
        error_code = ?req.error_code,
        "StatusNotification"
    );

    if req.connector_id == 0 {
        info!(
            charge_point_id = handler.charge_point_id.as_str(),
            status = ?req.status,
            "Station-level status report"
        );
        return to_payload(&StatusNotificationResponse {});
    }

    let error_code = match req.error_code {
        ChargePointErrorCode::NoError => None,
        other => Some(format!("{:?}", other)),
    };

    handler.charge_points.report_status(
        &handler.charge_point_id,
        req.connector_id,
        map_status(&req.status),
        error_code,
        req.info,
        req.timestamp.unwrap_or_else(Utc::now),
    );

    to_payload(&StatusNotificationResponse {})
}
