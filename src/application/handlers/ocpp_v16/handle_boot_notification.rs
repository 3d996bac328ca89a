//! BootNotification handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::boot_notification::{
    BootNotificationRequest, BootNotificationResponse,
};
use rust_ocpp::v1_6::types::RegistrationStatus;
use serde_json::Value;
use tracing::{error, info};

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::services::{BootDecision, BootInfo};
use crate::application::OcppHandler;

pub async fn handle_boot_notification(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: BootNotificationRequest = parse_payload(handler, "BootNotification", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        vendor = req.charge_point_vendor.as_str(),
        model = req.charge_point_model.as_str(),
        "BootNotification"
    );

    let busy = handler.transactions.open_connectors(&handler.charge_point_id);
    let info = BootInfo {
        vendor: req.charge_point_vendor,
        model: req.charge_point_model,
        serial_number: req.charge_point_serial_number,
        firmware_version: req.firmware_version,
    };

    let decision = match handler
        .charge_points
        .boot(&handler.charge_point_id, info, &busy)
        .await
    {
        Ok(decision) => decision,
        Err(e) => {
            error!(
                charge_point_id = handler.charge_point_id.as_str(),
                error = %e,
                "Station lookup failed, answering Pending"
            );
            BootDecision::Pending
        }
    };

    let status = match decision {
        BootDecision::Accepted => {
            handler.registry.set_heartbeat_interval(
                &handler.charge_point_id,
                handler.connection_id,
                handler.heartbeat_interval_secs,
            );
            RegistrationStatus::Accepted
        }
        BootDecision::Pending => RegistrationStatus::Pending,
    };

    to_payload(&BootNotificationResponse {
        current_time: Utc::now(),
        interval: handler.heartbeat_interval_secs.try_into().unwrap_or(300),
        status,
    })
}
