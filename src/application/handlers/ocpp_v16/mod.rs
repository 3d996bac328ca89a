//! OCPP 1.6 action handlers
//!
//! Routes device-initiated action names to their handlers. Payloads are
//! deserialized into `rust_ocpp::v1_6` types within each handler; a payload
//! that does not match its schema is answered with `FormationViolation`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::application::OcppHandler;
use crate::shared::CallErrorCode;

mod handle_authorize;
mod handle_boot_notification;
mod handle_data_transfer;
mod handle_diagnostics_status_notification;
mod handle_firmware_status_notification;
mod handle_heartbeat;
mod handle_meter_values;
mod handle_start_transaction;
mod handle_status_notification;
mod handle_stop_transaction;

pub use handle_authorize::handle_authorize;
pub use handle_boot_notification::handle_boot_notification;
pub use handle_data_transfer::handle_data_transfer;
pub use handle_diagnostics_status_notification::handle_diagnostics_status_notification;
pub use handle_firmware_status_notification::handle_firmware_status_notification;
pub use handle_heartbeat::handle_heartbeat;
pub use handle_meter_values::{extract_samples, handle_meter_values, Samples};
pub use handle_start_transaction::handle_start_transaction;
pub use handle_status_notification::{handle_status_notification, map_status};
pub use handle_stop_transaction::handle_stop_transaction;

/// A Call that must be answered with a CallError
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub code: CallErrorCode,
    pub description: String,
}

impl CallFailure {
    pub fn new(code: CallErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

pub type HandlerResult = Result<Value, CallFailure>;

/// Routes OCPP 1.6 actions to their handlers.
pub async fn v16_action_matcher(handler: &OcppHandler, action: &str, payload: Value) -> HandlerResult {
    match action {
        "Authorize" => handle_authorize(handler, payload).await,
        "BootNotification" => handle_boot_notification(handler, payload).await,
        "DataTransfer" => handle_data_transfer(handler, payload).await,
        "DiagnosticsStatusNotification" => {
            handle_diagnostics_status_notification(handler, payload).await
        }
        "FirmwareStatusNotification" => handle_firmware_status_notification(handler, payload).await,
        "Heartbeat" => handle_heartbeat(handler, payload).await,
        "MeterValues" => handle_meter_values(handler, payload).await,
        "StartTransaction" => handle_start_transaction(handler, payload).await,
        "StatusNotification" => handle_status_notification(handler, payload).await,
        "StopTransaction" => handle_stop_transaction(handler, payload).await,

        unknown if is_cs_to_cp_action(unknown) => {
            warn!(
                charge_point_id = handler.charge_point_id.as_str(),
                action = unknown,
                "Received CS→CP action from charge point"
            );
            Err(CallFailure::new(
                CallErrorCode::NotSupported,
                format!("{} is initiated by the central system", unknown),
            ))
        }
        unknown => {
            error!(
                charge_point_id = handler.charge_point_id.as_str(),
                action = unknown,
                "Unknown OCPP 1.6 action"
            );
            Err(CallFailure::new(
                CallErrorCode::NotImplemented,
                format!("Unknown action {}", unknown),
            ))
        }
    }
}

/// Check if the action is a CS→CP action (should never arrive from a CP).
pub fn is_cs_to_cp_action(action: &str) -> bool {
    matches!(
        action,
        "CancelReservation"
            | "ChangeAvailability"
            | "ChangeConfiguration"
            | "ClearCache"
            | "ClearChargingProfile"
            | "GetCompositeSchedule"
            | "GetConfiguration"
            | "GetDiagnostics"
            | "GetLocalListVersion"
            | "RemoteStartTransaction"
            | "RemoteStopTransaction"
            | "ReserveNow"
            | "Reset"
            | "SendLocalList"
            | "SetChargingProfile"
            | "TriggerMessage"
            | "UnlockConnector"
            | "UpdateFirmware"
    )
}

pub(crate) fn parse_payload<T: DeserializeOwned>(
    handler: &OcppHandler,
    action: &str,
    payload: Value,
) -> Result<T, CallFailure> {
    serde_json::from_value(payload).map_err(|e| {
        error!(
            charge_point_id = handler.charge_point_id.as_str(),
            action,
            error = %e,
            "Failed to parse payload"
        );
        CallFailure::new(CallErrorCode::FormationViolation, format!("Invalid {} payload: {}", action, e))
    })
}

pub(crate) fn to_payload<T: Serialize>(response: &T) -> HandlerResult {
    serde_json::to_value(response).map_err(|e| {
        CallFailure::new(CallErrorCode::InternalError, format!("Serialization failed: {}", e))
    })
}
