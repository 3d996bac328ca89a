//! Event types published on the bus

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{ConnectorStatus, StopOutcome};
use crate::shared::OcppFrame;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// Session registered
    ChargePointConnected(ChargePointConnectedEvent),
    /// Session ended (disconnect, eviction, replacement, shutdown)
    ChargePointDisconnected(ChargePointDisconnectedEvent),
    /// BootNotification processed
    BootNotification(BootNotificationEvent),
    ConnectorStatusChanged(ConnectorStatusChangedEvent),
    TransactionStarted(TransactionStartedEvent),
    MeterValuesReceived(MeterValuesEvent),
    /// Transaction reached `Closed`; published once per transaction
    TransactionClosed(TransactionClosedEvent),
    HeartbeatReceived(HeartbeatEvent),
    /// One decoded OCPP-J frame, inbound or outbound
    FrameLogged(FrameLoggedEvent),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::ChargePointConnected(_) => "charge_point_connected",
            Event::ChargePointDisconnected(_) => "charge_point_disconnected",
            Event::BootNotification(_) => "boot_notification",
            Event::ConnectorStatusChanged(_) => "connector_status_changed",
            Event::TransactionStarted(_) => "transaction_started",
            Event::MeterValuesReceived(_) => "meter_values_received",
            Event::TransactionClosed(_) => "transaction_closed",
            Event::HeartbeatReceived(_) => "heartbeat_received",
            Event::FrameLogged(_) => "frame_logged",
        }
    }

    pub fn charge_point_id(&self) -> &str {
        match self {
            Event::ChargePointConnected(e) => &e.charge_point_id,
            Event::ChargePointDisconnected(e) => &e.charge_point_id,
            Event::BootNotification(e) => &e.charge_point_id,
            Event::ConnectorStatusChanged(e) => &e.charge_point_id,
            Event::TransactionStarted(e) => &e.charge_point_id,
            Event::MeterValuesReceived(e) => &e.charge_point_id,
            Event::TransactionClosed(e) => &e.charge_point_id,
            Event::HeartbeatReceived(e) => &e.charge_point_id,
            Event::FrameLogged(e) => &e.charge_point_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePointConnectedEvent {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePointDisconnectedEvent {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootNotificationEvent {
    pub charge_point_id: String,
    pub vendor: String,
    pub model: String,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorStatusChangedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub previous: ConnectorStatus,
    pub status: ConnectorStatus,
    pub error_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStartedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: i32,
    pub id_tag: String,
    pub meter_start: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterValuesEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: Option<i32>,
    /// Energy register reading in Wh
    pub energy_wh: Option<f64>,
    pub energy_kwh: Option<f64>,
    pub power_w: Option<f64>,
    pub soc: Option<f64>,
    pub cost: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionClosedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub outcome: StopOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub charge_point_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameDirection {
    /// Device to engine
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLoggedEvent {
    pub charge_point_id: String,
    pub direction: FrameDirection,
    /// `Call`, `CallResult` or `CallError`
    pub message_type: String,
    /// Action of the Call, or of the Call a reply answers when known
    pub action: Option<String>,
    pub unique_id: String,
    /// Call/CallResult payload; error code and description for a CallError
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl FrameLoggedEvent {
    pub fn new(
        charge_point_id: &str,
        direction: FrameDirection,
        frame: &OcppFrame,
        action: Option<&str>,
    ) -> Self {
        let (message_type, action, payload) = match frame {
            OcppFrame::Call {
                action, payload, ..
            } => ("Call", Some(action.as_str()), payload.clone()),
            OcppFrame::CallResult { payload, .. } => ("CallResult", action, payload.clone()),
            OcppFrame::CallError {
                error_code,
                error_description,
                ..
            } => (
                "CallError",
                action,
                json!({ "errorCode": error_code.as_str(), "errorDescription": error_description }),
            ),
        };
        Self {
            charge_point_id: charge_point_id.to_string(),
            direction,
            message_type: message_type.to_string(),
            action: action.map(str::to_string),
            unique_id: frame.unique_id().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Wrapper for sending events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_message_serializes_with_type_tag() {
        let msg = EventMessage::new(Event::HeartbeatReceived(HeartbeatEvent {
            charge_point_id: "CP001".into(),
            timestamp: Utc::now(),
        }));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "HeartbeatReceived");
        assert_eq!(json["data"]["charge_point_id"], "CP001");
        assert_eq!(msg.event.event_type(), "heartbeat_received");
    }

    #[test]
    fn frame_log_carries_direction_and_action() {
        let call = OcppFrame::Call {
            unique_id: "m1".into(),
            action: "Heartbeat".into(),
            payload: json!({}),
        };
        let logged = FrameLoggedEvent::new("CP001", FrameDirection::In, &call, None);
        assert_eq!(logged.message_type, "Call");
        assert_eq!(logged.action.as_deref(), Some("Heartbeat"));

        let error = OcppFrame::error_response("m2", crate::shared::CallErrorCode::NotSupported, "no");
        let logged = FrameLoggedEvent::new("CP001", FrameDirection::Out, &error, Some("Reset"));
        assert_eq!(logged.message_type, "CallError");
        assert_eq!(logged.action.as_deref(), Some("Reset"));
        assert_eq!(logged.payload["errorCode"], "NotSupported");

        let json = serde_json::to_value(Event::FrameLogged(logged)).unwrap();
        assert_eq!(json["data"]["direction"], "OUT");
        assert_eq!(json["data"]["unique_id"], "m2");
    }
}
