//! Heartbeat handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use serde_json::Value;
use tracing::debug;

use super::{to_payload, HandlerResult};
use crate::application::events::{Event, HeartbeatEvent};
use crate::application::OcppHandler;

pub async fn handle_heartbeat(handler: &OcppHandler, _payload: Value) -> HandlerResult {
    let now = Utc::now();
    handler
        .registry
        .record_heartbeat(&handler.charge_point_id, handler.connection_id, now);

    debug!(charge_point_id = handler.charge_point_id.as_str(), "Heartbeat");

    handler.event_bus.publish(Event::HeartbeatReceived(HeartbeatEvent {
        charge_point_id: handler.charge_point_id.clone(),
        timestamp: now,
    }));

    to_payload(&HeartbeatResponse { current_time: now })
}
