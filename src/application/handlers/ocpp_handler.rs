//! Per-session OCPP handler
//!
//! Decodes inbound frames, routes device Calls to the action handlers and
//! resolves replies to our own Calls through the session's pending table.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::application::commands::CommandError;
use crate::application::events::{Event, FrameDirection, FrameLoggedEvent, SharedEventBus};
use crate::application::handlers::ocpp_v16::v16_action_matcher;
use crate::application::services::{ChargePointService, TransactionManager};
use crate::application::session::{PendingCalls, SharedSessionRegistry};
use crate::shared::{FrameError, OcppFrame};

/// Handler bound to one connection instance
pub struct OcppHandler {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub pending: Arc<PendingCalls>,
    pub registry: SharedSessionRegistry,
    pub charge_points: Arc<ChargePointService>,
    pub transactions: Arc<TransactionManager>,
    pub event_bus: SharedEventBus,
    /// Interval handed to the device in BootNotification.conf
    pub heartbeat_interval_secs: u64,
}

impl OcppHandler {
    /// Process one text frame. Returns the reply frame, if any.
    pub async fn handle(&self, text: &str) -> Option<String> {
        self.registry
            .touch(&self.charge_point_id, self.connection_id, Utc::now());
        metrics::counter!("ocpp_frames_received_total").increment(1);

        debug!(
            charge_point_id = self.charge_point_id.as_str(),
            "Received raw message: {}", text
        );

        let frame = match OcppFrame::parse(text) {
            Ok(f) => f,
            Err(e) => return self.handle_decode_error(text, e),
        };

        // Replies are logged with the action of the Call they answer.
        let answered = match &frame {
            OcppFrame::Call { .. } => None,
            reply => self.pending.action_for(reply.unique_id()),
        };
        self.log_frame(FrameDirection::In, &frame, answered.as_deref());

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => Some(self.handle_call(&unique_id, &action, payload).await),

            OcppFrame::CallResult { unique_id, payload } => {
                self.handle_call_result(&unique_id, payload);
                None
            }

            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                self.handle_call_error(&unique_id, error_code, error_description);
                None
            }
        }
    }

    fn log_frame(&self, direction: FrameDirection, frame: &OcppFrame, action: Option<&str>) {
        self.event_bus.publish(Event::FrameLogged(FrameLoggedEvent::new(
            &self.charge_point_id,
            direction,
            frame,
            action,
        )));
    }

    async fn handle_call(&self, unique_id: &str, action: &str, payload: Value) -> String {
        info!(
            charge_point_id = self.charge_point_id.as_str(),
            action,
            message_id = unique_id,
            "Received Call"
        );

        let response = match v16_action_matcher(self, action, payload).await {
            Ok(payload) => OcppFrame::CallResult {
                unique_id: unique_id.to_string(),
                payload,
            },
            Err(failure) => {
                warn!(
                    charge_point_id = self.charge_point_id.as_str(),
                    action,
                    message_id = unique_id,
                    code = %failure.code,
                    description = failure.description.as_str(),
                    "Answering Call with CallError"
                );
                OcppFrame::error_response(unique_id, failure.code, failure.description)
            }
        };

        self.log_frame(FrameDirection::Out, &response, Some(action));
        response.serialize()
    }

    fn handle_call_result(&self, unique_id: &str, payload: Value) {
        match self.pending.resolve(unique_id, Ok(payload)) {
            Some(action) => debug!(
                charge_point_id = self.charge_point_id.as_str(),
                message_id = unique_id,
                action = action.as_str(),
                "Received CallResult"
            ),
            None => warn!(
                charge_point_id = self.charge_point_id.as_str(),
                message_id = unique_id,
                "Unmatched CallResult discarded"
            ),
        }
    }

    fn handle_call_error(&self, unique_id: &str, code: String, description: String) {
        warn!(
            charge_point_id = self.charge_point_id.as_str(),
            message_id = unique_id,
            error_code = code.as_str(),
            "Received CallError"
        );
        let outcome = Err(CommandError::CallError { code, description });
        if self.pending.resolve(unique_id, outcome).is_none() {
            warn!(
                charge_point_id = self.charge_point_id.as_str(),
                message_id = unique_id,
                "Unmatched CallError discarded"
            );
        }
    }

    /// A frame that failed to decode. Device Calls (and unknown frame types)
    /// with a recoverable id get a CallError; malformed replies fail the
    /// matching pending call.
    fn handle_decode_error(&self, text: &str, err: FrameError) -> Option<String> {
        match OcppFrame::recover_header(text) {
            Some((3 | 4, unique_id)) => {
                warn!(
                    charge_point_id = self.charge_point_id.as_str(),
                    message_id = unique_id.as_str(),
                    error = %err,
                    "Malformed reply frame"
                );
                let outcome = Err(CommandError::InvalidResponse(err.to_string()));
                if self.pending.resolve(&unique_id, outcome).is_none() {
                    debug!(
                        charge_point_id = self.charge_point_id.as_str(),
                        message_id = unique_id.as_str(),
                        "Malformed reply matched no pending call"
                    );
                }
                None
            }
            Some((_, unique_id)) => {
                warn!(
                    charge_point_id = self.charge_point_id.as_str(),
                    message_id = unique_id.as_str(),
                    error = %err,
                    "Rejecting undecodable frame"
                );
                Some(
                    OcppFrame::error_response(unique_id, err.call_error_code(), err.to_string())
                        .serialize(),
                )
            }
            None => {
                error!(
                    charge_point_id = self.charge_point_id.as_str(),
                    error = %err,
                    raw = text,
                    "Dropping undecodable frame"
                );
                None
            }
        }
    }
}
