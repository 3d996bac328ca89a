//! Command dispatcher: the single entry point for operator commands.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info};

use super::get_configuration::ConfigurationResult;
use super::{
    change_availability, change_configuration, get_configuration, remote_start, remote_stop,
    reset, trigger_message, unlock_connector, Availability, CommandError, ResetKind,
    SharedCommandSender, TriggerType,
};
use crate::application::services::ChargePointService;
use crate::domain::ConnectorEvent;

fn record_command_latency(action: &str, start: Instant, result: &Result<Value, CommandError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(CommandError::Offline(_)) => "offline",
        Err(CommandError::Timeout { .. }) => "timeout",
        Err(CommandError::ConnectionLost) => "connection_lost",
        Err(CommandError::CallError { .. }) => "call_error",
        Err(_) => "error",
    };
    metrics::histogram!("ocpp_command_latency_seconds", "action" => action.to_string())
        .record(start.elapsed().as_secs_f64());
    metrics::counter!(
        "ocpp_commands_total",
        "action" => action.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Connector transition implied by an accepted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandEffect {
    AuthorizationStarted { connector_id: Option<u32> },
    MadeUnavailable { connector_id: u32 },
}

impl CommandEffect {
    fn for_request(action: &str, payload: &Value) -> Option<Self> {
        let connector_id = payload
            .get("connectorId")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok());

        match action {
            "RemoteStartTransaction" => Some(Self::AuthorizationStarted { connector_id }),
            "ChangeAvailability" if payload.get("type").and_then(Value::as_str) == Some("Inoperative") => {
                connector_id.map(|connector_id| Self::MadeUnavailable { connector_id })
            }
            _ => None,
        }
    }
}

pub struct CommandDispatcher {
    command_sender: SharedCommandSender,
    charge_points: Arc<ChargePointService>,
}

impl CommandDispatcher {
    pub fn new(command_sender: SharedCommandSender, charge_points: Arc<ChargePointService>) -> Self {
        Self {
            command_sender,
            charge_points,
        }
    }

    pub fn command_sender(&self) -> &SharedCommandSender {
        &self.command_sender
    }

    /// Send any action with a raw JSON payload.
    pub async fn dispatch(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        let start = Instant::now();
        let effect = CommandEffect::for_request(action, &payload);

        let result = self
            .command_sender
            .send_command(charge_point_id, action, payload)
            .await;
        record_command_latency(action, start, &result);

        if let (Ok(response), Some(effect)) = (&result, effect) {
            if response.get("status").and_then(Value::as_str) == Some("Accepted") {
                self.apply_effect(charge_point_id, effect);
            }
        }

        result
    }

    fn apply_effect(&self, charge_point_id: &str, effect: CommandEffect) {
        match effect {
            CommandEffect::AuthorizationStarted { connector_id } => {
                let connector_id = connector_id.or_else(|| {
                    match self.charge_points.connector_ids(charge_point_id).as_slice() {
                        [only] => Some(*only),
                        _ => None,
                    }
                });
                match connector_id {
                    Some(id) => {
                        self.charge_points.apply_event(
                            charge_point_id,
                            id,
                            ConnectorEvent::AuthorizationStarted,
                        );
                    }
                    None => debug!(
                        charge_point_id,
                        "RemoteStart accepted without a resolvable connector"
                    ),
                }
            }
            CommandEffect::MadeUnavailable { connector_id: 0 } => {
                self.charge_points
                    .apply_event_all(charge_point_id, ConnectorEvent::MadeUnavailable);
            }
            CommandEffect::MadeUnavailable { connector_id } => {
                self.charge_points.apply_event(
                    charge_point_id,
                    connector_id,
                    ConnectorEvent::MadeUnavailable,
                );
            }
        }
    }

    // ─── Typed commands ────────────────────────────────────────────────

    pub async fn remote_start(
        &self,
        charge_point_id: &str,
        id_tag: &str,
        connector_id: Option<u32>,
    ) -> Result<String, CommandError> {
        info!(charge_point_id, id_tag, ?connector_id, "Dispatching RemoteStartTransaction");
        remote_start::remote_start_transaction(self, charge_point_id, id_tag, connector_id).await
    }

    pub async fn remote_stop(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
    ) -> Result<String, CommandError> {
        info!(charge_point_id, transaction_id, "Dispatching RemoteStopTransaction");
        remote_stop::remote_stop_transaction(self, charge_point_id, transaction_id).await
    }

    pub async fn reset(
        &self,
        charge_point_id: &str,
        kind: ResetKind,
    ) -> Result<String, CommandError> {
        reset::reset(self, charge_point_id, kind).await
    }

    pub async fn unlock_connector(
        &self,
        charge_point_id: &str,
        connector_id: u32,
    ) -> Result<String, CommandError> {
        unlock_connector::unlock_connector(self, charge_point_id, connector_id).await
    }

    pub async fn change_configuration(
        &self,
        charge_point_id: &str,
        key: &str,
        value: &str,
    ) -> Result<String, CommandError> {
        change_configuration::change_configuration(self, charge_point_id, key, value).await
    }

    pub async fn get_configuration(
        &self,
        charge_point_id: &str,
        keys: Option<Vec<String>>,
    ) -> Result<ConfigurationResult, CommandError> {
        get_configuration::get_configuration(self, charge_point_id, keys).await
    }

    pub async fn change_availability(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        availability: Availability,
    ) -> Result<String, CommandError> {
        change_availability::change_availability(self, charge_point_id, connector_id, availability)
            .await
    }

    pub async fn trigger_message(
        &self,
        charge_point_id: &str,
        message: TriggerType,
        connector_id: Option<u32>,
    ) -> Result<String, CommandError> {
        trigger_message::trigger_message(self, charge_point_id, message, connector_id).await
    }
}

pub type SharedCommandDispatcher = Arc<CommandDispatcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effects_are_derived_from_requests() {
        assert_eq!(
            CommandEffect::for_request(
                "RemoteStartTransaction",
                &json!({"idTag": "T", "connectorId": 2})
            ),
            Some(CommandEffect::AuthorizationStarted {
                connector_id: Some(2)
            })
        );
        assert_eq!(
            CommandEffect::for_request(
                "ChangeAvailability",
                &json!({"connectorId": 0, "type": "Inoperative"})
            ),
            Some(CommandEffect::MadeUnavailable { connector_id: 0 })
        );
        assert_eq!(
            CommandEffect::for_request(
                "ChangeAvailability",
                &json!({"connectorId": 1, "type": "Operative"})
            ),
            None
        );
        assert_eq!(CommandEffect::for_request("Reset", &json!({"type": "Soft"})), None);
    }
}
