//! GetConfiguration

use rust_ocpp::v1_6::messages::get_configuration::{
    GetConfigurationRequest, GetConfigurationResponse,
};
use rust_ocpp::v1_6::types::KeyValue;
use tracing::info;

use super::{CommandDispatcher, CommandError};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigurationResult {
    pub configuration_key: Vec<KeyValue>,
    /// Requested keys the device does not know
    pub unknown_key: Vec<String>,
}

/// Read configuration keys from the device; `None` asks for all of them.
pub async fn get_configuration(
    dispatcher: &CommandDispatcher,
    charge_point_id: &str,
    keys: Option<Vec<String>>,
) -> Result<ConfigurationResult, CommandError> {
    info!(charge_point_id, ?keys, "GetConfiguration");

    let payload = serde_json::to_value(&GetConfigurationRequest { key: keys })
        .map_err(|e| CommandError::SendFailed(format!("Serialization failed: {}", e)))?;

    let result = dispatcher
        .dispatch(charge_point_id, "GetConfiguration", payload)
        .await?;

    let response: GetConfigurationResponse = serde_json::from_value(result)
        .map_err(|e| CommandError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

    Ok(ConfigurationResult {
        configuration_key: response.configuration_key.unwrap_or_default(),
        unknown_key: response.unknown_key.unwrap_or_default(),
    })
}
