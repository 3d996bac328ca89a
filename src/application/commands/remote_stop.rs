//! RemoteStopTransaction

use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};

use super::{CommandDispatcher, CommandError};

pub async fn remote_stop_transaction(
    dispatcher: &CommandDispatcher,
    charge_point_id: &str,
    transaction_id: i32,
) -> Result<String, CommandError> {
    let request = RemoteStopTransactionRequest { transaction_id };
    let payload = serde_json::to_value(&request)
        .map_err(|e| CommandError::SendFailed(format!("Serialization failed: {}", e)))?;

    let result = dispatcher
        .dispatch(charge_point_id, "RemoteStopTransaction", payload)
        .await?;

    let response: RemoteStopTransactionResponse = serde_json::from_value(result)
        .map_err(|e| CommandError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

    Ok(format!("{:?}", response.status))
}
