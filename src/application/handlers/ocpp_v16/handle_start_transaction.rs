//! StartTransaction handler

use rust_ocpp::v1_6::messages::start_transaction::{
    StartTransactionRequest, StartTransactionResponse,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::handle_authorize::id_tag_info;
use super::{parse_payload, to_payload, CallFailure, HandlerResult};
use crate::application::services::{StartOutcome, StartRequest};
use crate::application::OcppHandler;
use crate::domain::{AuthorizationDecision, ConnectorEvent, DomainError};
use crate::shared::CallErrorCode;

pub async fn handle_start_transaction(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: StartTransactionRequest = parse_payload(handler, "StartTransaction", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        connector_id = req.connector_id,
        id_tag = req.id_tag.as_str(),
        meter_start = req.meter_start,
        "StartTransaction"
    );

    let outcome = handler
        .transactions
        .start(StartRequest {
            charge_point_id: handler.charge_point_id.clone(),
            connector_id: req.connector_id,
            id_tag: req.id_tag.clone(),
            meter_start: f64::from(req.meter_start),
            timestamp: req.timestamp,
        })
        .await;

    let (transaction_id, decision) = match outcome {
        Ok(StartOutcome::Accepted { transaction_id }) => {
            apply(handler, req.connector_id, ConnectorEvent::TransactionStarted);
            (transaction_id, AuthorizationDecision::Accepted)
        }
        Ok(StartOutcome::Rejected { decision }) => {
            apply(handler, req.connector_id, ConnectorEvent::AuthorizationCancelled);
            (0, decision)
        }
        Err(DomainError::ConnectorBusy { transaction_id, .. }) => {
            warn!(
                charge_point_id = handler.charge_point_id.as_str(),
                connector_id = req.connector_id,
                open_transaction_id = transaction_id,
                "Connector already has an open transaction"
            );
            (0, AuthorizationDecision::ConcurrentTx)
        }
        Err(e) => {
            error!(
                charge_point_id = handler.charge_point_id.as_str(),
                error = %e,
                "Failed to start transaction"
            );
            return Err(CallFailure::new(CallErrorCode::InternalError, e.to_string()));
        }
    };

    to_payload(&StartTransactionResponse {
        transaction_id,
        id_tag_info: id_tag_info(decision),
    })
}

fn apply(handler: &OcppHandler, connector_id: u32, event: ConnectorEvent) {
    if handler
        .charge_points
        .apply_event(&handler.charge_point_id, connector_id, event)
        .is_none()
    {
        debug!(
            charge_point_id = handler.charge_point_id.as_str(),
            connector_id,
            "Connector not known yet, status left to the device"
        );
    }
}
