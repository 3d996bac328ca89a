//! StopTransaction handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::stop_transaction::{
    StopTransactionRequest, StopTransactionResponse,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::handle_authorize::id_tag_info;
use super::{extract_samples, parse_payload, to_payload, HandlerResult};
use crate::application::services::{MeterReport, StopRequest};
use crate::application::OcppHandler;
use crate::domain::ConnectorEvent;

pub async fn handle_stop_transaction(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: StopTransactionRequest = parse_payload(handler, "StopTransaction", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        transaction_id = req.transaction_id,
        meter_stop = req.meter_stop,
        "StopTransaction"
    );

    // Readings carried in the stop message accrue before the final meter.
    if let Some(data) = req.transaction_data.as_deref() {
        let samples = extract_samples(data);
        if samples.energy_wh.is_some() {
            if let Some(tx) = handler.transactions.get(req.transaction_id) {
                let report = MeterReport {
                    charge_point_id: handler.charge_point_id.clone(),
                    connector_id: tx.connector_id,
                    transaction_id: Some(req.transaction_id),
                    energy_wh: samples.energy_wh,
                    power_w: samples.power_w,
                    soc: samples.soc,
                    timestamp: samples.timestamp.unwrap_or_else(Utc::now),
                };
                if let Err(e) = handler.transactions.record_meter(report) {
                    debug!(
                        charge_point_id = handler.charge_point_id.as_str(),
                        transaction_id = req.transaction_id,
                        error = %e,
                        "Transaction data reading skipped"
                    );
                }
            }
        }
    }

    let stop = handler
        .transactions
        .stop(StopRequest {
            charge_point_id: handler.charge_point_id.clone(),
            transaction_id: req.transaction_id,
            meter_stop: f64::from(req.meter_stop),
            timestamp: req.timestamp,
            reason: req.reason.as_ref().map(|r| format!("{:?}", r)),
        })
        .await;

    match stop {
        Ok(result) if result.newly_closed => {
            handler.charge_points.apply_event(
                &handler.charge_point_id,
                result.connector_id,
                ConnectorEvent::TransactionStopped,
            );
        }
        Ok(_) => {}
        Err(e) => warn!(
            charge_point_id = handler.charge_point_id.as_str(),
            transaction_id = req.transaction_id,
            error = %e,
            "Failed to stop transaction"
        ),
    }

    let id_tag_info = match req.id_tag.as_deref() {
        Some(id_tag) => Some(id_tag_info(handler.transactions.authorize(id_tag).await)),
        None => None,
    };

    to_payload(&StopTransactionResponse { id_tag_info })
}
