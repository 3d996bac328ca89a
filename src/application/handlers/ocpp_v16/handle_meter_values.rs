//! MeterValues handler

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::meter_values::{MeterValuesRequest, MeterValuesResponse};
use rust_ocpp::v1_6::types::{Measurand, MeterValue, UnitOfMeasure};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::services::MeterReport;
use crate::application::OcppHandler;

/// Quantities the engine tracks, reduced from a list of meter values.
/// The latest sample of each measurand wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Samples {
    /// Energy.Active.Import.Register in Wh
    pub energy_wh: Option<f64>,
    /// Power.Active.Import in W
    pub power_w: Option<f64>,
    /// State of charge in %
    pub soc: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn extract_samples(meter_values: &[MeterValue]) -> Samples {
    let mut samples = Samples::default();

    for meter_value in meter_values {
        samples.timestamp = Some(meter_value.timestamp);

        for sampled in &meter_value.sampled_value {
            let value: f64 = match sampled.value.parse() {
                Ok(v) if f64::is_finite(v) => v,
                Ok(v) => {
                    warn!(value = v, "Non-finite sampled value skipped");
                    continue;
                }
                Err(_) => continue,
            };

            let measurand = sampled
                .measurand
                .clone()
                .unwrap_or(Measurand::EnergyActiveImportRegister);

            match measurand {
                Measurand::EnergyActiveImportRegister => {
                    samples.energy_wh = Some(match sampled.unit.as_ref() {
                        Some(UnitOfMeasure::KWh) => value * 1000.0,
                        _ => value,
                    });
                }
                Measurand::PowerActiveImport => {
                    samples.power_w = Some(match sampled.unit.as_ref() {
                        Some(UnitOfMeasure::Kw) => value * 1000.0,
                        _ => value,
                    });
                }
                Measurand::SoC => samples.soc = Some(value),
                other => debug!(measurand = ?other, value, "Unhandled measurand"),
            }
        }
    }

    samples
}

pub async fn handle_meter_values(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: MeterValuesRequest = parse_payload(handler, "MeterValues", payload)?;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        connector_id = req.connector_id,
        transaction_id = ?req.transaction_id,
        samples = req.meter_value.len(),
        "MeterValues"
    );

    let samples = extract_samples(&req.meter_value);

    let report = MeterReport {
        charge_point_id: handler.charge_point_id.clone(),
        connector_id: req.connector_id,
        transaction_id: req.transaction_id,
        energy_wh: samples.energy_wh,
        power_w: samples.power_w,
        soc: samples.soc,
        timestamp: samples.timestamp.unwrap_or_else(Utc::now),
    };

    if let Err(e) = handler.transactions.record_meter(report) {
        warn!(
            charge_point_id = handler.charge_point_id.as_str(),
            connector_id = req.connector_id,
            transaction_id = ?req.transaction_id,
            error = %e,
            "Meter values rejected"
        );
    }

    to_payload(&MeterValuesResponse {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meter_values(value: Value) -> Vec<MeterValue> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn energy_defaults_to_register_in_wh() {
        let samples = extract_samples(&meter_values(json!([
            {"timestamp": "2024-05-01T10:00:00Z", "sampledValue": [{"value": "1010.5"}]}
        ])));
        assert_eq!(samples.energy_wh, Some(1010.5));
        assert_eq!(samples.power_w, None);
        assert!(samples.timestamp.is_some());
    }

    #[test]
    fn kilo_units_are_scaled() {
        let samples = extract_samples(&meter_values(json!([{
            "timestamp": "2024-05-01T10:00:00Z",
            "sampledValue": [
                {"value": "1.052", "measurand": "Energy.Active.Import.Register", "unit": "kWh"},
                {"value": "7.4", "measurand": "Power.Active.Import", "unit": "kW"},
                {"value": "63", "measurand": "SoC"}
            ]
        }])));
        assert_eq!(samples.energy_wh, Some(1052.0));
        assert_eq!(samples.power_w, Some(7400.0));
        assert_eq!(samples.soc, Some(63.0));
    }

    #[test]
    fn latest_sample_wins_and_garbage_is_skipped() {
        let samples = extract_samples(&meter_values(json!([
            {"timestamp": "2024-05-01T10:00:00Z", "sampledValue": [{"value": "1000"}]},
            {"timestamp": "2024-05-01T10:05:00Z", "sampledValue": [
                {"value": "1020"},
                {"value": "n/a", "measurand": "Power.Active.Import"},
                {"value": "230", "measurand": "Voltage"}
            ]}
        ])));
        assert_eq!(samples.energy_wh, Some(1020.0));
        assert_eq!(samples.power_w, None);
        assert_eq!(
            samples.timestamp.map(|t| t.to_rfc3339()),
            Some("2024-05-01T10:05:00+00:00".to_string())
        );
    }

    #[test]
    fn non_finite_values_are_skipped() {
        let samples = extract_samples(&meter_values(json!([
            {"timestamp": "2024-05-01T10:00:00Z", "sampledValue": [{"value": "1000"}]},
            {"timestamp": "2024-05-01T10:05:00Z", "sampledValue": [
                {"value": "NaN"},
                {"value": "inf", "measurand": "Power.Active.Import"},
                {"value": "-infinity", "measurand": "SoC"}
            ]}
        ])));
        assert_eq!(samples.energy_wh, Some(1000.0));
        assert_eq!(samples.power_w, None);
        assert_eq!(samples.soc, None);
    }
}
