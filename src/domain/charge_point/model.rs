//! Charge point domain entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connector status as modelled by the engine.
///
/// OCPP 1.6 statuses outside this set are folded in by the protocol handler
/// (`SuspendedEV`/`SuspendedEVSE` count as `Charging`, `Reserved` as `Unavailable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    Finishing,
    Unavailable,
    Faulted,
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::Finishing => "Finishing",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        };
        f.write_str(s)
    }
}

/// Device-level status. Connectivity is tracked by the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Never booted, or boot not accepted
    #[default]
    Unknown,
    /// Boot accepted
    Available,
}

/// Static connector configuration supplied by the station directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpec {
    pub connector_id: u32,
    #[serde(default)]
    pub connector_type: Option<String>,
    #[serde(default)]
    pub max_power_kw: Option<f64>,
}

/// Connector on a charge point
#[derive(Debug, Clone, PartialEq)]
pub struct Connector {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub connector_type: Option<String>,
    pub max_power_kw: Option<f64>,
    pub status: ConnectorStatus,
    pub error_code: Option<String>,
    pub info: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Connector {
    /// A connector starts `Unavailable` until the station's boot is accepted.
    pub fn new(charge_point_id: impl Into<String>, connector_id: u32) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            connector_id,
            connector_type: None,
            max_power_kw: None,
            status: ConnectorStatus::Unavailable,
            error_code: None,
            info: None,
            last_seen: Utc::now(),
        }
    }

    pub fn from_spec(charge_point_id: impl Into<String>, spec: &ConnectorSpec) -> Self {
        let mut connector = Self::new(charge_point_id, spec.connector_id);
        connector.connector_type = spec.connector_type.clone();
        connector.max_power_kw = spec.max_power_kw;
        connector
    }
}

/// A charge point known to the engine.
///
/// Outlives individual sessions: a reconnecting station keeps its connector
/// state until its next boot or status reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargePoint {
    pub id: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub status: DeviceStatus,
    pub connectors: Vec<Connector>,
    pub last_boot: Option<DateTime<Utc>>,
    /// When the last session ended; `None` while connected
    pub offline_since: Option<DateTime<Utc>>,
}

impl ChargePoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor: None,
            model: None,
            serial_number: None,
            firmware_version: None,
            status: DeviceStatus::Unknown,
            connectors: Vec::new(),
            last_boot: None,
            offline_since: None,
        }
    }

    pub fn connector(&self, connector_id: u32) -> Option<&Connector> {
        self.connectors
            .iter()
            .find(|c| c.connector_id == connector_id)
    }

    /// Get a connector, creating it (in the default status) if the station
    /// reports one the directory did not list.
    pub fn connector_mut_or_insert(&mut self, connector_id: u32) -> &mut Connector {
        let idx = match self
            .connectors
            .iter()
            .position(|c| c.connector_id == connector_id)
        {
            Some(idx) => idx,
            None => {
                self.connectors.push(Connector::new(&self.id, connector_id));
                self.connectors.sort_by_key(|c| c.connector_id);
                self.connectors
                    .iter()
                    .position(|c| c.connector_id == connector_id)
                    .unwrap_or(self.connectors.len() - 1)
            }
        };
        &mut self.connectors[idx]
    }

    /// Merge the directory's connector layout into this record, keeping the
    /// status of connectors that already exist.
    pub fn apply_specs(&mut self, specs: &[ConnectorSpec]) {
        for spec in specs {
            let connector = self.connector_mut_or_insert(spec.connector_id);
            connector.connector_type = spec.connector_type.clone();
            connector.max_power_kw = spec.max_power_kw;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connector_is_unavailable() {
        let c = Connector::new("CP001", 1);
        assert_eq!(c.status, ConnectorStatus::Unavailable);
        assert_eq!(c.charge_point_id, "CP001");
    }

    #[test]
    fn connectors_are_created_on_demand_and_sorted() {
        let mut cp = ChargePoint::new("CP001");
        cp.connector_mut_or_insert(2).status = ConnectorStatus::Charging;
        cp.connector_mut_or_insert(1);
        let ids: Vec<u32> = cp.connectors.iter().map(|c| c.connector_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cp.connector(2).unwrap().status, ConnectorStatus::Charging);
    }

    #[test]
    fn apply_specs_keeps_status() {
        let mut cp = ChargePoint::new("CP001");
        cp.connector_mut_or_insert(1).status = ConnectorStatus::Charging;
        cp.apply_specs(&[
            ConnectorSpec {
                connector_id: 1,
                connector_type: Some("CCS2".into()),
                max_power_kw: Some(60.0),
            },
            ConnectorSpec {
                connector_id: 2,
                connector_type: Some("Type2".into()),
                max_power_kw: Some(22.0),
            },
        ]);
        assert_eq!(cp.connectors.len(), 2);
        let first = cp.connector(1).unwrap();
        assert_eq!(first.status, ConnectorStatus::Charging);
        assert_eq!(first.connector_type.as_deref(), Some("CCS2"));
        assert_eq!(cp.connector(2).unwrap().max_power_kw, Some(22.0));
    }
}
