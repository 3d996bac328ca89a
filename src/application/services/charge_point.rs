//! Charge point and connector state
//!
//! Records are keyed by identity and outlive sessions. Shard locks are
//! released before any await or event publication.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::application::events::{
    BootNotificationEvent, ConnectorStatusChangedEvent, Event, SharedEventBus,
};
use crate::domain::{
    next_status, ChargePoint, Connector, ConnectorEvent, ConnectorStatus, DeviceStatus,
    DomainResult, StationDirectory, Transition,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    Accepted,
    /// Identity not in the station directory
    Pending,
}

/// Read-model view of one connector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorSnapshot {
    pub connector_id: u32,
    pub status: ConnectorStatus,
    pub error_code: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl From<&Connector> for ConnectorSnapshot {
    fn from(c: &Connector) -> Self {
        Self {
            connector_id: c.connector_id,
            status: c.status,
            error_code: c.error_code.clone(),
            last_seen: c.last_seen,
        }
    }
}

pub struct ChargePointService {
    charge_points: DashMap<String, ChargePoint>,
    directory: Arc<dyn StationDirectory>,
    event_bus: SharedEventBus,
}

impl ChargePointService {
    pub fn new(directory: Arc<dyn StationDirectory>, event_bus: SharedEventBus) -> Self {
        Self {
            charge_points: DashMap::new(),
            directory,
            event_bus,
        }
    }

    /// Make sure a record exists for the identity and mark it connected.
    pub fn mark_online(&self, charge_point_id: &str) {
        self.charge_points
            .entry(charge_point_id.to_string())
            .or_insert_with(|| ChargePoint::new(charge_point_id))
            .offline_since = None;
    }

    pub fn mark_offline(&self, charge_point_id: &str, at: DateTime<Utc>) {
        if let Some(mut cp) = self.charge_points.get_mut(charge_point_id) {
            cp.offline_since = Some(at);
        }
    }

    /// Forget stations offline for longer than `retention`, except those
    /// `in_use` still needs. Returns how many were dropped.
    pub fn prune_offline<F>(&self, now: DateTime<Utc>, retention: Duration, in_use: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let before = self.charge_points.len();
        self.charge_points.retain(|id, cp| {
            let expired = cp.offline_since.is_some_and(|since| {
                (now - since).to_std().is_ok_and(|offline| offline >= retention)
            });
            !expired || in_use(id)
        });
        let pruned = before.saturating_sub(self.charge_points.len());
        if pruned > 0 {
            info!(pruned, "Forgot long-offline charge points");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.charge_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charge_points.is_empty()
    }

    /// Process a BootNotification. Connectors listed in `busy_connectors`
    /// (open transactions) keep their status.
    pub async fn boot(
        &self,
        charge_point_id: &str,
        info: BootInfo,
        busy_connectors: &[u32],
    ) -> DomainResult<BootDecision> {
        let profile = self.directory.lookup_station(charge_point_id).await?;
        let now = Utc::now();
        let mut changes = Vec::new();

        {
            let mut cp = self
                .charge_points
                .entry(charge_point_id.to_string())
                .or_insert_with(|| ChargePoint::new(charge_point_id));

            cp.vendor = Some(info.vendor.clone());
            cp.model = Some(info.model.clone());
            cp.serial_number = info.serial_number.clone();
            cp.firmware_version = info.firmware_version.clone();
            cp.last_boot = Some(now);

            if let Some(profile) = &profile {
                cp.apply_specs(&profile.connectors);
                cp.status = DeviceStatus::Available;

                for connector in cp.connectors.iter_mut() {
                    if busy_connectors.contains(&connector.connector_id) {
                        debug!(
                            charge_point_id,
                            connector_id = connector.connector_id,
                            "Connector has an open transaction; status kept on boot"
                        );
                        continue;
                    }
                    if let Some(change) = apply(connector, ConnectorEvent::BootAccepted, now) {
                        changes.push(change);
                    }
                }
            }
        }

        let decision = if profile.is_some() {
            BootDecision::Accepted
        } else {
            warn!(charge_point_id, "Boot from identity unknown to the station directory");
            BootDecision::Pending
        };

        info!(
            charge_point_id,
            vendor = info.vendor.as_str(),
            model = info.model.as_str(),
            ?decision,
            "Boot processed"
        );

        self.event_bus
            .publish(Event::BootNotification(BootNotificationEvent {
                charge_point_id: charge_point_id.to_string(),
                vendor: info.vendor,
                model: info.model,
                accepted: decision == BootDecision::Accepted,
                timestamp: now,
            }));
        self.publish_changes(changes);

        Ok(decision)
    }

    /// Apply a StatusNotification for a connector (> 0).
    pub fn report_status(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
        error_code: Option<String>,
        info: Option<String>,
        at: DateTime<Utc>,
    ) -> Transition {
        let (transition, change) = {
            let mut cp = self
                .charge_points
                .entry(charge_point_id.to_string())
                .or_insert_with(|| ChargePoint::new(charge_point_id));
            let connector = cp.connector_mut_or_insert(connector_id);

            let transition = next_status(connector.status, ConnectorEvent::StatusReported(status));
            connector.last_seen = at;
            let change = match transition {
                Transition::Changed { .. } => {
                    connector.error_code = error_code;
                    connector.info = info;
                    apply_transition(connector, transition)
                }
                Transition::Unchanged(_) => None,
                Transition::Rejected { from, event } => {
                    warn!(charge_point_id, connector_id, %from, ?event, "Status report rejected");
                    None
                }
            };
            (transition, change)
        };

        if let Some(change) = change {
            self.publish_changes(vec![change]);
        }
        transition
    }

    /// Feed an engine-originated event to one connector. `None` when the
    /// station or connector is unknown.
    pub fn apply_event(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        event: ConnectorEvent,
    ) -> Option<Transition> {
        let now = Utc::now();
        let (transition, change) = {
            let mut cp = self.charge_points.get_mut(charge_point_id)?;
            let connector = cp
                .connectors
                .iter_mut()
                .find(|c| c.connector_id == connector_id)?;
            let transition = next_status(connector.status, event);
            let change = apply(connector, event, now);
            (transition, change)
        };

        if let Some(change) = change {
            self.publish_changes(vec![change]);
        }
        Some(transition)
    }

    /// Feed an event to every connector of a station.
    pub fn apply_event_all(&self, charge_point_id: &str, event: ConnectorEvent) -> Vec<(u32, Transition)> {
        let now = Utc::now();
        let mut results = Vec::new();
        let mut changes = Vec::new();
        {
            let Some(mut cp) = self.charge_points.get_mut(charge_point_id) else {
                return results;
            };
            for connector in cp.connectors.iter_mut() {
                results.push((connector.connector_id, next_status(connector.status, event)));
                if let Some(change) = apply(connector, event, now) {
                    changes.push(change);
                }
            }
        }
        self.publish_changes(changes);
        results
    }

    pub fn get(&self, charge_point_id: &str) -> Option<ChargePoint> {
        self.charge_points.get(charge_point_id).map(|cp| cp.clone())
    }

    pub fn connector_status(&self, charge_point_id: &str, connector_id: u32) -> Option<ConnectorStatus> {
        self.charge_points
            .get(charge_point_id)
            .and_then(|cp| cp.connector(connector_id).map(|c| c.status))
    }

    pub fn connector_ids(&self, charge_point_id: &str) -> Vec<u32> {
        self.charge_points
            .get(charge_point_id)
            .map(|cp| cp.connectors.iter().map(|c| c.connector_id).collect())
            .unwrap_or_default()
    }

    fn publish_changes(&self, changes: Vec<ConnectorStatusChangedEvent>) {
        for change in changes {
            self.event_bus.publish(Event::ConnectorStatusChanged(change));
        }
    }
}

/// Run the state machine on a connector and build the change event, if any.
fn apply(
    connector: &mut Connector,
    event: ConnectorEvent,
    now: DateTime<Utc>,
) -> Option<ConnectorStatusChangedEvent> {
    let transition = next_status(connector.status, event);
    if let Transition::Rejected { from, event } = transition {
        warn!(
            charge_point_id = connector.charge_point_id.as_str(),
            connector_id = connector.connector_id,
            %from,
            ?event,
            "Connector transition rejected"
        );
        return None;
    }
    connector.last_seen = now;
    apply_transition(connector, transition)
}

fn apply_transition(
    connector: &mut Connector,
    transition: Transition,
) -> Option<ConnectorStatusChangedEvent> {
    let Transition::Changed { from, to } = transition else {
        return None;
    };
    connector.status = to;
    info!(
        charge_point_id = connector.charge_point_id.as_str(),
        connector_id = connector.connector_id,
        %from,
        %to,
        "Connector status changed"
    );
    Some(ConnectorStatusChangedEvent {
        charge_point_id: connector.charge_point_id.clone(),
        connector_id: connector.connector_id,
        previous: from,
        status: to,
        error_code: connector.error_code.clone(),
        timestamp: connector.last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::create_event_bus;
    use crate::domain::ConnectorSpec;
    use crate::infrastructure::memory::ConfigStationDirectory;

    fn service() -> ChargePointService {
        let directory = ConfigStationDirectory::new().with_station(
            "CP001",
            vec![
                ConnectorSpec {
                    connector_id: 1,
                    connector_type: Some("CCS2".into()),
                    max_power_kw: Some(50.0),
                },
                ConnectorSpec {
                    connector_id: 2,
                    connector_type: Some("Type2".into()),
                    max_power_kw: Some(22.0),
                },
            ],
        );
        ChargePointService::new(Arc::new(directory), create_event_bus())
    }

    fn boot_info() -> BootInfo {
        BootInfo {
            vendor: "Vendor".into(),
            model: "Model".into(),
            serial_number: None,
            firmware_version: None,
        }
    }

    #[tokio::test]
    async fn accepted_boot_makes_all_connectors_available() {
        let svc = service();
        let decision = svc.boot("CP001", boot_info(), &[]).await.unwrap();
        assert_eq!(decision, BootDecision::Accepted);

        let cp = svc.get("CP001").unwrap();
        assert_eq!(cp.status, DeviceStatus::Available);
        assert_eq!(cp.connectors.len(), 2);
        assert!(cp
            .connectors
            .iter()
            .all(|c| c.status == ConnectorStatus::Available));
    }

    #[tokio::test]
    async fn boot_keeps_busy_connectors() {
        let svc = service();
        svc.mark_online("CP001");
        svc.report_status("CP001", 2, ConnectorStatus::Charging, None, None, Utc::now());

        svc.boot("CP001", boot_info(), &[2]).await.unwrap();
        assert_eq!(svc.connector_status("CP001", 1), Some(ConnectorStatus::Available));
        assert_eq!(svc.connector_status("CP001", 2), Some(ConnectorStatus::Charging));
    }

    #[tokio::test]
    async fn unknown_station_boot_is_pending() {
        let svc = service();
        let decision = svc.boot("CP999", boot_info(), &[]).await.unwrap();
        assert_eq!(decision, BootDecision::Pending);
        assert_eq!(svc.get("CP999").unwrap().status, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn same_status_report_publishes_nothing() {
        let svc = service();
        svc.boot("CP001", boot_info(), &[]).await.unwrap();
        let mut events = svc.event_bus.subscribe();

        let t = svc.report_status("CP001", 1, ConnectorStatus::Available, None, None, Utc::now());
        assert_eq!(t, Transition::Unchanged(ConnectorStatus::Available));
        assert!(events.try_recv().is_none());

        let t = svc.report_status(
            "CP001",
            1,
            ConnectorStatus::Faulted,
            Some("GroundFailure".into()),
            None,
            Utc::now(),
        );
        assert!(t.is_changed());
        let event = events.try_recv().expect("status change event");
        assert_eq!(event.event.event_type(), "connector_status_changed");
        assert_eq!(
            svc.get("CP001").unwrap().connector(1).unwrap().error_code.as_deref(),
            Some("GroundFailure")
        );
    }

    #[tokio::test]
    async fn engine_events_drive_connectors() {
        let svc = service();
        svc.boot("CP001", boot_info(), &[]).await.unwrap();

        assert!(svc
            .apply_event("CP001", 1, ConnectorEvent::AuthorizationStarted)
            .unwrap()
            .is_changed());
        assert_eq!(svc.connector_status("CP001", 1), Some(ConnectorStatus::Preparing));
        assert!(svc.apply_event("CP001", 9, ConnectorEvent::AuthorizationStarted).is_none());

        let results = svc.apply_event_all("CP001", ConnectorEvent::MadeUnavailable);
        assert_eq!(results.len(), 2);
        assert_eq!(svc.connector_status("CP001", 2), Some(ConnectorStatus::Unavailable));
    }

    #[test]
    fn long_offline_stations_are_forgotten() {
        let svc = service();
        let now = Utc::now();
        for id in ["CP001", "CP002", "CP003"] {
            svc.mark_online(id);
            svc.mark_offline(id, now);
        }
        svc.mark_online("CP003");
        let retention = Duration::from_secs(3600);

        assert_eq!(svc.prune_offline(now + chrono::Duration::minutes(30), retention, |_| false), 0);
        assert_eq!(
            svc.prune_offline(now + chrono::Duration::minutes(61), retention, |id| id == "CP002"),
            1
        );
        assert!(svc.get("CP001").is_none());
        assert!(svc.get("CP002").is_some());
        assert!(svc.get("CP003").unwrap().offline_since.is_none());
        assert_eq!(svc.len(), 2);
    }
}
