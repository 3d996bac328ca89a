//! Charge-point protocol engine
//!
//! Owns the session registry, the charge-point and transaction services and
//! the command dispatcher, and implements the session lifecycle shared by
//! the WebSocket server, the liveness monitor and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::commands::{
    create_command_sender, CommandDispatcher, CommandError, CommandTimeouts,
    SharedCommandDispatcher,
};
use crate::application::events::{
    ChargePointConnectedEvent, ChargePointDisconnectedEvent, Event, EventSubscriber,
    SharedEventBus,
};
use crate::application::handlers::OcppHandler;
use crate::application::services::{
    ChargePointService, ConnectorSnapshot, TransactionManager, TransactionSettings,
};
use crate::application::session::{Outbound, SessionEnd, SessionRegistry, SharedSessionRegistry};
use crate::domain::{
    Authorizer, BillingSink, ChargePoint, OcppVersion, StationDirectory, TariffProvider,
};

/// External collaborators the engine consumes
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn StationDirectory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub tariffs: Arc<dyn TariffProvider>,
    pub billing: Arc<dyn BillingSink>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Interval handed to devices on accepted boot
    pub heartbeat_interval_secs: u64,
    pub liveness_multiplier: u32,
    pub liveness_floor_secs: u64,
    pub command_timeouts: CommandTimeouts,
    pub transactions: TransactionSettings,
    /// How long a disconnected station's record is kept
    pub offline_retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            liveness_multiplier: 3,
            liveness_floor_secs: 90,
            command_timeouts: CommandTimeouts::default(),
            transactions: TransactionSettings::default(),
            offline_retention: Duration::from_secs(3600),
        }
    }
}

/// Read-model view of one live connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub charge_point_id: String,
    pub connection_id: u64,
    pub ocpp_version: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    /// From the last BootNotification; `None` until the device boots
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub last_boot: Option<DateTime<Utc>>,
    pub connectors: Vec<ConnectorSnapshot>,
}

/// What one housekeeping pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub expired_calls: usize,
    pub pruned_transactions: usize,
    pub forgotten_charge_points: usize,
}

pub struct Engine {
    settings: EngineSettings,
    registry: SharedSessionRegistry,
    charge_points: Arc<ChargePointService>,
    transactions: Arc<TransactionManager>,
    dispatcher: SharedCommandDispatcher,
    event_bus: SharedEventBus,
}

impl Engine {
    pub fn new(
        collaborators: Collaborators,
        settings: EngineSettings,
        event_bus: SharedEventBus,
    ) -> Arc<Self> {
        let registry = SessionRegistry::shared();
        let charge_points = Arc::new(ChargePointService::new(
            collaborators.directory,
            event_bus.clone(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            collaborators.authorizer,
            collaborators.tariffs,
            collaborators.billing,
            event_bus.clone(),
            settings.transactions.clone(),
        ));
        let command_sender =
            create_command_sender(
                registry.clone(),
                settings.command_timeouts.clone(),
                event_bus.clone(),
            );
        let dispatcher = Arc::new(CommandDispatcher::new(command_sender, charge_points.clone()));

        Arc::new(Self {
            settings,
            registry,
            charge_points,
            transactions,
            dispatcher,
            event_bus,
        })
    }

    /// Register a new connection and return the handler for its frames.
    /// A previous session for the same identity is closed first.
    pub fn open_session(
        &self,
        charge_point_id: &str,
        sender: mpsc::UnboundedSender<Outbound>,
        ocpp_version: OcppVersion,
    ) -> OcppHandler {
        let registration = self.registry.register(
            charge_point_id,
            sender,
            ocpp_version,
            self.settings.heartbeat_interval_secs,
        );
        self.charge_points.mark_online(charge_point_id);

        let now = Utc::now();
        if let Some(old) = &registration.replaced {
            self.event_bus
                .publish(Event::ChargePointDisconnected(ChargePointDisconnectedEvent {
                    charge_point_id: charge_point_id.to_string(),
                    connection_id: old.connection_id,
                    reason: SessionEnd::Replaced.to_string(),
                    timestamp: now,
                }));
        }
        self.event_bus
            .publish(Event::ChargePointConnected(ChargePointConnectedEvent {
                charge_point_id: charge_point_id.to_string(),
                connection_id: registration.connection_id,
                timestamp: now,
            }));

        OcppHandler {
            charge_point_id: charge_point_id.to_string(),
            connection_id: registration.connection_id,
            pending: registration.pending,
            registry: self.registry.clone(),
            charge_points: self.charge_points.clone(),
            transactions: self.transactions.clone(),
            event_bus: self.event_bus.clone(),
            heartbeat_interval_secs: self.settings.heartbeat_interval_secs,
        }
    }

    /// Tear down a connection instance: cancel its pending calls, close the
    /// transport, abandon its active transactions and publish the loss.
    ///
    /// Returns `false` when the instance is no longer registered (already
    /// ended, or replaced by a newer connection).
    pub fn end_session(&self, charge_point_id: &str, connection_id: u64, reason: SessionEnd) -> bool {
        let Some(session) = self.registry.remove(charge_point_id, connection_id) else {
            // A start still in flight when the session was evicted activates
            // after the first abandon pass.
            if !self.registry.is_connected(charge_point_id) {
                let late = self.transactions.abandon(charge_point_id);
                if !late.is_empty() {
                    debug!(charge_point_id, connection_id, ?late, "Abandoned late-activated transactions");
                }
            }
            return false;
        };

        let cancelled = session.pending.cancel_all(CommandError::ConnectionLost);
        if reason != SessionEnd::Disconnected {
            session.close(reason);
        }
        let abandoned = self.transactions.abandon(charge_point_id);
        self.charge_points.mark_offline(charge_point_id, Utc::now());

        info!(
            charge_point_id,
            connection_id,
            %reason,
            cancelled,
            abandoned = abandoned.len(),
            "Session ended"
        );

        self.event_bus
            .publish(Event::ChargePointDisconnected(ChargePointDisconnectedEvent {
                charge_point_id: charge_point_id.to_string(),
                connection_id,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            }));
        true
    }

    /// Evict every session silent past its liveness threshold.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let stale = self.registry.stale_sessions(
            now,
            self.settings.liveness_multiplier,
            self.settings.liveness_floor_secs,
        );

        let mut evicted = 0;
        for (charge_point_id, connection_id) in stale {
            warn!(
                charge_point_id = charge_point_id.as_str(),
                connection_id,
                "Evicting silent session"
            );
            if self.end_session(&charge_point_id, connection_id, SessionEnd::LivenessTimeout) {
                metrics::counter!("ocpp_sessions_evicted_total").increment(1);
                evicted += 1;
            }
        }
        evicted
    }

    /// Time out overdue Calls and forget closed transactions and stations
    /// past their retention windows.
    pub fn housekeep(&self, now: DateTime<Utc>) -> Housekeeping {
        let expired_calls = self
            .registry
            .snapshot()
            .iter()
            .map(|session| session.pending.expire_overdue(now))
            .sum();
        let pruned_transactions = self.transactions.prune_closed(now);
        let forgotten_charge_points = self.charge_points.prune_offline(
            now,
            self.settings.offline_retention,
            |id| self.registry.is_connected(id) || self.transactions.has_open(id),
        );

        Housekeeping {
            expired_calls,
            pruned_transactions,
            forgotten_charge_points,
        }
    }

    /// Close every live session with "server shutting down".
    pub fn shutdown_sessions(&self) -> usize {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|s| self.end_session(&s.charge_point_id, s.connection_id, SessionEnd::ServerShutdown))
            .count()
    }

    pub fn list_active_connections(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|s| {
                let record = self
                    .charge_points
                    .get(&s.charge_point_id)
                    .unwrap_or_else(|| ChargePoint::new(s.charge_point_id.as_str()));
                ConnectionSnapshot {
                    charge_point_id: s.charge_point_id,
                    connection_id: s.connection_id,
                    ocpp_version: s.ocpp_version.to_string(),
                    connected_at: s.connected_at,
                    last_heartbeat: s.last_heartbeat,
                    last_seen: s.last_seen,
                    vendor: record.vendor,
                    model: record.model,
                    serial_number: record.serial_number,
                    firmware_version: record.firmware_version,
                    last_boot: record.last_boot,
                    connectors: record.connectors.iter().map(ConnectorSnapshot::from).collect(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.charge_point_id.cmp(&b.charge_point_id));
        snapshots
    }

    /// Send an arbitrary action to a device and await its reply.
    pub async fn dispatch_command(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        self.dispatcher.dispatch(charge_point_id, action, payload).await
    }

    pub fn dispatcher(&self) -> &SharedCommandDispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.event_bus.subscribe()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SharedSessionRegistry {
        &self.registry
    }

    pub fn charge_points(&self) -> &Arc<ChargePointService> {
        &self.charge_points
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }
}
