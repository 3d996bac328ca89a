//! Session registry: the only identity-keyed map of live sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::connection::{Outbound, Session, SessionEnd};
use super::pending::PendingCalls;
use crate::application::commands::CommandError;
use crate::domain::OcppVersion;

/// Result of registering a new connection
#[derive(Debug)]
pub struct Registration {
    pub connection_id: u64,
    pub pending: Arc<PendingCalls>,
    /// Previous session for the same identity, already closed
    pub replaced: Option<Session>,
}

/// Cheap copy of what a command sender needs, taken without holding a shard
/// lock across an await.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connection_id: u64,
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub pending: Arc<PendingCalls>,
    pub ocpp_version: OcppVersion,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    next_connection_id: AtomicU64,
}

pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn shared() -> SharedSessionRegistry {
        Arc::new(Self::new())
    }

    /// Register a connection. An existing session for the identity is closed
    /// ("replaced by new connection") and its pending calls cancelled.
    pub fn register(
        &self,
        charge_point_id: &str,
        sender: mpsc::UnboundedSender<Outbound>,
        ocpp_version: OcppVersion,
        heartbeat_interval_secs: u64,
    ) -> Registration {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let session = Session::new(
            connection_id,
            charge_point_id,
            sender,
            ocpp_version,
            heartbeat_interval_secs,
        );
        let pending = session.pending.clone();

        let replaced = self.sessions.insert(charge_point_id.to_string(), session);

        if let Some(old) = &replaced {
            let cancelled = old.pending.cancel_all(CommandError::ConnectionLost);
            old.close(SessionEnd::Replaced);
            warn!(
                charge_point_id,
                old_connection_id = old.connection_id,
                connection_id,
                cancelled,
                "Replaced existing session"
            );
        }

        info!(charge_point_id, connection_id, %ocpp_version, "Registered charge point session");
        self.update_gauge();

        Registration {
            connection_id,
            pending,
            replaced,
        }
    }

    /// Remove the session only if it is still the given connection instance.
    pub fn remove(&self, charge_point_id: &str, connection_id: u64) -> Option<Session> {
        let removed = self
            .sessions
            .remove_if(charge_point_id, |_, s| s.connection_id == connection_id)
            .map(|(_, s)| s);
        if removed.is_some() {
            info!(charge_point_id, connection_id, "Unregistered charge point session");
            self.update_gauge();
        }
        removed
    }

    pub fn handle(&self, charge_point_id: &str) -> Option<SessionHandle> {
        self.sessions.get(charge_point_id).map(|s| SessionHandle {
            connection_id: s.connection_id,
            sender: s.sender.clone(),
            pending: s.pending.clone(),
            ocpp_version: s.ocpp_version,
        })
    }

    /// Record inbound traffic for the given connection instance.
    pub fn touch(&self, charge_point_id: &str, connection_id: u64, now: DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(charge_point_id) {
            if session.connection_id == connection_id {
                session.touch(now);
            }
        }
    }

    pub fn record_heartbeat(&self, charge_point_id: &str, connection_id: u64, now: DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(charge_point_id) {
            if session.connection_id == connection_id {
                session.record_heartbeat(now);
            }
        }
    }

    pub fn set_heartbeat_interval(&self, charge_point_id: &str, connection_id: u64, secs: u64) {
        if let Some(mut session) = self.sessions.get_mut(charge_point_id) {
            if session.connection_id == connection_id {
                session.heartbeat_interval_secs = secs;
            }
        }
    }

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.sessions.contains_key(charge_point_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Point-in-time copy of every live session.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// `(identity, connection_id)` of sessions silent past their threshold.
    pub fn stale_sessions(
        &self,
        now: DateTime<Utc>,
        multiplier: u32,
        floor_secs: u64,
    ) -> Vec<(String, u64)> {
        self.sessions
            .iter()
            .filter(|s| s.is_stale(now, multiplier, floor_secs))
            .map(|s| (s.key().clone(), s.connection_id))
            .collect()
    }

    fn update_gauge(&self) {
        metrics::gauge!("ocpp_sessions_active").set(self.sessions.len() as f64);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
