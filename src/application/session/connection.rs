//! A single device session

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::pending::PendingCalls;
use crate::domain::OcppVersion;

/// Messages queued for the session's WebSocket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized OCPP-J frame
    Frame(String),
    /// Close the socket with the given reason
    Close(SessionEnd),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Transport closed or failed
    Disconnected,
    /// Another connection registered the same identity
    Replaced,
    /// Evicted by the liveness sweep
    LivenessTimeout,
    ServerShutdown,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Replaced => "replaced by new connection",
            Self::LivenessTimeout => "liveness timeout",
            Self::ServerShutdown => "server shutting down",
        }
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An active WebSocket session with a charge point
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique per connection instance; a replacement gets a new one
    pub connection_id: u64,
    pub charge_point_id: String,
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub ocpp_version: OcppVersion,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Any inbound traffic
    pub last_seen: DateTime<Utc>,
    /// Interval handed to the device at boot
    pub heartbeat_interval_secs: u64,
    pub pending: Arc<PendingCalls>,
}

impl Session {
    pub fn new(
        connection_id: u64,
        charge_point_id: impl Into<String>,
        sender: mpsc::UnboundedSender<Outbound>,
        ocpp_version: OcppVersion,
        heartbeat_interval_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            charge_point_id: charge_point_id.into(),
            sender,
            ocpp_version,
            connected_at: now,
            last_heartbeat: None,
            last_seen: now,
            heartbeat_interval_secs,
            pending: Arc::new(PendingCalls::new()),
        }
    }

    /// Ask the writer to close the socket. A writer that is already gone is fine.
    pub fn close(&self, reason: SessionEnd) {
        let _ = self.sender.send(Outbound::Close(reason));
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
        self.last_seen = now;
    }

    /// Whether no traffic has been seen for longer than the liveness threshold.
    pub fn is_stale(&self, now: DateTime<Utc>, multiplier: u32, floor_secs: u64) -> bool {
        let silent = now.signed_duration_since(self.last_seen).num_seconds();
        silent > liveness_threshold_secs(self.heartbeat_interval_secs, multiplier, floor_secs)
    }
}

/// `max(multiplier × interval, floor)` in seconds.
pub fn liveness_threshold_secs(interval_secs: u64, multiplier: u32, floor_secs: u64) -> i64 {
    let scaled = interval_secs.saturating_mul(u64::from(multiplier));
    scaled.max(floor_secs).min(i64::MAX as u64) as i64
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_session() -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(1, "CP001", tx, OcppVersion::V16, 300);
        (session, rx)
    }

    #[test]
    fn close_after_writer_exit_is_harmless() {
        let (session, rx) = make_session();
        drop(rx);
        session.close(SessionEnd::LivenessTimeout);
    }

    #[test]
    fn close_queues_reason() {
        let (session, mut rx) = make_session();
        session.close(SessionEnd::Replaced);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(SessionEnd::Replaced)
        );
        assert_eq!(SessionEnd::Replaced.to_string(), "replaced by new connection");
    }

    #[test]
    fn threshold_uses_floor() {
        assert_eq!(liveness_threshold_secs(300, 3, 90), 900);
        assert_eq!(liveness_threshold_secs(10, 3, 90), 90);
    }

    #[test]
    fn staleness_follows_last_seen() {
        let (mut session, _rx) = make_session();
        let now = Utc::now();
        session.touch(now);
        assert!(!session.is_stale(now + Duration::seconds(899), 3, 90));
        assert!(session.is_stale(now + Duration::seconds(901), 3, 90));

        session.record_heartbeat(now + Duration::seconds(800));
        assert!(!session.is_stale(now + Duration::seconds(901), 3, 90));
        assert!(session.last_heartbeat.is_some());
    }
}
