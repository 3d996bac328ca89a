//! Outstanding operator Calls for one session
//!
//! Every entry is removed exactly once: by the matching reply, by the
//! caller on timeout or cancellation, by [`PendingCalls::cancel_all`] when
//! the session is lost, or by [`PendingCalls::expire_overdue`] from the
//! liveness sweep. Whoever removes the entry decides the outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::application::commands::CommandError;

pub type CallOutcome = Result<Value, CommandError>;

#[derive(Debug)]
struct PendingCall {
    action: String,
    issued_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    responder: oneshot::Sender<CallOutcome>,
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<String, PendingCall>,
    closed: AtomicBool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new Call and return its correlation id plus the receiver
    /// for its outcome.
    pub fn register(
        &self,
        action: &str,
        timeout: Duration,
    ) -> Result<(String, oneshot::Receiver<CallOutcome>), CommandError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::ConnectionLost);
        }

        let (tx, rx) = oneshot::channel();
        let issued_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| issued_at.checked_add_signed(d))
            .unwrap_or(issued_at);
        let mut call = Some(PendingCall {
            action: action.to_string(),
            issued_at,
            deadline,
            responder: tx,
        });

        let unique_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.calls.entry(candidate.clone()) {
                if let Some(call) = call.take() {
                    slot.insert(call);
                }
                break candidate;
            }
        };

        // A concurrent cancel_all may have drained the table before our insert.
        if self.closed.load(Ordering::SeqCst) {
            self.calls.remove(&unique_id);
            return Err(CommandError::ConnectionLost);
        }

        Ok((unique_id, rx))
    }

    /// Deliver a reply. Returns the action name when the id was pending.
    pub fn resolve(&self, unique_id: &str, outcome: CallOutcome) -> Option<String> {
        let (_, call) = self.calls.remove(unique_id)?;
        let _ = call.responder.send(outcome);
        Some(call.action)
    }

    /// Action of a Call that is still pending.
    pub fn action_for(&self, unique_id: &str) -> Option<String> {
        self.calls.get(unique_id).map(|c| c.action.clone())
    }

    /// Drop an entry without delivering anything. `true` if it was still pending.
    pub fn remove(&self, unique_id: &str) -> bool {
        self.calls.remove(unique_id).is_some()
    }

    /// Fail every outstanding Call and refuse new ones.
    pub fn cancel_all(&self, error: CommandError) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.responder.send(Err(error.clone()));
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Time out every Call whose deadline is before `now`. Catches entries
    /// whose caller is no longer polling its timer.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<String> = self
            .calls
            .iter()
            .filter(|c| c.deadline < now)
            .map(|c| c.key().clone())
            .collect();

        let mut expired = 0;
        for id in overdue {
            let Some((_, call)) = self.calls.remove_if(&id, |_, c| c.deadline < now) else {
                continue;
            };
            let timeout = (call.deadline - call.issued_at).to_std().unwrap_or_default();
            let _ = call.responder.send(Err(CommandError::Timeout {
                action: call.action,
                timeout,
            }));
            expired += 1;
        }
        expired
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECS_30: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register("Reset", SECS_30).unwrap();
        assert_eq!(pending.action_for(&id).as_deref(), Some("Reset"));

        let action = pending.resolve(&id, Ok(json!({"status": "Accepted"})));
        assert_eq!(action.as_deref(), Some("Reset"));
        assert!(pending.is_empty());
        assert_eq!(rx.await.unwrap().unwrap()["status"], "Accepted");

        assert!(pending.resolve(&id, Ok(json!({}))).is_none());
    }

    #[test]
    fn ids_are_unique() {
        let pending = PendingCalls::new();
        let (a, _ra) = pending.register("Reset", SECS_30).unwrap();
        let (b, _rb) = pending.register("Reset", SECS_30).unwrap();
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn cancel_all_fails_everything_and_closes() {
        let pending = PendingCalls::new();
        let (_, rx1) = pending.register("Reset", SECS_30).unwrap();
        let (_, rx2) = pending.register("UnlockConnector", SECS_30).unwrap();

        assert_eq!(pending.cancel_all(CommandError::ConnectionLost), 2);
        assert_eq!(rx1.await.unwrap(), Err(CommandError::ConnectionLost));
        assert_eq!(rx2.await.unwrap(), Err(CommandError::ConnectionLost));
        assert!(pending.is_closed());
        assert_eq!(
            pending.register("Reset", SECS_30).unwrap_err(),
            CommandError::ConnectionLost
        );
    }

    #[tokio::test]
    async fn overdue_calls_time_out_once() {
        let pending = PendingCalls::new();
        let (late, late_rx) = pending.register("Reset", Duration::from_millis(1)).unwrap();
        let (fresh, _fresh_rx) = pending.register("UnlockConnector", SECS_30).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(pending.expire_overdue(later), 1);
        assert_eq!(pending.expire_overdue(later), 0);
        assert_eq!(
            late_rx.await.unwrap(),
            Err(CommandError::Timeout {
                action: "Reset".into(),
                timeout: Duration::from_millis(1),
            })
        );

        assert!(!pending.remove(&late));
        assert!(pending.remove(&fresh));
    }
}
