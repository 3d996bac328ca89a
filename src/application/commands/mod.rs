//! Operator → device commands
//!
//! ```text
//! Engine::dispatch_command ──► CommandDispatcher ──► typed builders (reset, remote_start, ...)
//!                                   │                        │
//!                          state side-effects         rust_ocpp v1.6 types
//!                                   │
//!                             CommandSender ──► session PendingCalls + outbound channel
//! ```
//!
//! - [`CommandSender`]: sends `[2, id, action, payload]` on the device's
//!   session and awaits exactly one outcome.
//! - [`CommandDispatcher`]: records metrics and applies the connector
//!   transitions implied by accepted commands.

pub mod change_availability;
pub mod change_configuration;
pub mod dispatcher;
pub mod get_configuration;
pub mod remote_start;
pub mod remote_stop;
pub mod reset;
pub mod trigger_message;
pub mod unlock_connector;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::events::{Event, FrameDirection, FrameLoggedEvent, SharedEventBus};
use crate::application::session::{Outbound, PendingCalls, SharedSessionRegistry};
use crate::shared::ocpp_frame::OcppFrame;

pub use dispatcher::{CommandDispatcher, SharedCommandDispatcher};
pub use get_configuration::ConfigurationResult;

/// Availability requested by ChangeAvailability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Operative,
    Inoperative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

/// Message a device can be asked to send via TriggerMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    BootNotification,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
    Heartbeat,
    MeterValues,
    StatusNotification,
}

/// Outcome of a command other than a successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No live session for the identity
    #[error("Charge point {0} is offline")]
    Offline(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("No response to {action} within {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    /// Session ended before a reply arrived
    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    /// Explicit rejection by the device
    #[error("CallError {code}: {description}")]
    CallError { code: String, description: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Per-action reply deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub default: Duration,
    pub per_action: HashMap<String, Duration>,
}

impl CommandTimeouts {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_action: HashMap::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, timeout: Duration) -> Self {
        self.per_action.insert(action.into(), timeout);
        self
    }

    pub fn for_action(&self, action: &str) -> Duration {
        self.per_action.get(action).copied().unwrap_or(self.default)
    }
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Removes the pending entry if the awaiting future is dropped or fails.
struct PendingGuard {
    pending: Arc<PendingCalls>,
    unique_id: String,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(&self.unique_id);
        }
    }
}

pub struct CommandSender {
    session_registry: SharedSessionRegistry,
    timeouts: CommandTimeouts,
    event_bus: SharedEventBus,
}

impl CommandSender {
    pub fn new(
        session_registry: SharedSessionRegistry,
        timeouts: CommandTimeouts,
        event_bus: SharedEventBus,
    ) -> Self {
        Self {
            session_registry,
            timeouts,
            event_bus,
        }
    }

    pub fn timeouts(&self) -> &CommandTimeouts {
        &self.timeouts
    }

    /// Send a Call to the device and await its reply.
    ///
    /// Resolves exactly once: the reply payload, a device `CallError`,
    /// `Timeout`, `ConnectionLost`, or `Offline` when no session exists.
    /// Dropping the future removes the pending entry.
    pub async fn send_command(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        let session = self
            .session_registry
            .handle(charge_point_id)
            .ok_or_else(|| CommandError::Offline(charge_point_id.to_string()))?;

        let timeout = self.timeouts.for_action(action);
        let (message_id, mut rx) = session.pending.register(action, timeout)?;
        let mut guard = PendingGuard {
            pending: session.pending.clone(),
            unique_id: message_id.clone(),
            armed: true,
        };

        let frame = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.to_string(),
            payload,
        };

        info!(
            charge_point_id,
            action,
            message_id = message_id.as_str(),
            connection_id = session.connection_id,
            "Sending command"
        );

        session
            .sender
            .send(Outbound::Frame(frame.serialize()))
            .map_err(|e| CommandError::SendFailed(e.to_string()))?;
        self.event_bus.publish(Event::FrameLogged(FrameLoggedEvent::new(
            charge_point_id,
            FrameDirection::Out,
            &frame,
            None,
        )));

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CommandError::ConnectionLost),
            Err(_) => {
                if session.pending.remove(&message_id) {
                    warn!(
                        charge_point_id,
                        action,
                        message_id = message_id.as_str(),
                        "Command timed out"
                    );
                    Err(CommandError::Timeout {
                        action: action.to_string(),
                        timeout,
                    })
                } else {
                    // Resolved concurrently with the deadline; take that outcome.
                    rx.await.unwrap_or(Err(CommandError::ConnectionLost))
                }
            }
        };

        guard.disarm();
        outcome
    }
}

pub type SharedCommandSender = Arc<CommandSender>;

pub fn create_command_sender(
    session_registry: SharedSessionRegistry,
    timeouts: CommandTimeouts,
    event_bus: SharedEventBus,
) -> SharedCommandSender {
    Arc::new(CommandSender::new(session_registry, timeouts, event_bus))
}
