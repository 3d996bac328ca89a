//! Connector state machine
//!
//! ```text
//!   Available ⇄ Preparing ──► Charging ──► Finishing ──► Available
//!   Available ──► Charging (device starts directly)
//!   any ──► Faulted ──► Available (explicit recovery only)
//!   any ──► Unavailable ──► Available (explicit availability only)
//! ```

use serde::{Deserialize, Serialize};

use super::model::ConnectorStatus;
use ConnectorStatus::*;

/// Inputs that can move a connector between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorEvent {
    /// StatusNotification from the device
    StatusReported(ConnectorStatus),
    /// Operator RemoteStartTransaction accepted
    AuthorizationStarted,
    /// StartTransaction rejected by the authorizer
    AuthorizationCancelled,
    /// StartTransaction accepted
    TransactionStarted,
    /// StopTransaction processed
    TransactionStopped,
    /// Operator ChangeAvailability(Inoperative) accepted
    MadeUnavailable,
    /// BootNotification accepted (connector has no open transaction)
    BootAccepted,
}

/// Result of feeding an event to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed {
        from: ConnectorStatus,
        to: ConnectorStatus,
    },
    Unchanged(ConnectorStatus),
    Rejected {
        from: ConnectorStatus,
        event: ConnectorEvent,
    },
}

impl Transition {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }

    /// Status after the transition.
    pub fn status(&self) -> ConnectorStatus {
        match *self {
            Self::Changed { to, .. } => to,
            Self::Unchanged(s) => s,
            Self::Rejected { from, .. } => from,
        }
    }
}

/// Compute the next status for `current` given `event`.
pub fn next_status(current: ConnectorStatus, event: ConnectorEvent) -> Transition {
    let target = match (current, event) {
        (_, ConnectorEvent::StatusReported(reported)) => return reported_status(current, reported),

        (Available, ConnectorEvent::AuthorizationStarted) => Preparing,
        (Preparing, ConnectorEvent::AuthorizationStarted) => Preparing,

        (Preparing, ConnectorEvent::AuthorizationCancelled) => Available,
        (Available, ConnectorEvent::AuthorizationCancelled) => Available,

        (Available | Preparing | Finishing | Charging, ConnectorEvent::TransactionStarted) => {
            Charging
        }

        (Charging | Preparing | Finishing, ConnectorEvent::TransactionStopped) => Finishing,

        (Faulted, ConnectorEvent::MadeUnavailable) => return rejected(current, event),
        (_, ConnectorEvent::MadeUnavailable) => Unavailable,

        (Faulted, ConnectorEvent::BootAccepted) => return rejected(current, event),
        (_, ConnectorEvent::BootAccepted) => Available,

        _ => return rejected(current, event),
    };

    settle(current, target)
}

fn reported_status(current: ConnectorStatus, reported: ConnectorStatus) -> Transition {
    if reported == current {
        return Transition::Unchanged(current);
    }

    let allowed = match (current, reported) {
        (_, Faulted) => true,
        (Faulted, to) => to == Available,
        (Unavailable, to) => to == Available,
        _ => true,
    };

    if allowed {
        settle(current, reported)
    } else {
        rejected(current, ConnectorEvent::StatusReported(reported))
    }
}

fn settle(from: ConnectorStatus, to: ConnectorStatus) -> Transition {
    if from == to {
        Transition::Unchanged(from)
    } else {
        Transition::Changed { from, to }
    }
}

fn rejected(from: ConnectorStatus, event: ConnectorEvent) -> Transition {
    Transition::Rejected { from, event }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(from: ConnectorStatus, to: ConnectorStatus) -> Transition {
        Transition::Changed { from, to }
    }

    #[test]
    fn authorization_cycle() {
        assert_eq!(
            next_status(Available, ConnectorEvent::AuthorizationStarted),
            changed(Available, Preparing)
        );
        assert_eq!(
            next_status(Preparing, ConnectorEvent::AuthorizationCancelled),
            changed(Preparing, Available)
        );
        assert!(matches!(
            next_status(Charging, ConnectorEvent::AuthorizationStarted),
            Transition::Rejected { .. }
        ));
    }

    #[test]
    fn charging_lifecycle() {
        assert_eq!(
            next_status(Preparing, ConnectorEvent::TransactionStarted),
            changed(Preparing, Charging)
        );
        assert_eq!(
            next_status(Available, ConnectorEvent::TransactionStarted),
            changed(Available, Charging)
        );
        assert_eq!(
            next_status(Charging, ConnectorEvent::TransactionStopped),
            changed(Charging, Finishing)
        );
        assert_eq!(
            next_status(Finishing, ConnectorEvent::StatusReported(Available)),
            changed(Finishing, Available)
        );
    }

    #[test]
    fn same_status_report_is_idempotent() {
        let t = next_status(Charging, ConnectorEvent::StatusReported(Charging));
        assert_eq!(t, Transition::Unchanged(Charging));
        assert!(!t.is_changed());
    }

    #[test]
    fn fault_from_anywhere_and_explicit_recovery_only() {
        for from in [Available, Preparing, Charging, Finishing, Unavailable] {
            assert_eq!(
                next_status(from, ConnectorEvent::StatusReported(Faulted)),
                changed(from, Faulted)
            );
        }
        assert!(matches!(
            next_status(Faulted, ConnectorEvent::StatusReported(Charging)),
            Transition::Rejected { .. }
        ));
        assert!(matches!(
            next_status(Faulted, ConnectorEvent::BootAccepted),
            Transition::Rejected { .. }
        ));
        assert_eq!(
            next_status(Faulted, ConnectorEvent::StatusReported(Available)),
            changed(Faulted, Available)
        );
    }

    #[test]
    fn unavailable_is_sticky() {
        assert_eq!(
            next_status(Charging, ConnectorEvent::MadeUnavailable),
            changed(Charging, Unavailable)
        );
        let rejected = next_status(Unavailable, ConnectorEvent::StatusReported(Preparing));
        assert!(matches!(rejected, Transition::Rejected { .. }));
        assert_eq!(rejected.status(), Unavailable);
        assert_eq!(
            next_status(Unavailable, ConnectorEvent::StatusReported(Available)),
            changed(Unavailable, Available)
        );
    }

    #[test]
    fn boot_makes_connectors_available() {
        assert_eq!(
            next_status(Unavailable, ConnectorEvent::BootAccepted),
            changed(Unavailable, Available)
        );
        assert_eq!(
            next_status(Available, ConnectorEvent::BootAccepted),
            Transition::Unchanged(Available)
        );
    }
}
