//! Transaction domain entity

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, DomainResult};

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Reserved while the id tag is being authorized
    Pending,
    /// Charging session in progress
    Active,
    /// Stop in progress, or session lost and waiting out the grace window
    Closing,
    /// Final
    Closed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// Price in force when the transaction started. Display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffSnapshot {
    pub price_per_kwh: Decimal,
    pub currency: String,
}

impl TariffSnapshot {
    pub fn cost_for(&self, energy_kwh: f64) -> Option<Decimal> {
        Decimal::from_f64(energy_kwh).map(|kwh| (self.price_per_kwh * kwh).round_dp(2))
    }
}

/// Final figures of a closed transaction, kept so repeated stops return the
/// same answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopOutcome {
    pub transaction_id: i32,
    pub meter_stop: f64,
    pub energy_kwh: f64,
    pub duration_secs: i64,
    pub stopped_at: DateTime<Utc>,
    pub stop_reason: Option<String>,
    pub cost: Option<Decimal>,
}

/// Charging transaction. Meter values are in Wh.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i32,
    pub charge_point_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: f64,
    /// Last accepted reading
    pub current_meter: f64,
    /// `(current_meter - meter_start) / 1000`
    pub energy_kwh: f64,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub tariff: Option<TariffSnapshot>,
    pub cost: Option<Decimal>,
    pub current_power_w: Option<f64>,
    pub current_soc: Option<f64>,
    pub last_meter_update: Option<DateTime<Utc>>,
    /// Set while `Closing` after session loss
    pub grace_deadline: Option<DateTime<Utc>>,
    pub outcome: Option<StopOutcome>,
}

impl Transaction {
    /// New transaction awaiting authorization. The start meter must be a
    /// finite reading.
    pub fn pending(
        id: i32,
        charge_point_id: impl Into<String>,
        connector_id: u32,
        id_tag: impl Into<String>,
        meter_start: f64,
        started_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if !meter_start.is_finite() {
            return Err(DomainError::InvalidMeter {
                transaction_id: id,
                reported: meter_start,
            });
        }
        Ok(Self {
            id,
            charge_point_id: charge_point_id.into(),
            connector_id,
            id_tag: id_tag.into(),
            meter_start,
            current_meter: meter_start,
            energy_kwh: 0.0,
            status: TransactionStatus::Pending,
            started_at,
            stopped_at: None,
            stop_reason: None,
            tariff: None,
            cost: None,
            current_power_w: None,
            current_soc: None,
            last_meter_update: None,
            grace_deadline: None,
            outcome: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status != TransactionStatus::Closed
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Pending → Active once the id tag is accepted.
    pub fn activate(&mut self, tariff: Option<TariffSnapshot>) -> DomainResult<()> {
        if self.status != TransactionStatus::Pending {
            return Err(self.invalid_state("activate"));
        }
        self.status = TransactionStatus::Active;
        self.tariff = tariff;
        self.cost = self.tariff.as_ref().and_then(|t| t.cost_for(0.0));
        Ok(())
    }

    /// Accept a new energy register reading (Wh). Non-finite readings and
    /// readings below the last accepted value are rejected and leave the
    /// transaction untouched.
    pub fn record_meter(&mut self, reading_wh: f64, at: DateTime<Utc>) -> DomainResult<()> {
        if !matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::Closing
        ) {
            return Err(self.invalid_state("record meter values"));
        }
        if !reading_wh.is_finite() {
            return Err(DomainError::InvalidMeter {
                transaction_id: self.id,
                reported: reading_wh,
            });
        }
        if reading_wh < self.current_meter {
            return Err(DomainError::NonMonotonicMeter {
                transaction_id: self.id,
                last: self.current_meter,
                reported: reading_wh,
            });
        }

        self.current_meter = reading_wh;
        self.recompute_energy();
        self.last_meter_update = Some(at);
        Ok(())
    }

    /// Record non-accruing samples (power, state of charge).
    pub fn record_samples(&mut self, power_w: Option<f64>, soc: Option<f64>, at: DateTime<Utc>) {
        if power_w.is_some() {
            self.current_power_w = power_w;
        }
        if soc.is_some() {
            self.current_soc = soc;
        }
        self.last_meter_update = Some(at);
    }

    /// Active → Closing. A second call keeps the earliest deadline.
    pub fn begin_closing(&mut self, grace_deadline: Option<DateTime<Utc>>) -> DomainResult<()> {
        match self.status {
            TransactionStatus::Active => {
                self.status = TransactionStatus::Closing;
                self.grace_deadline = grace_deadline;
                Ok(())
            }
            TransactionStatus::Closing => {
                if self.grace_deadline.is_none() {
                    self.grace_deadline = grace_deadline;
                }
                Ok(())
            }
            _ => Err(self.invalid_state("begin closing")),
        }
    }

    /// Close the transaction. A final meter below the last accepted reading,
    /// or one that is not finite, is replaced by that reading. Closing twice
    /// returns the first outcome.
    pub fn close(
        &mut self,
        final_meter: f64,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> DomainResult<StopOutcome> {
        match self.status {
            TransactionStatus::Closed => {
                return self
                    .outcome
                    .clone()
                    .ok_or_else(|| self.invalid_state("close"));
            }
            TransactionStatus::Pending => return Err(self.invalid_state("close")),
            TransactionStatus::Active => self.status = TransactionStatus::Closing,
            TransactionStatus::Closing => {}
        }

        if final_meter.is_finite() && final_meter > self.current_meter {
            self.current_meter = final_meter;
        }
        self.recompute_energy();

        self.status = TransactionStatus::Closed;
        self.stopped_at = Some(at);
        self.stop_reason = reason;
        self.grace_deadline = None;

        let outcome = StopOutcome {
            transaction_id: self.id,
            meter_stop: self.current_meter,
            energy_kwh: self.energy_kwh,
            duration_secs: (at - self.started_at).num_seconds().max(0),
            stopped_at: at,
            stop_reason: self.stop_reason.clone(),
            cost: self.cost,
        };
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    fn recompute_energy(&mut self) {
        self.energy_kwh = (self.current_meter - self.meter_start) / 1000.0;
        if let Some(tariff) = &self.tariff {
            self.cost = tariff.cost_for(self.energy_kwh);
        }
    }

    fn invalid_state(&self, operation: &'static str) -> DomainError {
        DomainError::InvalidTransactionState {
            transaction_id: self.id,
            status: self.status,
            operation,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    fn active_tx() -> Transaction {
        let mut tx = Transaction::pending(501, "CP001", 1, "TAG-001", 1000.0, Utc::now()).unwrap();
        tx.activate(None).unwrap();
        tx
    }

    #[test]
    fn pending_then_active() {
        let mut tx = Transaction::pending(1, "CP001", 1, "TAG", 0.0, Utc::now()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.is_open());
        tx.activate(None).unwrap();
        assert!(tx.is_active());
        assert!(tx.activate(None).is_err());
    }

    #[test]
    fn meter_accrues_energy() {
        let mut tx = active_tx();
        tx.record_meter(1020.0, Utc::now()).unwrap();
        tx.record_meter(1052.0, Utc::now()).unwrap();
        assert_eq!(tx.current_meter, 1052.0);
        assert!((tx.energy_kwh - 0.052).abs() < 1e-9);
    }

    #[test]
    fn lower_meter_is_rejected_and_state_kept() {
        let mut tx = active_tx();
        tx.record_meter(1100.0, Utc::now()).unwrap();
        let err = tx.record_meter(1050.0, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::NonMonotonicMeter { .. }));
        assert_eq!(tx.current_meter, 1100.0);
        assert!((tx.energy_kwh - 0.1).abs() < 1e-9);
    }

    #[test]
    fn non_finite_readings_are_rejected() {
        let mut tx = active_tx();
        tx.record_meter(1100.0, Utc::now()).unwrap();
        for reading in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = tx.record_meter(reading, Utc::now()).unwrap_err();
            assert!(matches!(err, DomainError::InvalidMeter { transaction_id: 501, .. }));
        }
        assert_eq!(tx.current_meter, 1100.0);
        assert!((tx.energy_kwh - 0.1).abs() < 1e-9);

        // Monotonicity still holds against the last finite reading.
        assert!(tx.record_meter(1050.0, Utc::now()).is_err());
        let outcome = tx.close(f64::NAN, Utc::now(), None).unwrap();
        assert_eq!(outcome.meter_stop, 1100.0);
        assert!(outcome.energy_kwh >= 0.0);
    }

    #[test]
    fn non_finite_start_meter_is_rejected() {
        let err = Transaction::pending(9, "CP001", 1, "TAG", f64::NAN, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidMeter { transaction_id: 9, .. }));
        assert!(Transaction::pending(9, "CP001", 1, "TAG", f64::INFINITY, Utc::now()).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let mut tx = active_tx();
        let at = tx.started_at + Duration::seconds(90);
        let first = tx.close(1052.0, at, Some("Remote".into())).unwrap();
        assert_eq!(tx.status, TransactionStatus::Closed);
        assert_eq!(first.duration_secs, 90);

        let second = tx
            .close(2000.0, at + Duration::seconds(5), None)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(tx.current_meter, 1052.0);
    }

    #[test]
    fn close_with_lower_final_meter_uses_last_reading() {
        let mut tx = active_tx();
        tx.record_meter(1040.0, Utc::now()).unwrap();
        let outcome = tx.close(1010.0, Utc::now(), None).unwrap();
        assert_eq!(outcome.meter_stop, 1040.0);
        assert!((outcome.energy_kwh - 0.04).abs() < 1e-9);
    }

    #[test]
    fn closing_keeps_first_deadline_and_accepts_meters() {
        let mut tx = active_tx();
        let deadline = Utc::now() + Duration::minutes(5);
        tx.begin_closing(Some(deadline)).unwrap();
        tx.begin_closing(Some(deadline + Duration::minutes(1))).unwrap();
        assert_eq!(tx.grace_deadline, Some(deadline));
        tx.record_meter(1200.0, Utc::now()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Closing);
    }

    #[test]
    fn pending_cannot_close() {
        let mut tx = Transaction::pending(1, "CP001", 1, "TAG", 0.0, Utc::now()).unwrap();
        assert!(matches!(
            tx.close(10.0, Utc::now(), None),
            Err(DomainError::InvalidTransactionState { .. })
        ));
    }

    #[test]
    fn cost_follows_tariff_snapshot() {
        let mut tx = Transaction::pending(7, "CP001", 1, "TAG", 0.0, Utc::now()).unwrap();
        tx.activate(Some(TariffSnapshot {
            price_per_kwh: Decimal::from_str("0.30").unwrap(),
            currency: "EUR".into(),
        }))
        .unwrap();
        tx.record_meter(10_000.0, Utc::now()).unwrap();
        assert_eq!(tx.cost, Some(Decimal::from_str("3.00").unwrap()));
    }
}
