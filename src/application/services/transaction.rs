//! Transaction lifecycle and meter accrual
//!
//! Open transactions are indexed by `(charge point, connector)` so the
//! one-open-transaction-per-connector invariant is checked and reserved under
//! a single shard lock. Collaborator calls (authorization, tariff, billing)
//! happen with no lock held.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::application::events::{
    Event, MeterValuesEvent, SharedEventBus, TransactionClosedEvent, TransactionStartedEvent,
};
use crate::domain::{
    AuthorizationDecision, Authorizer, BillingSink, ConnectorRef, DomainError, DomainResult,
    StopOutcome, TariffProvider, Transaction, TransactionStatus,
};

/// Stop reason recorded when the grace window runs out
pub const GRACE_EXPIRED_REASON: &str = "SessionLost";

#[derive(Debug, Clone)]
pub struct TransactionSettings {
    /// How long an abandoned transaction waits for the device to come back
    pub grace_window: Duration,
    pub first_transaction_id: i32,
    /// How long a closed transaction stays queryable and answers repeated
    /// stops before it is pruned
    pub closed_retention: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(300),
            first_transaction_id: 1,
            closed_retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    /// Wh
    pub meter_start: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted { transaction_id: i32 },
    Rejected { decision: AuthorizationDecision },
}

/// One MeterValues report, already reduced to the sampled quantities the
/// engine tracks.
#[derive(Debug, Clone, Default)]
pub struct MeterReport {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: Option<i32>,
    /// Energy.Active.Import.Register in Wh
    pub energy_wh: Option<f64>,
    pub power_w: Option<f64>,
    pub soc: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StopRequest {
    pub charge_point_id: String,
    pub transaction_id: i32,
    /// Wh
    pub meter_stop: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopResult {
    pub outcome: StopOutcome,
    pub connector_id: u32,
    /// `false` when the transaction was already closed
    pub newly_closed: bool,
}

pub struct TransactionManager {
    transactions: DashMap<i32, Transaction>,
    open_by_connector: DashMap<(String, u32), i32>,
    /// Next id to hand out; one past `i32::MAX` once exhausted
    next_id: AtomicI64,
    authorizer: Arc<dyn Authorizer>,
    tariffs: Arc<dyn TariffProvider>,
    billing: Arc<dyn BillingSink>,
    event_bus: SharedEventBus,
    grace_window: Duration,
    closed_retention: Duration,
}

/// Holds a connector reservation made by [`TransactionManager::start`].
/// Dropped armed (rejection, or the start future cancelled mid-await), it
/// releases the reservation and the pending record.
struct Reservation<'a> {
    manager: &'a TransactionManager,
    key: (String, u32),
    transaction_id: i32,
    armed: bool,
}

impl Reservation<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.transaction_id;
        self.manager.open_by_connector.remove_if(&self.key, |_, open| *open == id);
        self.manager
            .transactions
            .remove_if(&id, |_, tx| tx.status == TransactionStatus::Pending);
    }
}

impl TransactionManager {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        tariffs: Arc<dyn TariffProvider>,
        billing: Arc<dyn BillingSink>,
        event_bus: SharedEventBus,
        settings: TransactionSettings,
    ) -> Self {
        Self {
            transactions: DashMap::new(),
            open_by_connector: DashMap::new(),
            next_id: AtomicI64::new(i64::from(settings.first_transaction_id)),
            authorizer,
            tariffs,
            billing,
            event_bus,
            grace_window: settings.grace_window,
            closed_retention: settings.closed_retention,
        }
    }

    fn allocate_id(&self) -> DomainResult<i32> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next <= i64::from(i32::MAX)).then_some(next + 1)
            })
            .ok()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(DomainError::TransactionIdsExhausted)
    }

    /// Ask the authorization collaborator about an id tag. Collaborator
    /// failures count as `Invalid`.
    pub async fn authorize(&self, id_tag: &str) -> AuthorizationDecision {
        match self.authorizer.validate_authorization(id_tag).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(id_tag, error = %e, "Authorization lookup failed");
                AuthorizationDecision::Invalid
            }
        }
    }

    /// Start a transaction on a connector.
    ///
    /// Fails with [`DomainError::ConnectorBusy`] when the connector already
    /// has an open transaction; nothing is mutated in that case. A start
    /// identical to the connector's open transaction (same id tag, start
    /// meter and timestamp) is a retransmission and gets that transaction's
    /// id back.
    pub async fn start(&self, req: StartRequest) -> DomainResult<StartOutcome> {
        let key = (req.charge_point_id.clone(), req.connector_id);

        let transaction_id = match self.open_by_connector.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let open_id = *existing.get();
                if self.is_retransmission(open_id, &req) {
                    info!(
                        charge_point_id = req.charge_point_id.as_str(),
                        connector_id = req.connector_id,
                        transaction_id = open_id,
                        "Repeated start for an open transaction"
                    );
                    return Ok(StartOutcome::Accepted {
                        transaction_id: open_id,
                    });
                }
                return Err(DomainError::ConnectorBusy {
                    connector_id: req.connector_id,
                    transaction_id: open_id,
                });
            }
            Entry::Vacant(slot) => {
                let id = self.allocate_id()?;
                let pending = Transaction::pending(
                    id,
                    req.charge_point_id.as_str(),
                    req.connector_id,
                    req.id_tag.as_str(),
                    req.meter_start,
                    req.timestamp,
                )?;
                match self.transactions.entry(id) {
                    Entry::Occupied(_) => return Err(DomainError::DuplicateTransaction(id)),
                    Entry::Vacant(record) => {
                        record.insert(pending);
                    }
                }
                slot.insert(id);
                id
            }
        };
        let reservation = Reservation {
            manager: self,
            key,
            transaction_id,
            armed: true,
        };

        let decision = self.authorize(&req.id_tag).await;
        if !decision.is_accepted() {
            drop(reservation);
            info!(
                charge_point_id = req.charge_point_id.as_str(),
                connector_id = req.connector_id,
                id_tag = req.id_tag.as_str(),
                ?decision,
                "Transaction start rejected"
            );
            return Ok(StartOutcome::Rejected { decision });
        }

        let connector = ConnectorRef {
            charge_point_id: req.charge_point_id.clone(),
            connector_id: req.connector_id,
        };
        let tariff = match self.tariffs.price_for_connector(&connector, req.timestamp).await {
            Ok(tariff) => tariff,
            Err(e) => {
                warn!(
                    charge_point_id = req.charge_point_id.as_str(),
                    connector_id = req.connector_id,
                    error = %e,
                    "Tariff lookup failed, transaction runs without a price"
                );
                None
            }
        };

        {
            let mut tx = self
                .transactions
                .get_mut(&transaction_id)
                .ok_or(DomainError::TransactionNotFound(transaction_id))?;
            tx.activate(tariff)?;
        }
        reservation.keep();

        info!(
            charge_point_id = req.charge_point_id.as_str(),
            connector_id = req.connector_id,
            transaction_id,
            id_tag = req.id_tag.as_str(),
            meter_start = req.meter_start,
            "Transaction started"
        );

        self.event_bus
            .publish(Event::TransactionStarted(TransactionStartedEvent {
                charge_point_id: req.charge_point_id,
                connector_id: req.connector_id,
                transaction_id,
                id_tag: req.id_tag,
                meter_start: req.meter_start,
                timestamp: req.timestamp,
            }));

        Ok(StartOutcome::Accepted { transaction_id })
    }

    /// Apply a meter report. Returns the transaction it was applied to, or
    /// `None` when the report belongs to no open transaction.
    pub fn record_meter(&self, report: MeterReport) -> DomainResult<Option<i32>> {
        let transaction_id = match report.transaction_id {
            Some(id) => Some(id),
            None => self.open_for_connector(&report.charge_point_id, report.connector_id),
        };
        let Some(transaction_id) = transaction_id else {
            debug!(
                charge_point_id = report.charge_point_id.as_str(),
                connector_id = report.connector_id,
                "Meter values outside a transaction"
            );
            return Ok(None);
        };

        let (energy_kwh, cost) = {
            let mut tx = self
                .transactions
                .get_mut(&transaction_id)
                .filter(|tx| tx.charge_point_id == report.charge_point_id)
                .ok_or(DomainError::TransactionNotFound(transaction_id))?;

            if let Some(reading) = report.energy_wh {
                tx.record_meter(reading, report.timestamp)?;
            }
            tx.record_samples(report.power_w, report.soc, report.timestamp);
            (tx.energy_kwh, tx.cost)
        };

        debug!(
            charge_point_id = report.charge_point_id.as_str(),
            transaction_id,
            energy_kwh,
            "Meter values recorded"
        );

        self.event_bus
            .publish(Event::MeterValuesReceived(MeterValuesEvent {
                charge_point_id: report.charge_point_id,
                connector_id: report.connector_id,
                transaction_id: Some(transaction_id),
                energy_wh: report.energy_wh,
                energy_kwh: Some(energy_kwh),
                power_w: report.power_w,
                soc: report.soc,
                cost,
                timestamp: report.timestamp,
            }));

        Ok(Some(transaction_id))
    }

    /// Close a transaction with the device's final meter. Repeating a stop
    /// returns the first outcome and has no side effects.
    pub async fn stop(&self, req: StopRequest) -> DomainResult<StopResult> {
        let (outcome, snapshot) = {
            let mut tx = self
                .transactions
                .get_mut(&req.transaction_id)
                .filter(|tx| tx.charge_point_id == req.charge_point_id)
                .ok_or(DomainError::TransactionNotFound(req.transaction_id))?;

            if !tx.is_open() {
                let outcome = tx.close(req.meter_stop, req.timestamp, req.reason.clone())?;
                debug!(
                    charge_point_id = req.charge_point_id.as_str(),
                    transaction_id = req.transaction_id,
                    "Repeated stop for a closed transaction"
                );
                return Ok(StopResult {
                    outcome,
                    connector_id: tx.connector_id,
                    newly_closed: false,
                });
            }

            if req.meter_stop < tx.current_meter {
                warn!(
                    charge_point_id = req.charge_point_id.as_str(),
                    transaction_id = req.transaction_id,
                    meter_stop = req.meter_stop,
                    last_meter = tx.current_meter,
                    "Final meter below last accepted reading, using last reading"
                );
            }
            let outcome = tx.close(req.meter_stop, req.timestamp, req.reason.clone())?;
            (outcome, tx.clone())
        };

        let connector_id = snapshot.connector_id;
        self.finalize(snapshot, &outcome, "stop").await;

        Ok(StopResult {
            outcome,
            connector_id,
            newly_closed: true,
        })
    }

    /// Move the station's active transactions to `Closing` after session loss
    /// and arm a grace timer for each. Returns the affected ids.
    pub fn abandon(self: &Arc<Self>, charge_point_id: &str) -> Vec<i32> {
        let grace = chrono::Duration::from_std(self.grace_window).unwrap_or(chrono::Duration::zero());
        let deadline = Utc::now() + grace;

        let candidates: Vec<i32> = self
            .transactions
            .iter()
            .filter(|tx| tx.charge_point_id == charge_point_id && tx.is_active())
            .map(|tx| tx.id)
            .collect();

        let mut abandoned = Vec::new();
        for id in candidates {
            let Some(mut tx) = self.transactions.get_mut(&id) else {
                continue;
            };
            match tx.begin_closing(Some(deadline)) {
                Ok(()) => abandoned.push(id),
                Err(e) => debug!(transaction_id = id, error = %e, "Transaction not abandoned"),
            }
        }

        for &transaction_id in &abandoned {
            warn!(
                charge_point_id,
                transaction_id,
                grace_secs = self.grace_window.as_secs(),
                "Session lost with active transaction, waiting for device"
            );
            let manager = Arc::clone(self);
            let window = self.grace_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                manager.force_close(transaction_id, Utc::now()).await;
            });
        }

        abandoned
    }

    /// Close an abandoned transaction with its last known meter. No-op unless
    /// the transaction is still waiting out its grace window.
    pub async fn force_close(&self, transaction_id: i32, at: DateTime<Utc>) -> Option<StopOutcome> {
        let (outcome, snapshot) = {
            let mut tx = self.transactions.get_mut(&transaction_id)?;
            if !(tx.is_open() && tx.grace_deadline.is_some()) {
                return None;
            }
            let last_meter = tx.current_meter;
            let outcome = match tx.close(last_meter, at, Some(GRACE_EXPIRED_REASON.to_string())) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(transaction_id, error = %e, "Forced close failed");
                    return None;
                }
            };
            (outcome, tx.clone())
        };

        warn!(
            charge_point_id = snapshot.charge_point_id.as_str(),
            transaction_id,
            energy_kwh = outcome.energy_kwh,
            "Grace window expired, transaction force-closed"
        );
        self.finalize(snapshot, &outcome, "grace_expired").await;
        Some(outcome)
    }

    /// Release the connector, hand the transaction to billing and publish
    /// the closure. Runs once per transaction.
    async fn finalize(&self, transaction: Transaction, outcome: &StopOutcome, trigger: &'static str) {
        self.open_by_connector.remove_if(
            &(transaction.charge_point_id.clone(), transaction.connector_id),
            |_, id| *id == transaction.id,
        );

        info!(
            charge_point_id = transaction.charge_point_id.as_str(),
            connector_id = transaction.connector_id,
            transaction_id = transaction.id,
            energy_kwh = outcome.energy_kwh,
            duration_secs = outcome.duration_secs,
            "Transaction closed"
        );

        // The hand-off runs on its own task so a cancelled caller cannot
        // lose the billing record or the closure event.
        let billing = self.billing.clone();
        let event_bus = self.event_bus.clone();
        let outcome = outcome.clone();
        let transaction_id = transaction.id;
        let handoff = tokio::spawn(async move {
            if let Err(e) = billing.on_transaction_closed(&transaction).await {
                error!(
                    transaction_id = transaction.id,
                    error = %e,
                    "Billing sink rejected closed transaction"
                );
            }
            metrics::counter!("ocpp_transactions_closed_total", "trigger" => trigger).increment(1);

            event_bus.publish(Event::TransactionClosed(TransactionClosedEvent {
                charge_point_id: transaction.charge_point_id,
                connector_id: transaction.connector_id,
                id_tag: transaction.id_tag,
                outcome,
            }));
        });
        if let Err(e) = handoff.await {
            error!(transaction_id, error = %e, "Transaction hand-off task failed");
        }
    }

    pub fn get(&self, transaction_id: i32) -> Option<Transaction> {
        self.transactions.get(&transaction_id).map(|tx| tx.clone())
    }

    pub fn open_for_connector(&self, charge_point_id: &str, connector_id: u32) -> Option<i32> {
        self.open_by_connector
            .get(&(charge_point_id.to_string(), connector_id))
            .map(|id| *id)
    }

    /// Connectors of a station that hold an open transaction.
    pub fn open_connectors(&self, charge_point_id: &str) -> Vec<u32> {
        let mut connectors: Vec<u32> = self
            .open_by_connector
            .iter()
            .filter(|entry| entry.key().0 == charge_point_id)
            .map(|entry| entry.key().1)
            .collect();
        connectors.sort_unstable();
        connectors
    }

    pub fn open_count(&self) -> usize {
        self.open_by_connector.len()
    }

    /// Whether the station has any transaction still open.
    pub fn has_open(&self, charge_point_id: &str) -> bool {
        self.open_by_connector
            .iter()
            .any(|entry| entry.key().0 == charge_point_id)
    }

    /// Drop closed transactions whose retention window has passed. Returns
    /// how many were pruned.
    pub fn prune_closed(&self, now: DateTime<Utc>) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|_, tx| match tx.stopped_at {
            Some(stopped_at) if !tx.is_open() => (now - stopped_at)
                .to_std()
                .map_or(true, |age| age < self.closed_retention),
            _ => true,
        });
        let pruned = before.saturating_sub(self.transactions.len());
        if pruned > 0 {
            debug!(pruned, "Pruned closed transactions");
        }
        pruned
    }

    fn is_retransmission(&self, open_id: i32, req: &StartRequest) -> bool {
        self.transactions.get(&open_id).is_some_and(|tx| {
            tx.is_open()
                && tx.status != TransactionStatus::Pending
                && tx.id_tag == req.id_tag
                && tx.meter_start == req.meter_start
                && tx.started_at == req.timestamp
        })
    }
}
