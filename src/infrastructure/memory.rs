//! In-memory collaborator implementations
//!
//! Back the default binary (populated from the config file) and the tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::info;

use crate::domain::{
    AuthorizationDecision, Authorizer, BillingSink, ConnectorRef, ConnectorSpec, DomainResult,
    StationDirectory, StationProfile, TariffProvider, TariffSnapshot, Transaction,
};

/// Station directory backed by a fixed set of profiles
#[derive(Default)]
pub struct ConfigStationDirectory {
    stations: DashMap<String, StationProfile>,
}

impl ConfigStationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_station(self, charge_point_id: &str, connectors: Vec<ConnectorSpec>) -> Self {
        self.insert(StationProfile {
            charge_point_id: charge_point_id.to_string(),
            connectors,
        });
        self
    }

    pub fn insert(&self, profile: StationProfile) {
        self.stations.insert(profile.charge_point_id.clone(), profile);
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

#[async_trait]
impl StationDirectory for ConfigStationDirectory {
    async fn lookup_station(&self, charge_point_id: &str) -> DomainResult<Option<StationProfile>> {
        Ok(self.stations.get(charge_point_id).map(|p| p.clone()))
    }
}

/// Accepts id tags on an allow list, or every tag when `accept_all` is set
pub struct AllowListAuthorizer {
    accept_all: bool,
    id_tags: HashSet<String>,
}

impl AllowListAuthorizer {
    pub fn new(accept_all: bool, id_tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            accept_all,
            id_tags: id_tags.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authorizer for AllowListAuthorizer {
    async fn validate_authorization(&self, id_tag: &str) -> DomainResult<AuthorizationDecision> {
        if self.accept_all || self.id_tags.contains(id_tag) {
            Ok(AuthorizationDecision::Accepted)
        } else {
            Ok(AuthorizationDecision::Invalid)
        }
    }
}

/// One price per kWh for every connector
pub struct FlatTariffProvider {
    snapshot: Option<TariffSnapshot>,
}

impl FlatTariffProvider {
    pub fn new(price_per_kwh: Decimal, currency: impl Into<String>) -> Self {
        Self {
            snapshot: Some(TariffSnapshot {
                price_per_kwh,
                currency: currency.into(),
            }),
        }
    }

    /// No tariff; transactions carry no cost.
    pub fn none() -> Self {
        Self { snapshot: None }
    }
}

#[async_trait]
impl TariffProvider for FlatTariffProvider {
    async fn price_for_connector(
        &self,
        _connector: &ConnectorRef,
        _at: DateTime<Utc>,
    ) -> DomainResult<Option<TariffSnapshot>> {
        Ok(self.snapshot.clone())
    }
}

/// Writes each closed transaction to the log
#[derive(Default)]
pub struct LogBillingSink;

#[async_trait]
impl BillingSink for LogBillingSink {
    async fn on_transaction_closed(&self, transaction: &Transaction) -> DomainResult<()> {
        info!(
            charge_point_id = transaction.charge_point_id.as_str(),
            transaction_id = transaction.id,
            id_tag = transaction.id_tag.as_str(),
            energy_kwh = transaction.energy_kwh,
            cost = ?transaction.cost,
            currency = ?transaction.tariff.as_ref().map(|t| t.currency.as_str()),
            "Billing record"
        );
        Ok(())
    }
}

/// Keeps every closed transaction it receives
#[derive(Default)]
pub struct RecordingBillingSink {
    closed: Mutex<Vec<Transaction>>,
}

impl RecordingBillingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed(&self) -> Vec<Transaction> {
        self.closed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl BillingSink for RecordingBillingSink {
    async fn on_transaction_closed(&self, transaction: &Transaction) -> DomainResult<()> {
        let mut closed = self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        closed.push(transaction.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn directory_returns_known_stations_only() {
        let directory = ConfigStationDirectory::new().with_station(
            "CP001",
            vec![ConnectorSpec {
                connector_id: 1,
                connector_type: None,
                max_power_kw: None,
            }],
        );
        let profile = directory.lookup_station("CP001").await.unwrap().unwrap();
        assert_eq!(profile.connectors.len(), 1);
        assert!(directory.lookup_station("CP002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn allow_list_and_accept_all() {
        let strict = AllowListAuthorizer::new(false, vec!["TAG-001".to_string()]);
        assert_eq!(
            strict.validate_authorization("TAG-001").await.unwrap(),
            AuthorizationDecision::Accepted
        );
        assert_eq!(
            strict.validate_authorization("TAG-002").await.unwrap(),
            AuthorizationDecision::Invalid
        );

        let open = AllowListAuthorizer::new(true, Vec::new());
        assert!(open.validate_authorization("anything").await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn flat_tariff_ignores_connector() {
        let tariff = FlatTariffProvider::new(Decimal::from_str("0.30").unwrap(), "EUR");
        let connector = ConnectorRef {
            charge_point_id: "CP001".into(),
            connector_id: 2,
        };
        let snapshot = tariff.price_for_connector(&connector, Utc::now()).await.unwrap().unwrap();
        assert_eq!(snapshot.currency, "EUR");
        assert!(FlatTariffProvider::none()
            .price_for_connector(&connector, Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
