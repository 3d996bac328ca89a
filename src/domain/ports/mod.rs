//! Collaborator ports consumed by the engine
//!
//! Implementations are injected at startup; the in-memory ones in
//! `infrastructure::memory` back the default binary and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::charge_point::ConnectorSpec;
use super::transaction::{TariffSnapshot, Transaction};
use super::DomainResult;

/// Station layout returned by the directory
#[derive(Debug, Clone, PartialEq)]
pub struct StationProfile {
    pub charge_point_id: String,
    pub connectors: Vec<ConnectorSpec>,
}

/// Outcome of an id tag check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationDecision {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

impl AuthorizationDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Identifies one connector of one station
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectorRef {
    pub charge_point_id: String,
    pub connector_id: u32,
}

/// Known stations and their connector layout.
#[async_trait]
pub trait StationDirectory: Send + Sync {
    /// `None` when the identity is not registered.
    async fn lookup_station(&self, charge_point_id: &str) -> DomainResult<Option<StationProfile>>;
}

/// Id tag validation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn validate_authorization(&self, id_tag: &str) -> DomainResult<AuthorizationDecision>;
}

/// Price lookup for display and cost accrual.
#[async_trait]
pub trait TariffProvider: Send + Sync {
    async fn price_for_connector(
        &self,
        connector: &ConnectorRef,
        at: DateTime<Utc>,
    ) -> DomainResult<Option<TariffSnapshot>>;
}

/// Receives every closed transaction exactly once.
#[async_trait]
pub trait BillingSink: Send + Sync {
    async fn on_transaction_closed(&self, transaction: &Transaction) -> DomainResult<()>;
}
