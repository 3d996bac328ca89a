//! Domain errors

use thiserror::Error;

use super::transaction::TransactionStatus;

/// Domain-level error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("Transaction not found: {0}")]
    TransactionNotFound(i32),

    #[error("Connector {connector_id} already has open transaction {transaction_id}")]
    ConnectorBusy {
        connector_id: u32,
        transaction_id: i32,
    },

    #[error("Transaction id {0} is already in use")]
    DuplicateTransaction(i32),

    /// Every positive transaction id has been handed out
    #[error("Transaction id space exhausted")]
    TransactionIdsExhausted,

    #[error("Transaction {transaction_id} is {status}; cannot {operation}")]
    InvalidTransactionState {
        transaction_id: i32,
        status: TransactionStatus,
        operation: &'static str,
    },

    #[error(
        "Meter reading {reported} Wh is below last accepted {last} Wh (transaction {transaction_id})"
    )]
    NonMonotonicMeter {
        transaction_id: i32,
        last: f64,
        reported: f64,
    },

    /// NaN or infinite register value
    #[error("Meter reading {reported} is not a finite number (transaction {transaction_id})")]
    InvalidMeter { transaction_id: i32, reported: f64 },

    #[error("Collaborator failure: {0}")]
    Collaborator(String),
}

/// Result type for domain operations
pub type DomainResult<T> = Result<T, DomainError>;
