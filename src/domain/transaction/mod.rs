pub mod model;

pub use model::{StopOutcome, TariffSnapshot, Transaction, TransactionStatus};
