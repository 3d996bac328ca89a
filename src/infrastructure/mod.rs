//! Infrastructure layer - collaborator adapters

pub mod memory;

pub use memory::{
    AllowListAuthorizer, ConfigStationDirectory, FlatTariffProvider, LogBillingSink,
    RecordingBillingSink,
};
