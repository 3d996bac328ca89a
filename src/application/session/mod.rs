//! Live device sessions
//!
//! - [`SessionRegistry`]: identity → live [`Session`], one per identity.
//! - [`PendingCalls`]: per-session table of operator Calls awaiting a reply.

pub mod connection;
pub mod pending;
pub mod registry;

pub use connection::{liveness_threshold_secs, Outbound, Session, SessionEnd};
pub use pending::{CallOutcome, PendingCalls};
pub use registry::{Registration, SessionHandle, SessionRegistry, SharedSessionRegistry};
