//! Transport interfaces

pub mod ws;
