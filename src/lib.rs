//! # OCPP 1.6 charge-point engine
//!
//! Central-system side of OCPP 1.6-J: accepts charge-point WebSocket
//! sessions, answers their requests, tracks connector and transaction state
//! and sends operator commands to connected devices.
//!
//! ## Architecture
//!
//! - **domain**: charge points, connectors, transactions and collaborator ports
//! - **application**: engine, session registry, inbound handlers, commands, events
//! - **infrastructure**: in-memory collaborator adapters
//! - **interfaces**: WebSocket server
//! - **shared**: OCPP-J framing and shutdown plumbing

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interfaces;
pub mod server;
pub mod shared;

pub use application::{create_event_bus, Collaborators, Engine, EngineSettings, Event, SharedEventBus};
pub use config::{default_config_path, AppConfig, ConfigError};
pub use server::{init_tracing, ServerHandle};
