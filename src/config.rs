//! Application configuration
//!
//! Loaded from a TOML file (default `<config_dir>/ocpp-engine/config.toml`).
//! Every section is optional; missing keys fall back to their defaults.
//! `OCPP_HOST`, `OCPP_PORT` and `OCPP_LOG_LEVEL` override the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::commands::CommandTimeouts;
use crate::application::services::{LivenessConfig, TransactionSettings};
use crate::application::{Collaborators, EngineSettings};
use crate::domain::{ConnectorSpec, StationProfile};
use crate::infrastructure::{
    AllowListAuthorizer, ConfigStationDirectory, FlatTariffProvider, LogBillingSink,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub commands: CommandsConfig,
    pub transactions: TransactionsConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub authorization: AuthorizationConfig,
    pub tariff: TariffConfig,
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on draining sessions after shutdown is triggered
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub liveness_multiplier: u32,
    pub liveness_floor_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            liveness_multiplier: 3,
            liveness_floor_secs: 90,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub default_timeout_secs: u64,
    /// Per-action overrides, keyed by OCPP action name
    pub timeouts: HashMap<String, u64>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            timeouts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionsConfig {
    pub grace_window_secs: u64,
    pub first_transaction_id: i32,
    /// How long closed transactions stay queryable
    pub closed_retention_secs: u64,
    /// How long a disconnected station's connector state is kept
    pub offline_retention_secs: u64,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: 300,
            first_transaction_id: 1,
            closed_retention_secs: 3600,
            offline_retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint; disabled when unset
    pub prometheus_listen: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub accept_all: bool,
    pub id_tags: Vec<String>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            accept_all: true,
            id_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TariffConfig {
    /// Decimal string, e.g. `"0.30"`
    pub price_per_kwh: Option<String>,
    pub currency: String,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            price_per_kwh: None,
            currency: "EUR".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub charge_point_id: String,
    #[serde(default)]
    pub connectors: Vec<ConnectorSpec>,
}

/// `<config_dir>/ocpp-engine/config.toml`, or `./config.toml` when the
/// platform has no config directory.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|dir| dir.join("ocpp-engine"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

impl AppConfig {
    /// Read, parse, apply env overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let mut config = Self::from_toml(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, validated. Used when no file exists.
    pub fn from_defaults<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `OCPP_HOST`, `OCPP_PORT` and `OCPP_LOG_LEVEL` from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OCPP_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("OCPP_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("OCPP_PORT is not a port: {}", port)))?;
        }
        if let Some(level) = lookup("OCPP_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.session.liveness_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "session.liveness_multiplier must be > 0".into(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.commands.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "commands.default_timeout_secs must be > 0".into(),
            ));
        }
        if let Some((action, _)) = self.commands.timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(ConfigError::Invalid(format!(
                "commands.timeouts.{} must be > 0",
                action
            )));
        }
        if self.transactions.closed_retention_secs == 0 {
            return Err(ConfigError::Invalid(
                "transactions.closed_retention_secs must be > 0".into(),
            ));
        }
        if self.transactions.offline_retention_secs == 0 {
            return Err(ConfigError::Invalid(
                "transactions.offline_retention_secs must be > 0".into(),
            ));
        }
        if self.transactions.first_transaction_id <= 0 {
            return Err(ConfigError::Invalid(
                "transactions.first_transaction_id must be positive".into(),
            ));
        }
        if !matches!(self.logging.format.to_lowercase().as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be text or json, got {}",
                self.logging.format
            )));
        }
        self.price_per_kwh()?;

        let mut seen = std::collections::HashSet::new();
        for station in &self.stations {
            if station.charge_point_id.is_empty() {
                return Err(ConfigError::Invalid("station with empty charge_point_id".into()));
            }
            if !seen.insert(station.charge_point_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate station {}",
                    station.charge_point_id
                )));
            }
            if station.connectors.iter().any(|c| c.connector_id == 0) {
                return Err(ConfigError::Invalid(format!(
                    "station {}: connector ids start at 1",
                    station.charge_point_id
                )));
            }
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    fn price_per_kwh(&self) -> Result<Option<Decimal>, ConfigError> {
        self.tariff
            .price_per_kwh
            .as_deref()
            .map(|raw| {
                Decimal::from_str(raw).map_err(|e| {
                    ConfigError::Invalid(format!("tariff.price_per_kwh {:?}: {}", raw, e))
                })
            })
            .transpose()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let command_timeouts = self.commands.timeouts.iter().fold(
            CommandTimeouts::new(Duration::from_secs(self.commands.default_timeout_secs)),
            |timeouts, (action, secs)| {
                timeouts.with_action(action.clone(), Duration::from_secs(*secs))
            },
        );

        EngineSettings {
            heartbeat_interval_secs: self.session.heartbeat_interval_secs,
            liveness_multiplier: self.session.liveness_multiplier,
            liveness_floor_secs: self.session.liveness_floor_secs,
            command_timeouts,
            transactions: TransactionSettings {
                grace_window: Duration::from_secs(self.transactions.grace_window_secs),
                first_transaction_id: self.transactions.first_transaction_id,
                closed_retention: Duration::from_secs(self.transactions.closed_retention_secs),
            },
            offline_retention: Duration::from_secs(self.transactions.offline_retention_secs),
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            sweep_interval: Duration::from_secs(self.session.sweep_interval_secs),
        }
    }

    /// In-memory collaborators populated from the `stations`,
    /// `authorization` and `tariff` sections.
    pub fn collaborators(&self) -> Result<Collaborators, ConfigError> {
        let directory = ConfigStationDirectory::new();
        for station in &self.stations {
            directory.insert(StationProfile {
                charge_point_id: station.charge_point_id.clone(),
                connectors: station.connectors.clone(),
            });
        }

        let tariffs = match self.price_per_kwh()? {
            Some(price) => FlatTariffProvider::new(price, self.tariff.currency.clone()),
            None => FlatTariffProvider::none(),
        };

        Ok(Collaborators {
            directory: Arc::new(directory),
            authorizer: Arc::new(AllowListAuthorizer::new(
                self.authorization.accept_all,
                self.authorization.id_tags.clone(),
            )),
            tariffs: Arc::new(tariffs),
            billing: Arc::new(LogBillingSink),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
host = "127.0.0.1"
port = 9100

[session]
heartbeat_interval_secs = 60

[commands]
default_timeout_secs = 10
timeouts = { Reset = 5 }

[transactions]
first_transaction_id = 501
closed_retention_secs = 600

[logging]
format = "json"

[metrics]
prometheus_listen = "127.0.0.1:9464"

[authorization]
accept_all = false
id_tags = ["TAG-1"]

[tariff]
price_per_kwh = "0.30"

[[stations]]
charge_point_id = "GEV-001"
connectors = [{ connector_id = 1, max_power_kw = 22.0 }, { connector_id = 2 }]
"#;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.address(), "0.0.0.0:9000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_all_sections() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.address(), "127.0.0.1:9100");
        assert_eq!(config.session.heartbeat_interval_secs, 60);
        assert_eq!(config.session.liveness_multiplier, 3);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.metrics.prometheus_listen.as_deref(), Some("127.0.0.1:9464"));
        assert_eq!(config.stations[0].connectors.len(), 2);
        assert_eq!(config.stations[0].connectors[0].max_power_kw, Some(22.0));

        let settings = config.engine_settings();
        assert_eq!(settings.heartbeat_interval_secs, 60);
        assert_eq!(settings.command_timeouts.for_action("Reset"), Duration::from_secs(5));
        assert_eq!(
            settings.command_timeouts.for_action("UnlockConnector"),
            Duration::from_secs(10)
        );
        assert_eq!(settings.transactions.first_transaction_id, 501);
        assert_eq!(settings.transactions.grace_window, Duration::from_secs(300));
        assert_eq!(settings.transactions.closed_retention, Duration::from_secs(600));
        assert_eq!(settings.offline_retention, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn collaborators_reflect_config() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let collaborators = config.collaborators().unwrap();

        let station = collaborators
            .directory
            .lookup_station("GEV-001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(station.connectors.len(), 2);
        assert!(collaborators
            .directory
            .lookup_station("unknown")
            .await
            .unwrap()
            .is_none());

        assert!(collaborators
            .authorizer
            .validate_authorization("TAG-1")
            .await
            .unwrap()
            .is_accepted());
        assert!(!collaborators
            .authorizer
            .validate_authorization("TAG-2")
            .await
            .unwrap()
            .is_accepted());
    }

    #[test]
    fn env_overrides_win() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "OCPP_HOST" => Some("10.0.0.1".to_string()),
                "OCPP_PORT" => Some("9200".to_string()),
                "OCPP_LOG_LEVEL" => Some("debug".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.address(), "10.0.0.1:9200");
        assert_eq!(config.logging.level, "debug");

        let err = config
            .apply_env_overrides(|key| (key == "OCPP_PORT").then(|| "ninety".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn defaults_with_env_are_validated() {
        let config = AppConfig::from_defaults(|key| {
            (key == "OCPP_PORT").then(|| "9300".to_string())
        })
        .unwrap();
        assert_eq!(config.server.port, 9300);

        assert!(config.validate().is_ok());

        let err = AppConfig::from_defaults(|key| {
            (key == "OCPP_PORT").then(|| "ninety".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.tariff.price_per_kwh = Some("cheap".into());
        assert!(config.validate().is_err());
        assert!(config.collaborators().is_err());

        let mut config = AppConfig::default();
        config.logging.format = "yaml".into();
        assert!(config.validate().is_err());

        let config = AppConfig::from_toml(
            r#"
[[stations]]
charge_point_id = "A"
[[stations]]
charge_point_id = "A"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config = AppConfig::from_toml(
            r#"
[[stations]]
charge_point_id = "A"
connectors = [{ connector_id = 0 }]
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config = AppConfig::from_toml(
            r#"
[commands]
timeouts = { Reset = 5, UnlockConnector = 0 }
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("commands.timeouts.UnlockConnector"));

        let mut config = AppConfig::default();
        config.transactions.closed_retention_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transactions.offline_retention_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = AppConfig::load(Path::new("/nonexistent/ocpp-engine.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn default_path_ends_with_app_dir() {
        let path = default_config_path();
        assert!(path.ends_with("ocpp-engine/config.toml") || path.ends_with("config.toml"));
    }
}
