//! OCPP 1.6 engine - CLI server
//!
//! ```sh
//! # Run with the default config (~/.config/ocpp-engine/config.toml)
//! ocpp-engine
//!
//! # Custom config path and port
//! ocpp-engine --config /etc/ocpp-engine/config.toml --port 9100
//!
//! # Validate config without starting
//! ocpp-engine --check
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use ocpp_engine::config::AppConfig;
use ocpp_engine::server::{init_tracing, ServerHandle};

/// OCPP 1.6-J central system engine for EV charging stations.
#[derive(Parser, Debug)]
#[command(
    name = "ocpp-engine",
    version,
    about = "OCPP 1.6 charge-point protocol engine",
    long_about = "Accepts charge-point WebSocket sessions at ws://<host>:<port>/ocpp/<id>.\n\n\
                  Default config: ~/.config/ocpp-engine/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = "OCPP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file and exit without starting the server.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let explicit = cli.config.is_some();
    let config_path = cli
        .config
        .unwrap_or_else(ocpp_engine::default_config_path);

    let loaded = if explicit || config_path.exists() {
        Some(AppConfig::load(&config_path))
    } else {
        None
    };

    let mut config = match loaded {
        Some(Ok(cfg)) => cfg,
        Some(Err(e)) => {
            eprintln!("Failed to load config from {}: {}", config_path.display(), e);
            std::process::exit(2);
        }
        None => {
            match AppConfig::from_defaults(|key| std::env::var(key).ok()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("Invalid default configuration: {}", e);
                    std::process::exit(2);
                }
            }
        }
    };

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    if cli.check {
        config.validate()?;
        println!("✅ Configuration is valid");
        println!("   Config file : {}", config_path.display());
        println!("   WS address  : ws://{}/ocpp/{{charge_point_id}}", config.address());
        println!("   Stations    : {}", config.stations.len());
        println!("   Log level   : {}", config.logging.level);
        return Ok(());
    }

    init_tracing(&config);
    if config_path.exists() {
        info!("Configuration loaded from {}", config_path.display());
    } else {
        warn!(
            "No config file at {}, using defaults",
            config_path.display()
        );
    }

    let handle = match ServerHandle::start(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to start OCPP engine");
            return Err(e);
        }
    };

    handle.install_signal_handler();
    info!("🚀 Press Ctrl+C to shutdown gracefully.");

    handle.shutdown_signal().wait().await;
    handle.wait().await;

    Ok(())
}
