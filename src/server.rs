//! Engine runtime
//!
//! [`ServerHandle`] owns the process lifecycle: metrics exporter, engine,
//! WebSocket server, liveness monitor and graceful shutdown. The CLI binary
//! and the integration tests both start the engine through it.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::events::{create_event_bus, SharedEventBus};
use crate::application::services::LivenessMonitor;
use crate::application::Engine;
use crate::config::{AppConfig, ConfigError};
use crate::interfaces::ws::OcppServer;
use crate::shared::{ShutdownCoordinator, ShutdownSignal};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handle to a running engine.
///
/// ```rust,no_run
/// use ocpp_engine::config::AppConfig;
/// use ocpp_engine::server::ServerHandle;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let handle = ServerHandle::start(AppConfig::default()).await?;
///     handle.install_signal_handler();
///     handle.shutdown_signal().wait().await;
///     handle.wait().await;
///     Ok(())
/// }
/// ```
pub struct ServerHandle {
    pub engine: Arc<Engine>,
    pub event_bus: SharedEventBus,
    pub config: AppConfig,
    /// Address the WebSocket listener is bound to
    pub local_addr: SocketAddr,

    shutdown: ShutdownCoordinator,
    ws_task: JoinHandle<()>,
    liveness_task: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn start(config: AppConfig) -> Result<Self, BoxError> {
        info!("Starting OCPP engine...");

        if let Some(listen) = &config.metrics.prometheus_listen {
            install_prometheus_exporter(listen)?;
        }

        let collaborators = config.collaborators()?;
        let event_bus = create_event_bus();
        let engine = Engine::new(collaborators, config.engine_settings(), event_bus.clone());
        info!(
            stations = config.stations.len(),
            heartbeat_interval_secs = config.session.heartbeat_interval_secs,
            "Engine initialized"
        );

        let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout_secs);
        let shutdown_signal = shutdown.signal();

        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;

        let server = OcppServer::new(engine.clone()).with_shutdown(shutdown_signal.clone());
        let ws_task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!(error = %e, "WebSocket server error");
            }
        });

        let liveness_task = LivenessMonitor::new(engine.clone())
            .with_config(config.liveness_config())
            .start(shutdown_signal);

        info!(address = %local_addr, "🚀 OCPP engine started");

        Ok(Self {
            engine,
            event_bus,
            config,
            local_addr,
            shutdown,
            ws_task,
            liveness_task,
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Install OS signal listeners (SIGTERM, SIGINT) that trigger shutdown.
    pub fn install_signal_handler(&self) {
        self.shutdown.start_signal_listener();
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.signal().trigger();
    }

    /// Wait for the background tasks to stop once shutdown has been
    /// triggered, bounded by `server.shutdown_timeout_secs`.
    pub async fn wait(self) {
        info!("⏳ Waiting for server tasks to complete...");

        let completed = self
            .shutdown
            .drain(vec![
                ("websocket_server", self.ws_task),
                ("liveness_monitor", self.liveness_task),
            ])
            .await;

        if !completed {
            warn!("Server tasks did not stop in time");
        }
        info!(
            open_transactions = self.engine.transactions().open_count(),
            "👋 OCPP engine shutdown complete"
        );
    }

    /// Trigger shutdown and wait for completion.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down OCPP engine...");
        self.trigger_shutdown();
        self.wait().await;
    }

    /// `false` once shutdown was triggered or the listener stopped.
    pub fn is_running(&self) -> bool {
        !self.shutdown.signal().is_triggered() && !self.ws_task.is_finished()
    }
}

/// The global recorder can be installed once per process; later starts
/// in the same process reuse it.
fn install_prometheus_exporter(listen: &str) -> Result<(), BoxError> {
    static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

    let addr: SocketAddr = listen.parse().map_err(|e| {
        ConfigError::Invalid(format!("metrics.prometheus_listen {:?}: {}", listen, e))
    })?;

    if let Some(existing) = INSTALLED.get() {
        info!(address = %existing, "📊 Prometheus exporter already installed");
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    let _ = INSTALLED.set(addr);
    info!(address = %addr, "📊 Prometheus exporter listening on http://{}/metrics", addr);
    Ok(())
}

/// Initialize tracing from the logging config. `RUST_LOG` takes precedence
/// over `logging.level`. Call once at process startup.
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::from_toml(
            r#"
[server]
host = "127.0.0.1"
port = 0
shutdown_timeout_secs = 2

[[stations]]
charge_point_id = "GEV-001"
connectors = [{ connector_id = 1 }]
"#,
        )
        .unwrap();
        config.validate().unwrap();
        config.session.sweep_interval_secs = 1;
        config
    }

    #[tokio::test]
    async fn boot_then_shutdown_closes_sessions() {
        let handle = ServerHandle::start(test_config()).await.unwrap();
        assert!(handle.is_running());

        let mut request = format!("ws://{}/ocpp/GEV-001", handle.local_addr)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        ws.send(Message::Text(
            r#"[2,"b1","BootNotification",{"chargePointVendor":"V","chargePointModel":"M"}]"#
                .to_string(),
        ))
        .await
        .unwrap();
        let Message::Text(reply) = ws.next().await.unwrap().unwrap() else {
            panic!("expected text reply");
        };
        assert!(reply.contains(r#""status":"Accepted""#));
        assert_eq!(handle.engine.list_active_connections().len(), 1);

        handle.trigger_shutdown();
        assert!(!handle.is_running());

        let engine = handle.engine.clone();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown completes");

        assert!(engine.list_active_connections().is_empty());
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1001)
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_prometheus_address_fails_start() {
        let mut config = test_config();
        config.metrics.prometheus_listen = Some("not-an-address".into());
        assert!(ServerHandle::start(config).await.is_err());
    }
}
