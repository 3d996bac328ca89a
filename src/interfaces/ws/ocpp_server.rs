//! OCPP 1.6 WebSocket server
//!
//! Accepts charge-point connections at `ws://<host>:<port>/ocpp/{charge_point_id}`
//! (or `/{charge_point_id}`). Each session gets a writer task fed by the
//! session's outbound channel and a reader task that handles frames strictly
//! in order. When the writer stops, the reader stops taking new frames but
//! the frame it is handling runs to completion.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::negotiator::{extract_charge_point_id, ProtocolNegotiator};
use crate::application::session::{Outbound, SessionEnd};
use crate::application::Engine;
use crate::domain::OcppVersion;
use crate::shared::ShutdownSignal;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct OcppServer {
    engine: Arc<Engine>,
    negotiator: Arc<ProtocolNegotiator>,
    shutdown_signal: Option<ShutdownSignal>,
}

impl OcppServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            negotiator: Arc::new(ProtocolNegotiator::default()),
            shutdown_signal: None,
        }
    }

    /// Set the shutdown signal for graceful shutdown
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self, addr: &str) -> Result<(), BoxError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let local = listener.local_addr()?;
        info!(
            address = %local,
            subprotocols = ?self.negotiator.supported_subprotocols(),
            "OCPP central system listening on ws://{}/ocpp/{{charge_point_id}}",
            local
        );

        let Some(shutdown) = self.shutdown_signal.clone() else {
            loop {
                let (stream, addr) = listener.accept().await?;
                self.spawn_connection(stream, addr);
            }
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown.notified().wait() => {
                    info!("WebSocket server received shutdown signal");
                    let closed = self.engine.shutdown_sessions();
                    info!(closed, "WebSocket server shutdown complete");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let engine = self.engine.clone();
        let negotiator = self.negotiator.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, engine, negotiator).await {
                warn!(remote_addr = %addr, error = %e, "Connection ended with error");
            }
        });
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<Engine>,
    negotiator: Arc<ProtocolNegotiator>,
) -> Result<(), BoxError> {
    debug!(remote_addr = %addr, "New TCP connection");

    let mut handshake: Option<(String, OcppVersion)> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, mut response: Response| {
            let path = req.uri().path();
            let requested = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            let Some(version) = negotiator.negotiate(requested) else {
                warn!(remote_addr = %addr, path, requested, "Rejecting handshake: no supported OCPP subprotocol");
                return Err(reject(StatusCode::BAD_REQUEST, "Unsupported OCPP subprotocol"));
            };
            let Some(charge_point_id) = extract_charge_point_id(path) else {
                warn!(remote_addr = %addr, path, "Rejecting handshake: no charge point identity in path");
                return Err(reject(StatusCode::BAD_REQUEST, "Missing charge point identity"));
            };

            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(version.subprotocol()),
            );
            handshake = Some((charge_point_id, version));
            Ok(response)
        },
    )
    .await?;

    let Some((charge_point_id, version)) = handshake else {
        return Err("handshake completed without negotiation".into());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let handler = engine.open_session(&charge_point_id, tx.clone(), version);
    let connection_id = handler.connection_id;

    info!(
        charge_point_id = charge_point_id.as_str(),
        connection_id,
        remote_addr = %addr,
        %version,
        "Charge point connected"
    );

    let (stop_reading, mut reading_stopped) = watch::channel(false);

    // Writer: frames and close requests from the engine
    let cp_id_send = charge_point_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    debug!(charge_point_id = cp_id_send.as_str(), "-> {}", text);
                    if let Err(e) = ws_sender.send(Message::Text(text)).await {
                        error!(charge_point_id = cp_id_send.as_str(), error = %e, "Send error");
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let code = match reason {
                        SessionEnd::ServerShutdown => CloseCode::Away,
                        SessionEnd::LivenessTimeout | SessionEnd::Replaced => CloseCode::Policy,
                        SessionEnd::Disconnected => CloseCode::Normal,
                    };
                    let frame = CloseFrame {
                        code,
                        reason: reason.as_str().into(),
                    };
                    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                        debug!(charge_point_id = cp_id_send.as_str(), error = %e, "Close frame not delivered");
                    }
                    break;
                }
            }
        }
        let _ = stop_reading.send(true);
    });

    // Reader: one frame at a time, replies go out through the same channel
    let cp_id_recv = charge_point_id.clone();
    let registry = engine.registry().clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                next = ws_receiver.next() => next,
                _ = reading_stopped.changed() => break,
            };
            let Some(msg) = next else {
                break;
            };
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(reply) = handler.handle(&text).await {
                        if tx.send(Outbound::Frame(reply)).is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    registry.touch(&cp_id_recv, connection_id, Utc::now());
                }
                Ok(Message::Close(frame)) => {
                    info!(charge_point_id = cp_id_recv.as_str(), ?frame, "Close frame received");
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!(
                        charge_point_id = cp_id_recv.as_str(),
                        bytes = data.len(),
                        "Binary message received, ignoring"
                    );
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!(charge_point_id = cp_id_recv.as_str(), error = %e, "WebSocket error");
                    break;
                }
            }
        }
    });

    let reader = tokio::select! {
        _ = &mut send_task => recv_task.await,
        reader = &mut recv_task => {
            send_task.abort();
            reader
        }
    };
    if let Err(e) = reader {
        error!(charge_point_id = charge_point_id.as_str(), error = %e, "Reader task failed");
    }

    // No-op when the engine already ended this instance (eviction,
    // replacement, shutdown).
    engine.end_session(&charge_point_id, connection_id, SessionEnd::Disconnected);

    info!(
        charge_point_id = charge_point_id.as_str(),
        connection_id,
        "Connection closed"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::create_event_bus;
    use crate::application::{Collaborators, EngineSettings};
    use crate::domain::{
        AuthorizationDecision, Authorizer, ConnectorSpec, DomainResult, TransactionStatus,
    };
    use crate::infrastructure::memory::{
        AllowListAuthorizer, ConfigStationDirectory, FlatTariffProvider, LogBillingSink,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct SlowAuthorizer(Duration);

    #[async_trait]
    impl Authorizer for SlowAuthorizer {
        async fn validate_authorization(&self, _id_tag: &str) -> DomainResult<AuthorizationDecision> {
            tokio::time::sleep(self.0).await;
            Ok(AuthorizationDecision::Accepted)
        }
    }

    fn engine_with(authorizer: Arc<dyn Authorizer>) -> Arc<Engine> {
        Engine::new(
            Collaborators {
                directory: Arc::new(ConfigStationDirectory::new().with_station(
                    "CP001",
                    vec![ConnectorSpec {
                        connector_id: 1,
                        connector_type: None,
                        max_power_kw: None,
                    }],
                )),
                authorizer,
                tariffs: Arc::new(FlatTariffProvider::none()),
                billing: Arc::new(LogBillingSink),
            },
            EngineSettings::default(),
            create_event_bus(),
        )
    }

    async fn start_server() -> (SocketAddr, Arc<Engine>, ShutdownSignal) {
        start_server_with(engine_with(Arc::new(AllowListAuthorizer::new(true, Vec::new())))).await
    }

    async fn start_server_with(engine: Arc<Engine>) -> (SocketAddr, Arc<Engine>, ShutdownSignal) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let server = OcppServer::new(engine.clone()).with_shutdown(shutdown.clone());
        tokio::spawn(async move { server.serve(listener).await });
        (addr, engine, shutdown)
    }

    #[tokio::test]
    async fn handshake_without_subprotocol_is_rejected() {
        let (addr, _engine, shutdown) = start_server().await;

        let request = format!("ws://{}/ocpp/CP001", addr).into_client_request().unwrap();
        let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        shutdown.trigger();
    }

    #[tokio::test]
    async fn heartbeat_round_trip_over_websocket() {
        let (addr, engine, shutdown) = start_server().await;

        let mut request = format!("ws://{}/ocpp/CP001", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));
        let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "ocpp1.6"
        );

        ws.send(Message::Text(r#"[2,"hb-1","Heartbeat",{}]"#.to_string()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = reply else {
            panic!("expected text reply");
        };
        assert!(text.starts_with(r#"[3,"hb-1""#));
        assert!(engine.registry().is_connected("CP001"));

        ws.close(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!engine.registry().is_connected("CP001"));

        shutdown.trigger();
    }

    async fn connect(addr: SocketAddr, charge_point_id: &str) -> Client {
        let mut request = format!("ws://{}/ocpp/{}", addr, charge_point_id)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));
        tokio_tungstenite::connect_async(request).await.unwrap().0
    }

    const START: &str = r#"[2,"st-1","StartTransaction",{"connectorId":1,"idTag":"TAG-001","meterStart":100,"timestamp":"2026-01-01T10:00:00Z"}]"#;

    #[tokio::test]
    async fn start_in_flight_survives_reconnect() {
        let engine = engine_with(Arc::new(SlowAuthorizer(Duration::from_millis(200))));
        let (addr, engine, shutdown) = start_server_with(engine).await;

        let mut first = connect(addr, "CP001").await;
        first.send(Message::Text(START.to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The device reconnects before its first start was answered.
        let mut second = connect(addr, "CP001").await;
        match first.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Policy),
            other => panic!("expected close frame, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let open = engine.transactions().get(1).unwrap();
        assert_eq!(open.status, TransactionStatus::Active);

        // Retransmitted on the new connection, the start gets the same id.
        second.send(Message::Text(START.to_string())).await.unwrap();
        let Some(Ok(Message::Text(reply))) = second.next().await else {
            panic!("expected text reply");
        };
        assert!(reply.contains(r#""transactionId":1"#), "{}", reply);
        assert!(reply.contains(r#""status":"Accepted""#), "{}", reply);
        assert_eq!(engine.transactions().open_count(), 1);

        shutdown.trigger();
    }
}
