use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use epsile_engine::{EngineConfig, EngineHandle, SessionEngine};
use epsile_telemetry::MetricsRecorder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::ClientOutbox;
use crate::client::{self, ClientRegistry, ConnectionSettings};
use crate::wire;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            max_frame_bytes: wire::MAX_FRAME_BYTES,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub clients: Arc<ClientRegistry>,
    pub engine: EngineHandle,
    pub settings: ConnectionSettings,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Spawn the engine, the liveness sweeper and the HTTP listener.
pub async fn start(
    config: ServerConfig,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let clients = Arc::new(ClientRegistry::new(config.max_send_queue));

    let mut engine = SessionEngine::new(
        config.engine.clone(),
        ClientOutbox::new(Arc::clone(&clients)),
    );
    if let Some(m) = &metrics {
        engine = engine.with_metrics(Arc::clone(m));
    }
    let (engine, engine_task) = EngineHandle::spawn(engine);

    let settings = config.connection_settings();
    let liveness = client::start_liveness_task(
        Arc::clone(&clients),
        engine.clone(),
        settings.heartbeat_interval,
        Duration::from_secs(config.client_timeout_secs.max(1)),
    );

    let router = build_router(AppState {
        clients,
        engine,
        settings,
        metrics,
    });

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        require_unpair_before_repair = config.engine.require_unpair_before_repair,
        presence_accounting = ?config.engine.presence_accounting,
        "Epsile server started"
    );

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Server exited");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _engine: engine_task,
        _liveness: liveness,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _engine: tokio::task::JoinHandle<()>,
    _liveness: tokio::task::JoinHandle<()>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, rx) = state.clients.register();
    tracing::info!(connection_id = %id, "WebSocket client connected");

    if state
        .engine
        .submit(id.clone(), epsile_engine::InboundEvent::Connect)
        .await
        .is_err()
    {
        tracing::warn!(connection_id = %id, "Engine unavailable, closing socket");
        state.clients.unregister(&id);
        return;
    }

    client::handle_ws_connection(
        socket,
        id,
        rx,
        state.clients,
        state.engine,
        state.settings,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.stats().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}

/// Engine counters plus a metrics snapshot.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let engine = match state.engine.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    };
    let metrics = state
        .metrics
        .as_ref()
        .map(|m| m.snapshot())
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "engine": engine,
            "sockets": state.clients.count(),
            "metrics": metrics,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message;

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start_test_server() -> ServerHandle {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        start(config, Some(Arc::new(MetricsRecorder::new())))
            .await
            .unwrap()
    }

    async fn connect(port: u16) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        ws
    }

    /// Read frames until one named `event` arrives.
    async fn next_event(ws: &mut Ws, event: &str) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                let v: Value = serde_json::from_str(text.as_str()).unwrap();
                if v["event"] == event {
                    return v;
                }
            }
        }
    }

    async fn send(ws: &mut Ws, frame: Value) {
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start_test_server().await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn stats_endpoint_reports_engine_counters() {
        let handle = start_test_server().await;
        let url = format!("http://127.0.0.1:{}/stats", handle.port);
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();

        assert_eq!(body["engine"]["activeCount"], 0);
        assert_eq!(body["engine"]["liveConnections"], 0);
        assert_eq!(body["engine"]["waiting"], false);
        assert_eq!(body["sockets"], 0);
        assert!(body["metrics"].is_array());
    }

    #[tokio::test]
    async fn two_sockets_pair_chat_and_end() {
        let handle = start_test_server().await;
        let mut a = connect(handle.port).await;
        let mut b = connect(handle.port).await;

        next_event(&mut a, "paired").await;
        next_event(&mut b, "paired").await;

        send(&mut a, json!({"event": "chat", "data": {"text": "hi"}})).await;
        let chat = next_event(&mut b, "chat").await;
        assert_eq!(chat["data"], json!({"text": "hi"}));

        send(&mut b, json!({"event": "typing", "data": true})).await;
        let typing = next_event(&mut a, "typing").await;
        assert_eq!(typing["data"], true);

        a.close(None).await.unwrap();
        let ended = next_event(&mut b, "conversationEnded").await;
        assert_eq!(ended["data"]["who"], 2);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let handle = start_test_server().await;
        let mut a = connect(handle.port).await;

        a.send(Message::Text("not json".into())).await.unwrap();
        let err = next_event(&mut a, "error").await;
        assert!(err["data"]["message"]
            .as_str()
            .unwrap()
            .starts_with("malformed frame"));

        // The socket stays usable afterwards.
        send(&mut a, json!({"event": "findPartner"})).await;
        next_event(&mut a, "presence").await;
    }

    #[tokio::test]
    async fn explicit_end_notifies_both_sides() {
        let handle = start_test_server().await;
        let mut a = connect(handle.port).await;
        let mut b = connect(handle.port).await;
        next_event(&mut a, "paired").await;
        next_event(&mut b, "paired").await;

        send(&mut a, json!({"event": "endConversation"})).await;
        assert_eq!(next_event(&mut a, "conversationEnded").await["data"]["who"], 1);
        assert_eq!(next_event(&mut b, "conversationEnded").await["data"]["who"], 2);
    }

    #[tokio::test]
    async fn build_router_creates_routes() {
        let clients = Arc::new(ClientRegistry::new(32));
        let engine = SessionEngine::new(
            EngineConfig::default(),
            ClientOutbox::new(Arc::clone(&clients)),
        );
        let (engine, _task) = EngineHandle::spawn(engine);
        let _router = build_router(AppState {
            clients,
            engine,
            settings: ConnectionSettings::default(),
            metrics: None,
        });
    }
}
