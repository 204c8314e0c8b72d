use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use epsile_core::ids::ConnectionId;
use epsile_engine::{EngineHandle, InboundEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::wire;

/// Per-socket timing and framing limits.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_frame_bytes: wire::MAX_FRAME_BYTES,
        }
    }
}

/// A connected WebSocket client.
pub struct Client {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    registered_at: Instant,
    // Milliseconds after `registered_at`.
    last_pong_ms: AtomicU64,
}

impl Client {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            registered_at: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.registered_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn record_pong(&self) {
        self.last_pong_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        let silent = Duration::from_millis(self.elapsed_ms().saturating_sub(last));
        silent < timeout
    }
}

/// Registry of open sockets, keyed by the id the engine knows them by.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new client under a fresh id and return its outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a client. Dropping its sender ends the socket's writer task.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.connected.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Queue a frame for one client. A full queue drops the frame.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(client) = self.clients.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every connected client. Returns how many accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        let targets: Vec<Arc<Client>> = self
            .clients
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for client in targets {
            match client.tx.try_send(message.to_owned()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection_id = %client.id, "Send queue full, dropping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }

    /// Number of open sockets.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Ids of clients that have not answered a ping within `timeout`.
    pub fn stale_clients(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Drive one socket: a writer that drains the outbound queue and pings, and a
/// reader that decodes frames into engine events. When either side stops the
/// client is unregistered and the engine is told it disconnected.
pub async fn handle_ws_connection(
    socket: WebSocket,
    id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    engine: EngineHandle,
    settings: ConnectionSettings,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(settings.heartbeat_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else {
                        return Some("server disconnect".to_owned());
                    };
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        return Some(format!("transport error: {e}"));
                    }
                }
                _ = ping_interval.tick() => {
                    if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new().into())).await {
                        return Some(format!("transport error: {e}"));
                    }
                    tracing::trace!(connection_id = %writer_id, "Sent ping");
                }
            }
        }
    });

    let reader_id = id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader_engine = engine.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => return Some(format!("transport error: {e}")),
            };
            match msg {
                WsMessage::Text(text) => match wire::decode(text.as_str(), settings.max_frame_bytes) {
                    Ok(event) => {
                        tracing::debug!(connection_id = %reader_id, event = event.name(), "Frame received");
                        if reader_engine
                            .submit(reader_id.clone(), event.into())
                            .await
                            .is_err()
                        {
                            return Some("server shutting down".to_owned());
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            connection_id = %reader_id,
                            error_kind = e.error_kind(),
                            error = %e,
                            "Rejected frame"
                        );
                        if let Some(frame) = wire::error_frame(&e) {
                            reader_registry.send_to(&reader_id, frame);
                        }
                    }
                },
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_id),
                WsMessage::Close(_) => return Some("client closed".to_owned()),
                _ => {}
            }
        }
        None
    });

    let reason = tokio::select! {
        r = &mut writer => {
            reader.abort();
            r.ok().flatten()
        }
        r = &mut reader => {
            writer.abort();
            r.ok().flatten()
        }
    };

    registry.unregister(&id);
    tracing::info!(connection_id = %id, reason = ?reason, "WebSocket client disconnected");
    if engine
        .submit(id.clone(), InboundEvent::Disconnect { reason })
        .await
        .is_err()
    {
        tracing::debug!(connection_id = %id, "Engine closed before disconnect was delivered");
    }
}

/// Periodically disconnect clients whose pongs stopped arriving.
pub fn start_liveness_task(
    registry: Arc<ClientRegistry>,
    engine: EngineHandle,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let stale = registry.stale_clients(timeout);
            if stale.is_empty() {
                continue;
            }
            tracing::info!(removed = stale.len(), "Dead client cleanup");
            for id in stale {
                registry.unregister(&id);
                let event = InboundEvent::Disconnect {
                    reason: Some("ping timeout".to_owned()),
                };
                if engine.submit(id, event).await.is_err() {
                    return;
                }
            }
        }
    })
}
