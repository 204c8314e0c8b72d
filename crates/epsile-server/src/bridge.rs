use std::sync::Arc;

use epsile_core::events::ServerEvent;
use epsile_core::ids::ConnectionId;
use epsile_engine::Outbox;

use crate::client::ClientRegistry;
use crate::wire;

/// Delivers engine output to WebSocket clients through their send queues.
#[derive(Clone)]
pub struct ClientOutbox {
    registry: Arc<ClientRegistry>,
}

impl ClientOutbox {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }
}

fn serialize(event: &ServerEvent) -> Option<String> {
    match wire::encode(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server event");
            None
        }
    }
}

impl Outbox for ClientOutbox {
    fn send(&self, to: &ConnectionId, event: ServerEvent) {
        let Some(json) = serialize(&event) else {
            return;
        };
        if !self.registry.send_to(to, json) {
            tracing::debug!(connection_id = %to, "Event not delivered");
        }
    }

    fn broadcast(&self, event: ServerEvent) {
        if let Some(json) = serialize(&event) {
            let delivered = self.registry.broadcast(&json);
            tracing::trace!(delivered, "Broadcast sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epsile_engine::{EngineConfig, InboundEvent, SessionEngine};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[test]
    fn send_reaches_only_target() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();
        let outbox = ClientOutbox::new(Arc::clone(&registry));

        outbox.send(&a, ServerEvent::Typing(true));

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "typing");
        assert_eq!(frames[0]["data"], true);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn send_to_departed_client_is_ignored() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (a, _rx) = registry.register();
        registry.unregister(&a);
        ClientOutbox::new(registry).send(&a, ServerEvent::Paired);
    }

    #[test]
    fn engine_output_reaches_sockets() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (a, mut rx_a) = registry.register();
        let (b, mut rx_b) = registry.register();
        let mut engine =
            SessionEngine::new(EngineConfig::default(), ClientOutbox::new(Arc::clone(&registry)));

        engine.handle(&a, InboundEvent::Connect);
        engine.handle(&b, InboundEvent::Connect);

        let a_frames = drain(&mut rx_a);
        let names: Vec<&str> = a_frames.iter().filter_map(|f| f["event"].as_str()).collect();
        assert_eq!(names, vec!["presence", "paired", "presence"]);
        assert_eq!(a_frames[0]["data"]["activeCount"], 0);
        assert_eq!(a_frames[2]["data"]["activeCount"], 2);

        let b_frames = drain(&mut rx_b);
        let names: Vec<&str> = b_frames.iter().filter_map(|f| f["event"].as_str()).collect();
        assert_eq!(names, vec!["paired", "presence"]);
    }
}
