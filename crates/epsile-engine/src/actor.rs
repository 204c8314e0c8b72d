//! Single-owner task around a [`SessionEngine`].
//!
//! Transports submit events through a cloneable [`EngineHandle`]; one task
//! drains the channel and applies them in arrival order, so no two events
//! ever touch the registry, the ticket or the counter at the same time.

use epsile_core::ids::ConnectionId;
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::outbox::Outbox;
use crate::session::{EngineStats, InboundEvent, SessionEngine};

enum Command {
    Event {
        id: ConnectionId,
        event: InboundEvent,
    },
    Stats(oneshot::Sender<EngineStats>),
}

/// Cloneable handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Move the engine into its own task. The task ends once every handle is dropped.
    pub fn spawn<O: Outbox>(engine: SessionEngine<O>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(engine.config().event_buffer.max(1));
        let task = tokio::spawn(run(engine, rx));
        (Self { tx }, task)
    }

    /// Queue an event for `id`. Waits only if the channel is full.
    pub async fn submit(&self, id: ConnectionId, event: InboundEvent) -> Result<(), EngineError> {
        self.tx
            .send(Command::Event { id, event })
            .await
            .map_err(|_| EngineError::Closed)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Stats(reply_tx))
            .await
            .map_err(|_| EngineError::Closed)?;
        reply_rx.await.map_err(|_| EngineError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run<O: Outbox>(mut engine: SessionEngine<O>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event { id, event } => {
                engine.handle(&id, event);
            }
            Command::Stats(reply) => {
                let _ = reply.send(engine.stats());
            }
        }
    }
    tracing::info!("Engine channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingOutbox;
    use crate::session::EngineConfig;
    use epsile_core::events::{ClientEvent, ServerEvent};
    use serde_json::json;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from_raw(s)
    }

    #[tokio::test]
    async fn events_are_applied_in_order() {
        let outbox = RecordingOutbox::new();
        let (handle, _task) = EngineHandle::spawn(SessionEngine::new(
            EngineConfig::default(),
            outbox.clone(),
        ));

        handle.submit(id("x"), InboundEvent::Connect).await.unwrap();
        handle.submit(id("y"), InboundEvent::Connect).await.unwrap();
        handle
            .submit(id("y"), ClientEvent::Chat(json!("hi")).into())
            .await
            .unwrap();

        // The stats round-trip queues behind the events above.
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.live_connections, 2);
        assert!(!stats.waiting);
        assert_eq!(
            outbox.sent_to(&id("x")),
            vec![ServerEvent::Paired, ServerEvent::Chat(json!("hi"))]
        );
    }

    #[tokio::test]
    async fn concurrent_submitters_are_serialized() {
        let outbox = RecordingOutbox::new();
        let (handle, _task) = EngineHandle::spawn(SessionEngine::new(
            EngineConfig::default(),
            outbox.clone(),
        ));

        let mut joins = Vec::new();
        for n in 0..50 {
            let h = handle.clone();
            joins.push(tokio::spawn(async move {
                h.submit(id(&format!("c{n}")), InboundEvent::Connect).await.unwrap();
            }));
        }
        for j in joins {
            j.await.unwrap();
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.live_connections, 50);
        assert_eq!(stats.active_count, 50);
        assert!(!stats.waiting);
    }

    #[tokio::test]
    async fn closed_engine_reports_error() {
        let outbox = RecordingOutbox::new();
        let (handle, task) =
            EngineHandle::spawn(SessionEngine::new(EngineConfig::default(), outbox));
        task.abort();
        let _ = task.await;

        assert!(handle.is_closed());
        assert!(matches!(
            handle.submit(id("x"), InboundEvent::Connect).await,
            Err(EngineError::Closed)
        ));
        assert!(matches!(handle.stats().await, Err(EngineError::Closed)));
    }
}
