use std::sync::Arc;

use epsile_core::events::ServerEvent;
use epsile_core::ids::ConnectionId;

/// Where the engine hands outbound events. Sends are fire-and-forget; the
/// implementation owns queuing, backpressure and network I/O.
pub trait Outbox: Send + Sync + 'static {
    /// Deliver an event to one connection. Unknown ids are ignored.
    fn send(&self, to: &ConnectionId, event: ServerEvent);

    /// Deliver an event to every live connection.
    fn broadcast(&self, event: ServerEvent);
}

impl<T: Outbox> Outbox for Arc<T> {
    fn send(&self, to: &ConnectionId, event: ServerEvent) {
        (**self).send(to, event);
    }

    fn broadcast(&self, event: ServerEvent) {
        (**self).broadcast(event);
    }
}
