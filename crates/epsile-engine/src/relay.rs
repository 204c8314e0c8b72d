//! Forwarding chat and typing payloads between mutually paired connections.
//!
//! A payload only moves when both sides point at each other. A connection
//! left behind by its partner's re-pair still believes it is paired, but its
//! sends go nowhere.

use epsile_core::errors::SessionFault;
use epsile_core::events::ServerEvent;
use epsile_core::ids::ConnectionId;

use crate::outbox::Outbox;
use crate::registry::ConnectionRegistry;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded { to: ConnectionId },
    /// Typing value matched what the partner already saw.
    Unchanged,
}

/// Resolve who a payload from `from` may be forwarded to.
pub fn route(
    registry: &ConnectionRegistry,
    from: &ConnectionId,
    event: &'static str,
) -> Result<ConnectionId, SessionFault> {
    let conn = registry
        .lookup(from)
        .ok_or_else(|| SessionFault::UnknownConnection(from.clone()))?;

    match &conn.partner {
        Some(partner) if registry.are_mutual(from, partner) => Ok(partner.clone()),
        _ => Err(SessionFault::UnpairedPayload {
            id: from.clone(),
            event,
        }),
    }
}

pub fn chat<O: Outbox>(
    registry: &ConnectionRegistry,
    outbox: &O,
    from: &ConnectionId,
    message: serde_json::Value,
) -> Result<RelayOutcome, SessionFault> {
    let to = route(registry, from, "chat")?;
    outbox.send(&to, ServerEvent::Chat(message));
    Ok(RelayOutcome::Forwarded { to })
}

/// Forward a typing indicator, skipping values the partner already has.
pub fn typing<O: Outbox>(
    registry: &mut ConnectionRegistry,
    outbox: &O,
    from: &ConnectionId,
    is_typing: bool,
) -> Result<RelayOutcome, SessionFault> {
    let to = route(registry, from, "typing")?;
    let Some(conn) = registry.lookup_mut(from) else {
        return Err(SessionFault::UnknownConnection(from.clone()));
    };
    if conn.is_typing == is_typing {
        return Ok(RelayOutcome::Unchanged);
    }
    conn.is_typing = is_typing;
    outbox.send(&to, ServerEvent::Typing(is_typing));
    Ok(RelayOutcome::Forwarded { to })
}
