//! Single-slot rendezvous.
//!
//! At most one connection waits for a partner at any instant. The next
//! connection to ask is paired with it immediately; a third one takes the slot
//! and waits, it never lines up behind the first.

use epsile_core::errors::SessionFault;
use epsile_core::ids::ConnectionId;

use crate::registry::ConnectionRegistry;

/// The one connection currently looking for a partner, if any.
#[derive(Debug, Default)]
pub struct WaitingTicket(Option<ConnectionId>);

impl WaitingTicket {
    pub fn holder(&self) -> Option<&ConnectionId> {
        self.0.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Pop the holder unless it is `id` itself.
    pub fn take_unless(&mut self, id: &ConnectionId) -> Option<ConnectionId> {
        match &self.0 {
            Some(holder) if holder != id => self.0.take(),
            _ => None,
        }
    }

    pub fn park(&mut self, id: ConnectionId) {
        self.0 = Some(id);
    }

    /// Clear the slot if it holds `id` or `partner`, returning the cleared holder.
    pub fn clear_if_held_by(
        &mut self,
        id: &ConnectionId,
        partner: Option<&ConnectionId>,
    ) -> Option<ConnectionId> {
        let held = match &self.0 {
            Some(holder) => holder == id || Some(holder) == partner,
            None => false,
        };
        if held {
            self.0.take()
        } else {
            None
        }
    }
}

/// Result of a pairing request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// Linked with the previous ticket holder.
    Paired { partner: ConnectionId },
    /// Parked in the waiting slot.
    Queued,
}

/// Owns the waiting ticket and links connections in the registry.
#[derive(Debug, Default)]
pub struct Matchmaker {
    ticket: WaitingTicket,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> &WaitingTicket {
        &self.ticket
    }

    pub fn ticket_mut(&mut self) -> &mut WaitingTicket {
        &mut self.ticket
    }

    /// Pair `id` with the waiting connection, or park it in the slot.
    ///
    /// A current partner of `id` is overwritten without being told; callers
    /// decide whether that is allowed.
    pub fn request_pair(
        &mut self,
        registry: &mut ConnectionRegistry,
        id: &ConnectionId,
    ) -> Result<PairOutcome, SessionFault> {
        if !registry.contains(id) {
            return Err(SessionFault::UnknownConnection(id.clone()));
        }

        if let Some(partner) = self.ticket.take_unless(id) {
            if registry.contains(&partner) {
                if let Some(conn) = registry.lookup_mut(id) {
                    conn.pair_with(partner.clone());
                }
                if let Some(conn) = registry.lookup_mut(&partner) {
                    conn.pair_with(id.clone());
                }
                return Ok(PairOutcome::Paired { partner });
            }
            tracing::warn!(
                connection_id = %id,
                stale_holder = %partner,
                "Waiting ticket held by a removed connection, discarding"
            );
        }

        self.ticket.park(id.clone());
        if let Some(conn) = registry.lookup_mut(id) {
            conn.queue();
        }
        Ok(PairOutcome::Queued)
    }
}
