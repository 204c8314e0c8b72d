//! Per-connection session lifecycle.
//!
//! `SessionEngine` owns the registry, the waiting ticket and the presence
//! counter. Every inbound event is applied through `&mut self`, so whoever owns
//! the engine serializes all mutation (see [`crate::actor`]).

use std::sync::Arc;

use epsile_core::errors::SessionFault;
use epsile_core::events::{ClientEvent, EndedBy, ServerEvent};
use epsile_core::ids::ConnectionId;
use epsile_telemetry::MetricsRecorder;
use serde::Serialize;

use crate::matchmaker::{Matchmaker, PairOutcome};
use crate::outbox::Outbox;
use crate::presence::{PresenceAccounting, PresenceCounter};
use crate::registry::{ConnectionRegistry, SessionState};
use crate::relay::{self, RelayOutcome};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Reject `findPartner` from a paired connection instead of silently
    /// abandoning its current partner.
    pub require_unpair_before_repair: bool,
    pub presence_accounting: PresenceAccounting,
    /// Capacity of the actor's inbound channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            require_unpair_before_repair: false,
            presence_accounting: PresenceAccounting::Inherited,
            event_buffer: 1024,
        }
    }
}

/// Everything the transport can report about a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    Connect,
    Client(ClientEvent),
    Disconnect { reason: Option<String> },
}

impl From<ClientEvent> for InboundEvent {
    fn from(event: ClientEvent) -> Self {
        Self::Client(event)
    }
}

/// What handling one event did. Returned for tests and metrics only.
#[derive(Clone, Debug, PartialEq)]
pub enum EventOutcome {
    Paired { partner: ConnectionId },
    Queued,
    Relayed { to: ConnectionId, kind: &'static str },
    TypingUnchanged,
    /// `partner` is set when a live partner was also reset and notified.
    Ended { partner: Option<ConnectionId> },
    Disconnected { partner: Option<ConnectionId> },
    Dropped(SessionFault),
}

/// Point-in-time counters, exposed over `/stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub active_count: u64,
    pub live_connections: usize,
    pub total_connections: u64,
    pub waiting: bool,
}

pub struct SessionEngine<O: Outbox> {
    config: EngineConfig,
    registry: ConnectionRegistry,
    matchmaker: Matchmaker,
    presence: PresenceCounter,
    outbox: O,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl<O: Outbox> SessionEngine<O> {
    pub fn new(config: EngineConfig, outbox: O) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            matchmaker: Matchmaker::new(),
            presence: PresenceCounter::new(),
            outbox,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn waiting(&self) -> Option<&ConnectionId> {
        self.matchmaker.ticket().holder()
    }

    pub fn active_count(&self) -> u64 {
        self.presence.active()
    }

    pub fn state_of(&self, id: &ConnectionId) -> Option<SessionState> {
        self.registry.lookup(id).map(|c| c.state)
    }

    pub fn partner_of(&self, id: &ConnectionId) -> Option<&ConnectionId> {
        self.registry.lookup(id).and_then(|c| c.partner.as_ref())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_count: self.presence.active(),
            live_connections: self.registry.len(),
            total_connections: self.registry.total_registered(),
            waiting: !self.matchmaker.ticket().is_empty(),
        }
    }

    /// Apply one inbound event. Never fails: faults are logged and dropped.
    pub fn handle(&mut self, id: &ConnectionId, event: InboundEvent) -> EventOutcome {
        let result = match event {
            InboundEvent::Connect => self.connect(id),
            InboundEvent::Client(ClientEvent::FindPartner) => self.find_partner(id),
            InboundEvent::Client(ClientEvent::Chat(message)) => {
                relay::chat(&self.registry, &self.outbox, id, message)
                    .map(|r| relayed(r, "chat"))
            }
            InboundEvent::Client(ClientEvent::Typing(is_typing)) => {
                relay::typing(&mut self.registry, &self.outbox, id, is_typing)
                    .map(|r| relayed(r, "typing"))
            }
            InboundEvent::Client(ClientEvent::EndConversation) => self.end_conversation(id),
            InboundEvent::Disconnect { reason } => self.disconnect(id, reason),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(fault) => {
                log_fault(&fault);
                EventOutcome::Dropped(fault)
            }
        };
        self.record(&outcome);
        outcome
    }

    fn connect(&mut self, id: &ConnectionId) -> Result<EventOutcome, SessionFault> {
        self.registry.register(id.clone())?;
        tracing::info!(connection_id = %id, live = self.registry.len(), "Connection registered");
        if let Some(m) = &self.metrics {
            m.counter_inc("connections.total", &[], 1);
        }
        self.request_pair(id)
    }

    fn find_partner(&mut self, id: &ConnectionId) -> Result<EventOutcome, SessionFault> {
        let previous = self
            .registry
            .lookup(id)
            .ok_or_else(|| SessionFault::UnknownConnection(id.clone()))?
            .partner
            .clone();

        if let Some(previous) = previous {
            if self.config.require_unpair_before_repair {
                return Err(SessionFault::RepairRejected(id.clone()));
            }
            let mutual = self.registry.are_mutual(id, &previous);
            tracing::info!(
                connection_id = %id,
                previous_partner = %previous,
                mutual,
                "Re-pair while paired, previous partner is not notified"
            );
            if mutual && self.config.presence_accounting == PresenceAccounting::Exact {
                self.presence.remove_pair();
            }
        }

        self.request_pair(id)
    }

    fn request_pair(&mut self, id: &ConnectionId) -> Result<EventOutcome, SessionFault> {
        let outcome = match self.matchmaker.request_pair(&mut self.registry, id)? {
            PairOutcome::Paired { partner } => {
                self.outbox.send(id, ServerEvent::Paired);
                self.outbox.send(&partner, ServerEvent::Paired);
                self.presence.add_pair();
                tracing::info!(
                    connection_id = %id,
                    partner_id = %partner,
                    active_count = self.presence.active(),
                    "Connections paired"
                );
                EventOutcome::Paired { partner }
            }
            PairOutcome::Queued => {
                tracing::debug!(connection_id = %id, "Waiting for a partner");
                EventOutcome::Queued
            }
        };
        self.broadcast_presence();
        Ok(outcome)
    }

    /// The connection asked to leave its conversation but stays connected.
    fn end_conversation(&mut self, id: &ConnectionId) -> Result<EventOutcome, SessionFault> {
        let partner = self
            .registry
            .lookup(id)
            .ok_or_else(|| SessionFault::UnknownConnection(id.clone()))?
            .partner
            .clone();
        let mutual = partner
            .as_ref()
            .is_some_and(|p| self.registry.are_mutual(id, p));
        let cascade = partner
            .as_ref()
            .is_some_and(|p| self.cascades_to(p, mutual));

        self.release_ticket(id, partner.as_ref(), None, !cascade);

        if let Some(conn) = self.registry.lookup_mut(id) {
            conn.reset();
        }

        let notified = match partner {
            Some(p) if cascade => {
                self.end_for_partner(&p, None);
                Some(p)
            }
            _ => None,
        };
        self.outbox.send(id, ServerEvent::ended(EndedBy::Requester, None));

        match self.config.presence_accounting {
            PresenceAccounting::Inherited => self.presence.remove_pair(),
            PresenceAccounting::Exact if notified.is_some() => self.presence.remove_pair(),
            PresenceAccounting::Exact => {}
        }

        tracing::info!(
            connection_id = %id,
            partner_id = ?notified,
            mutual,
            active_count = self.presence.active(),
            "Conversation ended by request"
        );
        self.broadcast_presence();
        Ok(EventOutcome::Ended { partner: notified })
    }

    /// The transport lost the connection. It cannot be notified any more.
    fn disconnect(
        &mut self,
        id: &ConnectionId,
        reason: Option<String>,
    ) -> Result<EventOutcome, SessionFault> {
        let conn = self
            .registry
            .remove(id)
            .ok_or_else(|| SessionFault::DuplicateDisconnect(id.clone()))?;
        let partner = conn.partner;

        let cascade = partner.as_ref().is_some_and(|p| {
            let mutual = self.registry.lookup(p).is_some_and(|c| c.is_paired_with(id));
            self.cascades_to(p, mutual)
        });

        let released = self.release_ticket(id, partner.as_ref(), reason.clone(), !cascade);

        let notified = match partner {
            Some(p) if cascade => {
                self.end_for_partner(&p, reason.clone());
                self.presence.remove_pair();
                Some(p)
            }
            _ => None,
        };

        if released && self.config.presence_accounting == PresenceAccounting::Inherited {
            self.presence.remove_one();
        }

        tracing::info!(
            connection_id = %id,
            partner_id = ?notified,
            reason = reason.as_deref().unwrap_or(""),
            active_count = self.presence.active(),
            live = self.registry.len(),
            "Connection removed"
        );
        self.broadcast_presence();
        Ok(EventOutcome::Disconnected { partner: notified })
    }

    /// Whether ending a conversation reaches `partner`.
    ///
    /// A mutual partner always is. With permissive re-pairing and inherited
    /// accounting, any live partner is, even one that has since re-paired
    /// elsewhere; it is reset and its new partner keeps a one-sided link.
    fn cascades_to(&self, partner: &ConnectionId, mutual: bool) -> bool {
        if mutual {
            return true;
        }
        !self.config.require_unpair_before_repair
            && self.config.presence_accounting == PresenceAccounting::Inherited
            && self.registry.contains(partner)
    }

    fn end_for_partner(&mut self, partner: &ConnectionId, reason: Option<String>) {
        if let Some(conn) = self.registry.lookup_mut(partner) {
            conn.reset();
        }
        self.outbox
            .send(partner, ServerEvent::ended(EndedBy::Partner, reason));
    }

    /// Clear the waiting slot if `id` or `partner` holds it. A live holder
    /// other than `id` is reset to Idle, and told its wait ended when `notify`.
    fn release_ticket(
        &mut self,
        id: &ConnectionId,
        partner: Option<&ConnectionId>,
        reason: Option<String>,
        notify: bool,
    ) -> bool {
        let Some(holder) = self.matchmaker.ticket_mut().clear_if_held_by(id, partner) else {
            return false;
        };
        if &holder != id {
            if let Some(conn) = self.registry.lookup_mut(&holder) {
                conn.reset();
                if notify {
                    self.outbox
                        .send(&holder, ServerEvent::ended(EndedBy::Partner, reason));
                }
                tracing::debug!(connection_id = %holder, "Removed from waiting slot");
            }
        }
        true
    }

    fn broadcast_presence(&self) {
        self.outbox.broadcast(self.presence.to_event());
    }

    fn record(&self, outcome: &EventOutcome) {
        let Some(m) = &self.metrics else { return };
        match outcome {
            EventOutcome::Paired { .. } => m.counter_inc("pairings.total", &[], 1),
            EventOutcome::Relayed { kind: "chat", .. } => m.counter_inc("relay.chat.total", &[], 1),
            EventOutcome::Relayed { .. } => m.counter_inc("relay.typing.total", &[], 1),
            EventOutcome::Dropped(fault) => {
                m.counter_inc("faults.total", &[("kind", fault.fault_kind())], 1);
                if let SessionFault::UnpairedPayload { event, .. } = fault {
                    m.counter_inc("payloads.dropped", &[("event", *event)], 1);
                }
            }
            _ => {}
        }
        m.gauge_set("presence.active", &[], self.presence.active() as f64);
        m.gauge_set("connections.live", &[], self.registry.len() as f64);
    }

    /// Check state, partner and waiting-slot consistency without requiring
    /// links to be mutual. One-sided links left by a permissive re-pair pass.
    pub fn check_links(&self) -> Result<(), String> {
        let holder = self.matchmaker.ticket().holder();

        for conn in self.registry.iter() {
            match (&conn.partner, conn.state) {
                (Some(_), SessionState::Paired) | (None, SessionState::Idle) => {}
                (None, SessionState::Queued) => {
                    if holder != Some(&conn.id) {
                        return Err(format!("{} is queued but does not hold the ticket", conn.id));
                    }
                }
                (partner, state) => {
                    return Err(format!(
                        "{} is {} with partner {:?}",
                        conn.id,
                        state.as_str(),
                        partner
                    ));
                }
            }
        }

        if let Some(h) = holder {
            match self.registry.lookup(h) {
                Some(c) if c.state == SessionState::Queued && c.partner.is_none() => {}
                Some(c) => return Err(format!("ticket holder {h} is {}", c.state.as_str())),
                None => return Err(format!("ticket holder {h} is not live")),
            }
        }
        Ok(())
    }

    /// Check the pairing invariants. Returns the first violation found.
    ///
    /// Stale one-sided links left by a permissive re-pair are reported as
    /// violations; use [`Self::check_links`] on that path.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.check_links()?;

        let mut paired = 0u64;
        for conn in self.registry.iter() {
            if let Some(p) = &conn.partner {
                let back = self.registry.lookup(p).and_then(|c| c.partner.as_ref());
                if back != Some(&conn.id) {
                    return Err(format!("{} -> {} is not symmetric", conn.id, p));
                }
                paired += 1;
            }
        }

        if self.config.presence_accounting == PresenceAccounting::Exact
            && self.presence.active() != paired
        {
            return Err(format!(
                "presence {} but {} paired connections",
                self.presence.active(),
                paired
            ));
        }
        Ok(())
    }
}

fn relayed(outcome: RelayOutcome, kind: &'static str) -> EventOutcome {
    match outcome {
        RelayOutcome::Forwarded { to } => EventOutcome::Relayed { to, kind },
        RelayOutcome::Unchanged => EventOutcome::TypingUnchanged,
    }
}

fn log_fault(fault: &SessionFault) {
    if fault.is_invariant_violation() {
        tracing::warn!(
            connection_id = %fault.connection_id(),
            kind = fault.fault_kind(),
            "Dropping event: {fault}"
        );
    } else {
        tracing::debug!(
            connection_id = %fault.connection_id(),
            kind = fault.fault_kind(),
            "Dropping event: {fault}"
        );
    }
}
