use std::collections::hash_map::Entry;
use std::collections::HashMap;

use epsile_core::errors::SessionFault;
use epsile_core::ids::ConnectionId;

/// Where a connection sits in the pairing lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Queued,
    Paired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Paired => "paired",
        }
    }
}

/// Per-connection session record.
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub partner: Option<ConnectionId>,
    /// Last typing indicator forwarded to the partner.
    pub is_typing: bool,
    pub state: SessionState,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            partner: None,
            is_typing: false,
            state: SessionState::Idle,
        }
    }

    pub fn is_paired_with(&self, other: &ConnectionId) -> bool {
        self.state == SessionState::Paired && self.partner.as_ref() == Some(other)
    }

    pub(crate) fn pair_with(&mut self, partner: ConnectionId) {
        self.partner = Some(partner);
        self.is_typing = false;
        self.state = SessionState::Paired;
    }

    pub(crate) fn queue(&mut self) {
        self.partner = None;
        self.state = SessionState::Queued;
    }

    pub(crate) fn reset(&mut self) {
        self.partner = None;
        self.is_typing = false;
        self.state = SessionState::Idle;
    }
}

/// Every live connection, keyed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    total_registered: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an Idle connection. Fails if the id is already live.
    pub fn register(&mut self, id: ConnectionId) -> Result<&mut Connection, SessionFault> {
        match self.connections.entry(id) {
            Entry::Occupied(existing) => {
                Err(SessionFault::DuplicateConnection(existing.key().clone()))
            }
            Entry::Vacant(slot) => {
                self.total_registered += 1;
                let id = slot.key().clone();
                Ok(slot.insert(Connection::new(id)))
            }
        }
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn lookup_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. Absent ids are a no-op.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// True when `a` and `b` are both live and point at each other.
    pub fn are_mutual(&self, a: &ConnectionId, b: &ConnectionId) -> bool {
        match (self.lookup(a), self.lookup(b)) {
            (Some(ca), Some(cb)) => ca.is_paired_with(b) && cb.is_paired_with(a),
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections ever registered, including ones since removed.
    pub fn total_registered(&self) -> u64 {
        self.total_registered
    }
}
