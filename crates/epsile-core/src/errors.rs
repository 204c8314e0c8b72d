use crate::ids::ConnectionId;

/// Anomalies the session engine degrades to no-ops.
///
/// None of these cross the event boundary as a hard failure; they are logged,
/// counted, and the triggering event is dropped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionFault {
    // Transport misuse
    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    // Expected during normal churn
    #[error("{event} from unpaired connection {id}")]
    UnpairedPayload { id: ConnectionId, event: &'static str },
    #[error("connection already disconnected: {0}")]
    DuplicateDisconnect(ConnectionId),
    #[error("re-pair rejected, connection {0} is still paired")]
    RepairRejected(ConnectionId),
}

impl SessionFault {
    /// True when the fault means the transport broke its contract with the engine.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::DuplicateConnection(_) | Self::UnknownConnection(_))
    }

    /// Short classification string for logging/metrics.
    pub fn fault_kind(&self) -> &'static str {
        match self {
            Self::DuplicateConnection(_) => "duplicate_connection",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::UnpairedPayload { .. } => "unpaired_payload",
            Self::DuplicateDisconnect(_) => "duplicate_disconnect",
            Self::RepairRejected(_) => "repair_rejected",
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::DuplicateConnection(id)
            | Self::UnknownConnection(id)
            | Self::DuplicateDisconnect(id)
            | Self::RepairRejected(id) => id,
            Self::UnpairedPayload { id, .. } => id,
        }
    }
}
