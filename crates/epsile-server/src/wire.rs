//! Text-frame codec: one JSON object per WebSocket frame,
//! `{"event": <name>, "data": <payload>}`.

use epsile_core::events::{ClientEvent, ServerEvent};

/// Default upper bound on an inbound frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("failed to encode event: {0}")]
    Encode(String),
}

impl WireError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "too_large",
            Self::Malformed(_) => "malformed",
            Self::Encode(_) => "encode",
        }
    }
}

/// Decode a client frame, rejecting anything over `max_bytes`.
pub fn decode(raw: &str, max_bytes: usize) -> Result<ClientEvent, WireError> {
    if raw.len() > max_bytes {
        return Err(WireError::TooLarge {
            len: raw.len(),
            max: max_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|e| WireError::Malformed(e.to_string()))
}

pub fn encode(event: &ServerEvent) -> Result<String, WireError> {
    serde_json::to_string(event).map_err(|e| WireError::Encode(e.to_string()))
}

/// Frame sent back to a client whose frame could not be decoded.
pub fn error_frame(err: &WireError) -> Option<String> {
    encode(&ServerEvent::error(err.to_string())).ok()
}
