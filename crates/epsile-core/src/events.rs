use serde::{Deserialize, Serialize};

/// Named events a client may send. Wire shape: `{"event": <name>, "data": <payload>}`.
///
/// `new` and `disconn` are accepted as aliases for older clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(alias = "new")]
    FindPartner,
    /// Opaque payload, forwarded untouched.
    Chat(serde_json::Value),
    Typing(bool),
    #[serde(alias = "disconn")]
    EndConversation,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindPartner => "findPartner",
            Self::Chat(_) => "chat",
            Self::Typing(_) => "typing",
            Self::EndConversation => "endConversation",
        }
    }
}

/// Named events the server emits, either to one connection or to all of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Paired,
    ConversationEnded(EndNotice),
    Chat(serde_json::Value),
    Typing(bool),
    Presence(PresenceSnapshot),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn ended(who: EndedBy, reason: Option<String>) -> Self {
        Self::ConversationEnded(EndNotice { who, reason })
    }

    pub fn presence(active_count: u64) -> Self {
        Self::Presence(PresenceSnapshot { active_count })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorNotice {
            message: message.into(),
        })
    }
}

/// Which side of the conversation asked for it to end, from the receiver's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EndedBy {
    /// The receiver ended it (`who: 1`).
    Requester,
    /// The receiver's partner ended it or went away (`who: 2`).
    Partner,
}

impl From<EndedBy> for u8 {
    fn from(who: EndedBy) -> Self {
        match who {
            EndedBy::Requester => 1,
            EndedBy::Partner => 2,
        }
    }
}

impl TryFrom<u8> for EndedBy {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Requester),
            2 => Ok(Self::Partner),
            other => Err(format!("invalid `who` value: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndNotice {
    pub who: EndedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub active_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}
