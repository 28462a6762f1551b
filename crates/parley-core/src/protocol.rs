use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::state::{Message, Role};

/// One prior message as sent in the outbound `history` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Client → server envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEnvelope {
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
}

impl OutboundEnvelope {
    pub fn send_message(text: &str, session_id: Option<&str>, history: &[HistoryEntry]) -> Self {
        Self {
            action: "sendMessage",
            text: Some(text.to_string()),
            session_id: session_id.map(str::to_string),
            history: if history.is_empty() {
                None
            } else {
                Some(history.to_vec())
            },
        }
    }

    pub fn ping() -> Self {
        Self {
            action: "ping",
            text: None,
            session_id: None,
            history: None,
        }
    }

    pub fn to_json(&self) -> ChatResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Wire shape shared by WebSocket frames and HTTP replies.
///
/// Every field is optional; which ones are present decides the event kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReply {
    pub response_chunk: Option<String>,
    pub response: Option<String>,
    pub audio_url: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
    /// Transcription of an uploaded recording (speech endpoint only)
    pub text: Option<String>,
}

/// Server → client event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Chunk {
        text: String,
        session_id: Option<String>,
    },
    Final {
        response: String,
        audio_url: Option<String>,
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
    /// Anything else (pong, acks); may still carry a session id
    Other {
        session_id: Option<String>,
    },
}

impl InboundEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            InboundEvent::Chunk { session_id, .. }
            | InboundEvent::Final { session_id, .. }
            | InboundEvent::Other { session_id } => session_id.as_deref(),
            InboundEvent::Error { .. } => None,
        }
    }
}

impl From<RawReply> for InboundEvent {
    fn from(raw: RawReply) -> Self {
        // A chunk wins even when empty: empty fragments are valid.
        if let Some(text) = raw.response_chunk {
            InboundEvent::Chunk {
                text,
                session_id: raw.session_id,
            }
        } else if let Some(response) = raw.response {
            InboundEvent::Final {
                response,
                audio_url: raw.audio_url,
                session_id: raw.session_id,
            }
        } else if let Some(message) = raw.error {
            InboundEvent::Error { message }
        } else {
            InboundEvent::Other {
                session_id: raw.session_id,
            }
        }
    }
}

/// Parse one inbound text frame.
pub fn parse_inbound(frame: &str) -> ChatResult<InboundEvent> {
    let raw: RawReply = serde_json::from_str(frame)
        .map_err(|e| ChatError::Protocol(format!("unparseable frame: {}", e)))?;
    Ok(raw.into())
}
