use thiserror::Error;

/// Errors surfaced by the chat client.
///
/// The first four variants are the client's failure taxonomy; the rest wrap
/// library errors so `?` works at the HTTP and config boundaries.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport-level open/close/error on the WebSocket channel.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Inbound payload that could not be parsed or has no known shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No completion signal arrived within the safety window.
    #[error("Timed out after {0:?} without a response")]
    Timeout(std::time::Duration),

    /// The server answered with an explicit `{ "error": ... }` payload.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Text shown to the user in a system message.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Upstream(message) => format!("Error: {}", message),
            ChatError::Timeout(_) => {
                "The assistant stopped responding. Please try again.".to_string()
            }
            ChatError::Connection(_) => {
                "Could not reach the assistant. Check your connection and try again.".to_string()
            }
            other => format!("Error: {}", other),
        }
    }
}
