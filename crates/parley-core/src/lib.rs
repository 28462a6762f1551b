pub mod audio;
pub mod config;
pub mod connection;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod http;
pub mod jitter;
pub mod predict;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod timer;
pub mod transport;

// Re-export main types for convenience
pub use config::{Config, MergePolicy, TransportMode};
pub use connection::{ConnectionManager, ConnectionState, StatusChange};
pub use controller::{AudioStatus, BotStatus, ChatController, ChatHandle, ChatView, UserInput};
pub use conversation::{ConversationState, TurnPhase};
pub use error::{ChatError, ChatResult};
pub use http::ApiClient;
pub use scheduler::{ChunkScheduler, Fragment};
pub use state::{Message, Role, TurnId};
pub use transport::{Transport, WsTransport};
