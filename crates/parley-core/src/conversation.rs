//! The conversation log plus the one in-progress assistant message.
//!
//! Finalized messages live in an append-only list. The message being
//! streamed sits in a separate staging slot that records both what is shown
//! (`display`, which may still contain the predicted placeholder) and what the
//! server actually sent (`real`). Only `real` content is ever finalized.

use crate::config::MergePolicy;
use crate::protocol::HistoryEntry;
use crate::state::{Message, Role, TurnId};

/// Where the current turn is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Request sent, nothing shown yet
    AwaitingResponse,
    Streaming,
}

/// The assistant message currently being assembled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingSlot {
    pub turn: TurnId,
    pub placeholder: Option<String>,
    pub display: String,
    pub real: String,
    pub real_fragments: usize,
}

impl StreamingSlot {
    fn new(turn: TurnId, placeholder: Option<String>) -> Self {
        let display = placeholder.clone().unwrap_or_default();
        Self {
            turn,
            placeholder,
            display,
            real: String::new(),
            real_fragments: 0,
        }
    }

    fn showing_placeholder(&self) -> bool {
        self.placeholder
            .as_deref()
            .map_or(false, |placeholder| self.display == placeholder)
    }
}

#[derive(Debug, Default)]
pub struct ConversationState {
    log: Vec<Message>,
    next_order: u64,
    streaming: Option<StreamingSlot>,
    phase: TurnPhase,
    turn: TurnId,
    merge_policy: MergePolicy,
}

impl ConversationState {
    pub fn new(merge_policy: MergePolicy) -> Self {
        Self {
            merge_policy,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.log
    }

    pub fn streaming(&self) -> Option<&StreamingSlot> {
        self.streaming.as_ref()
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    /// Whether a turn is still waiting on the assistant
    pub fn in_flight(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    pub fn append_user_message(&mut self, text: &str) -> &Message {
        self.push(Role::User, text.to_string(), None)
    }

    pub fn append_system_message(&mut self, text: &str) -> &Message {
        self.push(Role::System, text.to_string(), None)
    }

    /// Prior user and assistant messages, oldest first, for the next request
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.log
            .iter()
            .filter(|message| message.role != Role::System)
            .map(HistoryEntry::from)
            .collect()
    }

    /// Close out whatever the previous turn left behind and start a new one.
    ///
    /// Real partial content from the previous turn is kept as a finalized
    /// message; a lone placeholder is dropped.
    pub fn reset_for_new_turn(&mut self) -> (TurnId, Option<Message>) {
        let finalized = if self.streaming.is_some() {
            tracing::debug!(turn = %self.turn, "force-finalizing previous turn");
            self.finalize_streaming(None, None)
        } else {
            None
        };
        self.turn = self.turn.next();
        self.phase = TurnPhase::AwaitingResponse;
        (self.turn, finalized)
    }

    /// Open the staging slot with a predicted placeholder. No-op if the
    /// current turn already has one or no turn is in flight.
    pub fn begin_streaming(&mut self, predicted: &str) -> bool {
        if self.phase == TurnPhase::Idle || self.streaming.is_some() {
            return false;
        }
        self.streaming = Some(StreamingSlot::new(self.turn, Some(predicted.to_string())));
        self.phase = TurnPhase::Streaming;
        true
    }

    /// Merge one real fragment into the staging slot, opening it if needed.
    /// Returns false when no turn is in flight.
    pub fn merge_fragment(&mut self, text: &str) -> bool {
        if self.phase == TurnPhase::Idle {
            return false;
        }
        let turn = self.turn;
        let policy = self.merge_policy;
        let slot = self
            .streaming
            .get_or_insert_with(|| StreamingSlot::new(turn, None));

        if slot.placeholder.is_some() && slot.real_fragments == 0 && policy == MergePolicy::Discard {
            slot.display.clear();
            slot.display.push_str(text);
        } else if slot.showing_placeholder() && slot.real_fragments < 2 {
            if replaces_placeholder(text) {
                slot.display = text.to_string();
            } else {
                slot.display.push_str(text);
            }
        } else {
            slot.display.push_str(text);
        }

        slot.real.push_str(text);
        slot.real_fragments += 1;
        self.phase = TurnPhase::Streaming;
        true
    }

    /// Move the staging slot into the log.
    ///
    /// Accumulated real content wins; `fallback` (the server's complete
    /// response) is used only when nothing real was streamed. With neither,
    /// the slot is discarded. The turn goes idle either way.
    pub fn finalize_streaming(
        &mut self,
        fallback: Option<&str>,
        audio_ref: Option<String>,
    ) -> Option<Message> {
        let slot = self.streaming.take();
        self.phase = TurnPhase::Idle;

        let content = match slot {
            Some(slot) if !slot.real.is_empty() => slot.real,
            _ => match fallback {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => return None,
            },
        };
        Some(self.push(Role::Assistant, content, audio_ref).clone())
    }

    /// End the turn after a failure, keeping any real partial content.
    pub fn fail_turn(&mut self) -> Option<Message> {
        self.finalize_streaming(None, None)
    }

    fn push(&mut self, role: Role, content: String, audio_ref: Option<String>) -> &Message {
        let order = self.next_order;
        self.next_order += 1;
        self.log.push(Message {
            role,
            content,
            audio_ref,
            order,
        });
        &self.log[self.log.len() - 1]
    }
}

// A capitalized or long opening fragment reads as the start of the real
// answer, so it takes the placeholder's place instead of trailing it.
fn replaces_placeholder(text: &str) -> bool {
    text.chars().next().map_or(false, char::is_uppercase) || text.chars().count() > 20
}
