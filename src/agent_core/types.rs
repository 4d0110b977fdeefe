//! Shared types for the agent core.
//!
//! Conversation history and the conversation state machine.

use serde::Serialize;

use crate::inference::types::{ChatMessage, Role, ToolCall};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// Payload of one history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// System prompt, user input, or final assistant text.
    Text { text: String },
    /// Tool calls the assistant requested.
    ToolCalls { calls: Vec<ToolCall> },
    /// The outcome of one tool call, as folded into history.
    ToolResult {
        call_id: String,
        tool_name: String,
        text: String,
        is_error: bool,
    },
}

/// A single entry in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: MessageContent,
    /// Which user turn produced this message (0 for the system prompt).
    pub turn_index: u32,
}

impl ConversationMessage {
    fn to_chat_message(&self) -> ChatMessage {
        match &self.content {
            MessageContent::Text { text } => ChatMessage {
                role: self.role,
                content: Some(text.clone()),
                tool_call_id: None,
                tool_calls: None,
            },
            MessageContent::ToolCalls { calls } => ChatMessage::assistant_tool_calls(calls),
            MessageContent::ToolResult { call_id, text, .. } => {
                ChatMessage::tool_result(call_id.clone(), text.clone())
            }
        }
    }
}

// ─── Conversation State ─────────────────────────────────────────────────────

/// Where a conversation is in its turn loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    AwaitingAIResponse,
    ExecutingTools,
    Done,
    /// Carries one human-readable reason.
    Failed(String),
}

impl ConversationState {
    pub fn can_transition_to(&self, next: &ConversationState) -> bool {
        use ConversationState::*;
        matches!(
            (self, next),
            (Idle | Done | Failed(_), AwaitingAIResponse)
                | (AwaitingAIResponse, Done | ExecutingTools | Failed(_))
                | (ExecutingTools, AwaitingAIResponse | Failed(_))
        )
    }

    /// Whether a new user message may start a turn.
    pub fn accepts_input(&self) -> bool {
        matches!(
            self,
            ConversationState::Idle | ConversationState::Done | ConversationState::Failed(_)
        )
    }
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// One conversation: append-only history plus its current state.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    history: Vec<ConversationMessage>,
    state: ConversationState,
    turn_index: u32,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Conversation {
    /// Start a conversation, optionally seeded with a system prompt.
    pub fn new(system_prompt: Option<&str>) -> Self {
        let mut history = Vec::new();
        if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
            history.push(ConversationMessage {
                role: Role::System,
                content: MessageContent::Text {
                    text: prompt.to_string(),
                },
                turn_index: 0,
            });
        }
        Self {
            history,
            state: ConversationState::Idle,
            turn_index: 0,
        }
    }

    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn turn_index(&self) -> u32 {
        self.turn_index
    }

    /// Final assistant text of the most recent turn, if it finished.
    pub fn last_reply(&self) -> Option<&str> {
        if self.state != ConversationState::Done {
            return None;
        }
        self.history.iter().rev().find_map(|m| match (&m.role, &m.content) {
            (Role::Assistant, MessageContent::Text { text }) => Some(text.as_str()),
            _ => None,
        })
    }

    /// History in the provider's message format.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.history
            .iter()
            .map(ConversationMessage::to_chat_message)
            .collect()
    }

    /// Open a new turn with the user's message.
    ///
    /// Refused while a turn is still in flight.
    pub(crate) fn begin_turn(&mut self, user_text: &str) -> bool {
        if !self.state.accepts_input() {
            tracing::warn!(turn = self.turn_index, state = ?self.state, "turn still in flight, input refused");
            return false;
        }
        if !self.transition(ConversationState::AwaitingAIResponse) {
            return false;
        }
        self.turn_index += 1;
        self.push(
            Role::User,
            MessageContent::Text {
                text: user_text.to_string(),
            },
        );
        true
    }

    pub(crate) fn push(&mut self, role: Role, content: MessageContent) {
        self.history.push(ConversationMessage {
            role,
            content,
            turn_index: self.turn_index,
        });
    }

    /// Apply a state change. Illegal transitions are refused and logged.
    pub(crate) fn transition(&mut self, next: ConversationState) -> bool {
        if !self.state.can_transition_to(&next) {
            tracing::error!(from = ?self.state, to = ?next, "refusing illegal conversation transition");
            return false;
        }
        tracing::debug!(turn = self.turn_index, from = ?self.state, to = ?next, "conversation state changed");
        self.state = next;
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
