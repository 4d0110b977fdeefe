//! Conversation provider: the AI side of the tool loop.
//!
//! This module handles:
//! - The [`ConversationProvider`] seam the orchestrator talks to
//! - An OpenAI-compatible HTTP implementation (non-streaming)
//! - Chat message and tool definition types in the Chat Completions shape
//!
//! Switching endpoints or models is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod provider;
pub mod types;

// Re-exports for convenience
pub use client::OpenAiCompatibleProvider;
pub use config::ProviderConfig;
pub use errors::ProviderError;
pub use provider::ConversationProvider;
pub use types::{ChatMessage, ProviderReply, Role, ToolCall, ToolDefinition};
