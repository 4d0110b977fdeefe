//! The conversation provider seam.

use async_trait::async_trait;

use super::errors::ProviderError;
use super::types::{ChatMessage, ProviderReply, ToolDefinition};

/// Produces the next assistant turn from the history and available tools.
#[async_trait]
pub trait ConversationProvider: Send + Sync {
    async fn send_turn(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ProviderReply, ProviderError>;
}
