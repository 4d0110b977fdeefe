//! Agent Core: the conversation tool loop.
//!
//! Submodules:
//! - `orchestrator`: Drives provider turns and dispatches tool calls
//! - `classifier`: Chooses the standard or progress-reporting call path
//! - `types`: Conversation history and the conversation state machine
//! - `errors`: Why a conversation turn failed

pub mod classifier;
pub mod errors;
pub mod orchestrator;
pub mod types;

// Re-exports for convenience
pub use classifier::{CallPath, CallPathClassifier, KeywordClassifier};
pub use errors::ConversationFailure;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use types::{Conversation, ConversationMessage, ConversationState, MessageContent};
