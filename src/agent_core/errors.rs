//! Agent Core error types.

use thiserror::Error;

use crate::inference::ProviderError;

/// Why a conversation turn ended in `Failed`.
#[derive(Debug, Clone, Error)]
pub enum ConversationFailure {
    /// The caller cancelled the turn.
    #[error("cancelled")]
    Cancelled,

    /// The tool backend exhausted its restart budget.
    #[error("tool backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// The tool catalog could not be loaded, even after a retry.
    #[error("tool catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    /// The provider failed or replied with nothing usable.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The tool loop ran for the maximum number of iterations without a final answer.
    #[error("tool loop budget exhausted after {limit} iterations")]
    IterationBudgetExhausted { limit: usize },
}
