//! Call-path classification.
//!
//! Decides whether a tool call should go through the progress-reporting path
//! (long-running bulk work the user should see narrated) or the standard
//! single/batched path. The shipped heuristic matches keywords in the user's
//! original request; anything smarter can be plugged in behind the trait.

use crate::inference::types::ToolCall;

/// Phrases that mark a request as a large data operation.
pub const DEFAULT_LARGE_OPERATION_KEYWORDS: &[&str] = &[
    "entire sheet",
    "entire workbook",
    "whole sheet",
    "whole workbook",
    "all data",
    "all rows",
    "every row",
    "all sheets",
    "bulk",
    "large dataset",
];

/// How a tool call is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPath {
    /// `call_tool`, or a batch when the call is independent of its neighbours.
    Standard,
    /// `call_tool_with_progress`, one call at a time.
    ProgressStreaming,
}

/// Chooses a [`CallPath`] for each tool call.
pub trait CallPathClassifier: Send + Sync {
    fn classify(&self, user_text: &str, call: &ToolCall) -> CallPath;
}

/// Case-insensitive keyword match on the user's request text.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl KeywordClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn is_large_operation(&self, user_text: &str) -> bool {
        let text = user_text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_LARGE_OPERATION_KEYWORDS.iter().copied())
    }
}

impl CallPathClassifier for KeywordClassifier {
    fn classify(&self, user_text: &str, _call: &ToolCall) -> CallPath {
        if self.is_large_operation(user_text) {
            CallPath::ProgressStreaming
        } else {
            CallPath::Standard
        }
    }
}
