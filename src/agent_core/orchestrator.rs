//! Conversation orchestrator: the tool loop.
//!
//! One user message drives a loop of provider turns. Each turn either ends
//! the conversation with text or asks for tool calls, which are validated
//! against the catalog, dispatched (batched where independent, narrated where
//! the request looks like bulk work), and folded back into history in the
//! order the provider asked for them.
//!
//! Tool-level failures never escape the loop: they become error results the
//! provider can react to. Only cancellation, an unavailable backend, a
//! provider failure, or the iteration budget end a turn early.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::classifier::{CallPath, CallPathClassifier, KeywordClassifier, DEFAULT_LARGE_OPERATION_KEYWORDS};
use super::errors::ConversationFailure;
use super::types::{Conversation, ConversationState, MessageContent};
use crate::inference::types::{ProviderReply, Role, ToolCall, ToolDefinition};
use crate::inference::ConversationProvider;
use crate::mcp_client::{McpClient, McpError, ToolCallRequest, ToolCallResult, ToolSet};
use crate::progress::{ProgressCategory, ProgressSink};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Tuning for the tool loop. Deserializes from the `orchestrator` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Provider round-trips allowed per user message.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Tool result text is truncated to this many characters in history.
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    /// Seeded as the first history message of new conversations.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Phrases that route calls through the progress-reporting path.
    #[serde(default = "default_large_operation_keywords")]
    pub large_operation_keywords: Vec<String>,
    /// Per-call timeout override; the backend's call timeout when absent.
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
}

fn default_max_iterations() -> usize {
    25
}
fn default_max_tool_result_chars() -> usize {
    6_000
}
fn default_large_operation_keywords() -> Vec<String> {
    DEFAULT_LARGE_OPERATION_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tool_result_chars: default_max_tool_result_chars(),
            system_prompt: None,
            large_operation_keywords: default_large_operation_keywords(),
            tool_timeout_secs: None,
        }
    }
}

impl OrchestratorConfig {
    fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Drives conversations against one tool backend and one provider.
pub struct Orchestrator {
    client: Arc<McpClient>,
    provider: Arc<dyn ConversationProvider>,
    classifier: Arc<dyn CallPathClassifier>,
    progress: ProgressSink,
    config: OrchestratorConfig,
}

/// A tool call after call-site validation.
enum PreparedCall {
    Ready(ToolCallRequest),
    Rejected(String),
}

/// A run of calls dispatched together.
enum Segment {
    Batch(Vec<usize>),
    Single(usize, CallPath),
}

impl Orchestrator {
    pub fn new(
        client: Arc<McpClient>,
        provider: Arc<dyn ConversationProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        let classifier = Arc::new(KeywordClassifier::new(
            config.large_operation_keywords.iter().cloned(),
        ));
        Self {
            client,
            provider,
            classifier,
            progress: ProgressSink::disabled(),
            config,
        }
    }

    /// Replace the keyword heuristic with another classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn CallPathClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Send progress events (tool start/end, warnings, streamed progress) to `sink`.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = sink;
        self
    }

    /// A fresh conversation seeded with the configured system prompt.
    pub fn new_conversation(&self) -> Conversation {
        Conversation::new(self.config.system_prompt.as_deref())
    }

    /// Run one user message to completion.
    ///
    /// On success the conversation is `Done` and the final assistant text is
    /// returned. On failure it is `Failed` with the same message as the
    /// returned error. Cancelling `cancel` cancels every outstanding tool
    /// call but leaves the backend running.
    pub async fn send_message(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ConversationFailure> {
        if !conversation.begin_turn(user_text) {
            // Only reachable if a previous turn was abandoned mid-flight.
            conversation.transition(ConversationState::Failed("turn abandoned".into()));
            conversation.begin_turn(user_text);
        }
        tracing::info!(turn = conversation.turn_index(), "conversation turn started");

        let outcome = self.run_turn(conversation, user_text, cancel).await;
        match &outcome {
            Ok(_) => {
                conversation.transition(ConversationState::Done);
                tracing::info!(turn = conversation.turn_index(), "conversation turn finished");
            }
            Err(failure) => {
                conversation.transition(ConversationState::Failed(failure.to_string()));
                tracing::warn!(turn = conversation.turn_index(), error = %failure, "conversation turn failed");
                self.progress.send(ProgressCategory::Error, failure.to_string());
            }
        }
        outcome
    }

    async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ConversationFailure> {
        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(ConversationFailure::Cancelled);
            }

            let tools = self.load_catalog(cancel).await?;
            let definitions = tool_definitions(&tools);
            let history = conversation.to_chat_messages();

            tracing::debug!(iteration, messages = history.len(), "requesting provider turn");
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConversationFailure::Cancelled),
                reply = self.provider.send_turn(&history, &definitions) => reply?,
            };

            let calls = match reply {
                ProviderReply::Text(text) => {
                    conversation.push(Role::Assistant, MessageContent::Text { text: text.clone() });
                    return Ok(text);
                }
                ProviderReply::ToolCalls(calls) => calls,
            };

            conversation.transition(ConversationState::ExecutingTools);
            tracing::info!(iteration, calls = calls.len(), "executing tool calls");
            let results = self.execute_tool_calls(&tools, &calls, user_text, cancel).await?;

            // History only changes once every result is in.
            conversation.push(Role::Assistant, MessageContent::ToolCalls { calls: calls.clone() });
            for (call, result) in calls.iter().zip(results) {
                let text = truncate_tool_result(&result.text(), &call.name, self.config.max_tool_result_chars);
                conversation.push(
                    Role::Tool,
                    MessageContent::ToolResult {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        text,
                        is_error: !result.is_ok(),
                    },
                );
            }
            conversation.transition(ConversationState::AwaitingAIResponse);
        }

        Err(ConversationFailure::IterationBudgetExhausted {
            limit: self.config.max_iterations,
        })
    }

    /// Fetch the catalog, retrying once (the retry restarts a crashed backend).
    async fn load_catalog(&self, cancel: &CancellationToken) -> Result<Arc<ToolSet>, ConversationFailure> {
        let first = match self.client.list_tools(cancel).await {
            Ok(tools) => return Ok(tools),
            Err(e) => e,
        };
        if let Some(failure) = terminal_failure(&first) {
            return Err(failure);
        }
        tracing::warn!(error = %first, "tool catalog fetch failed, retrying once");

        match self.client.list_tools(cancel).await {
            Ok(tools) => Ok(tools),
            Err(e) => Err(terminal_failure(&e).unwrap_or(ConversationFailure::CatalogUnavailable {
                reason: e.to_string(),
            })),
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute one provider turn's calls. Results are in `calls` order.
    async fn execute_tool_calls(
        &self,
        tools: &ToolSet,
        calls: &[ToolCall],
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCallResult>, ConversationFailure> {
        let prepared: Vec<PreparedCall> = calls.iter().map(|call| prepare(tools, call)).collect();
        let mut results: Vec<Option<ToolCallResult>> = vec![None; calls.len()];
        let timeout = self.config.tool_timeout();

        for segment in self.plan(tools, calls, &prepared, user_text) {
            if cancel.is_cancelled() {
                return Err(ConversationFailure::Cancelled);
            }
            match segment {
                Segment::Batch(indices) => {
                    let requests: Vec<ToolCallRequest> = indices
                        .iter()
                        .filter_map(|&i| match &prepared[i] {
                            PreparedCall::Ready(request) => Some(request.clone()),
                            PreparedCall::Rejected(_) => None,
                        })
                        .collect();
                    for &i in &indices {
                        self.tool_started(&calls[i]);
                    }
                    let outcomes = self
                        .client
                        .call_tools_batch(&requests, None, timeout, cancel)
                        .await;
                    for (&i, outcome) in indices.iter().zip(outcomes) {
                        results[i] = Some(self.settle(&calls[i], outcome)?);
                    }
                }
                Segment::Single(i, path) => {
                    let outcome = match &prepared[i] {
                        PreparedCall::Rejected(reason) => {
                            tracing::warn!(tool = %calls[i].name, reason = %reason, "tool call rejected before dispatch");
                            Ok(ToolCallResult::Error(reason.clone()))
                        }
                        PreparedCall::Ready(request) => {
                            self.tool_started(&calls[i]);
                            match path {
                                CallPath::Standard => self.client.call_tool(request, timeout, cancel).await,
                                CallPath::ProgressStreaming => {
                                    self.client
                                        .call_tool_with_progress(request, &self.progress, timeout, cancel)
                                        .await
                                }
                            }
                        }
                    };
                    results[i] = Some(self.settle(&calls[i], outcome)?);
                }
            }
        }

        // Every index belongs to exactly one segment.
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| ToolCallResult::Error("tool call was not executed".into())))
            .collect())
    }

    /// Group calls into dispatch segments, preserving order.
    ///
    /// Contiguous runs of valid, read-only, standard-path calls form one
    /// batch. Everything else runs on its own.
    fn plan(
        &self,
        tools: &ToolSet,
        calls: &[ToolCall],
        prepared: &[PreparedCall],
        user_text: &str,
    ) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut run: Vec<usize> = Vec::new();

        for (i, call) in calls.iter().enumerate() {
            let path = self.classifier.classify(user_text, call);
            let batchable = matches!(prepared[i], PreparedCall::Ready(_))
                && path == CallPath::Standard
                && tools.is_read_only(&call.name);

            if batchable {
                run.push(i);
                continue;
            }
            flush_run(&mut segments, &mut run);
            segments.push(Segment::Single(i, path));
        }
        flush_run(&mut segments, &mut run);
        segments
    }

    /// Turn a call outcome into a result, or end the turn.
    fn settle(
        &self,
        call: &ToolCall,
        outcome: Result<ToolCallResult, McpError>,
    ) -> Result<ToolCallResult, ConversationFailure> {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                if let Some(failure) = terminal_failure(&e) {
                    return Err(failure);
                }
                ToolCallResult::Error(e.to_string())
            }
        };

        match &result {
            ToolCallResult::Ok(_) => {
                self.progress
                    .send(ProgressCategory::ToolEnd, format!("{} finished", call.name));
            }
            ToolCallResult::Error(message) => {
                self.progress
                    .send(ProgressCategory::Warning, format!("{} failed: {message}", call.name));
            }
        }
        Ok(result)
    }

    fn tool_started(&self, call: &ToolCall) {
        self.progress
            .send(ProgressCategory::ToolStart, format!("calling {}", call.name));
    }
}

fn flush_run(segments: &mut Vec<Segment>, run: &mut Vec<usize>) {
    match run.len() {
        0 => {}
        1 => segments.push(Segment::Single(run[0], CallPath::Standard)),
        _ => segments.push(Segment::Batch(std::mem::take(run))),
    }
    run.clear();
}

/// Call-site validation: arguments are an object and match the catalog.
fn prepare(tools: &ToolSet, call: &ToolCall) -> PreparedCall {
    let request = match ToolCallRequest::from_value(call.name.clone(), call.arguments.clone()) {
        Ok(request) => request,
        Err(e) => return PreparedCall::Rejected(e.to_string()),
    };
    match tools.validate_tool_call(&request) {
        Ok(()) => PreparedCall::Ready(request),
        Err(e) => PreparedCall::Rejected(e.to_string()),
    }
}

/// Errors that end the conversation rather than becoming a tool result.
fn terminal_failure(error: &McpError) -> Option<ConversationFailure> {
    match error {
        McpError::Cancelled => Some(ConversationFailure::Cancelled),
        _ if error.is_fatal() => Some(ConversationFailure::BackendUnavailable {
            reason: error.to_string(),
        }),
        _ => None,
    }
}

/// Tool schemas in the provider's function-calling format.
pub fn tool_definitions(tools: &ToolSet) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|tool| {
            let parameters = if tool.input_schema.is_null() {
                serde_json::json!({"type": "object", "properties": {}})
            } else {
                tool.input_schema.clone()
            };
            ToolDefinition::function(&tool.name, &tool.description, parameters)
        })
        .collect()
}

/// Truncate a tool result to `max_chars` characters.
fn truncate_tool_result(result: &str, tool_name: &str, max_chars: usize) -> String {
    let total = result.chars().count();
    if total <= max_chars {
        return result.to_string();
    }

    let truncated: String = result.chars().take(max_chars).collect();
    tracing::warn!(
        tool = %tool_name,
        original_len = total,
        truncated_to = max_chars,
        "tool result truncated"
    );
    format!("{truncated}\n\n[... truncated: showing first {max_chars} of {total} chars]")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
