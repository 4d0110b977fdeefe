//! OpenAI-compatible conversation provider.
//!
//! Sends non-streaming chat completion requests to any endpoint that speaks
//! the OpenAI Chat Completions API, advertising the backend's tools in
//! function-calling format.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use uuid::Uuid;

use super::config::ProviderConfig;
use super::errors::ProviderError;
use super::provider::ConversationProvider;
use super::types::{ChatCompletionRequest, ChatMessage, ProviderReply, ToolCall, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── OpenAiCompatibleProvider ────────────────────────────────────────────────

/// Provider backed by an OpenAI-compatible HTTP endpoint.
pub struct OpenAiCompatibleProvider {
    http: HttpClient,
    config: ProviderConfig,
}

impl OpenAiCompatibleProvider {
    /// Create a provider. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        config.validate()?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ProviderError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ConversationProvider for OpenAiCompatibleProvider {
    async fn send_turn(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ProviderReply, ProviderError> {
        let url = self.config.completions_url();
        let offer_tools = !tools.is_empty();

        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: history,
            tools: offer_tools.then_some(tools),
            tool_choice: offer_tools.then_some("auto"),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = self.config.api_key() {
            request = request.bearer_auth(key);
        }

        tracing::debug!(
            model = %self.config.model,
            messages = history.len(),
            tools = tools.len(),
            "sending chat completion request"
        );

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                ProviderError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| ProviderError::MalformedReply {
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_response(&body_text)
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    #[serde(default)]
    id: Option<String>,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    /// Normally a JSON-encoded string; some servers send an object.
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse a chat completion body into a [`ProviderReply`].
///
/// Tool calls take precedence over text. A reply with neither is an error.
pub fn parse_response(body: &str) -> Result<ProviderReply, ProviderError> {
    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::MalformedReply {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::MalformedReply {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        let arguments = match tc.function.arguments {
            serde_json::Value::String(raw) if raw.trim().is_empty() => serde_json::json!({}),
            serde_json::Value::String(raw) => {
                serde_json::from_str(&raw).map_err(|e| ProviderError::MalformedReply {
                    reason: format!("invalid JSON in arguments for '{}': {e}", tc.function.name),
                })?
            }
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        tool_calls.push(ToolCall {
            id,
            name: tc.function.name,
            arguments,
        });
    }

    if !tool_calls.is_empty() {
        if let Some(text) = &content {
            tracing::debug!(text = %text, "provider sent text alongside tool calls, ignoring text");
        }
        return Ok(ProviderReply::ToolCalls(tool_calls));
    }

    content.map(ProviderReply::Text).ok_or(ProviderError::EmptyReply)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_reply() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Sheet1 has 3 rows."},"finish_reason":"stop"}]}"#;
        assert_eq!(
            parse_response(body).unwrap(),
            ProviderReply::Text("Sheet1 has 3 rows.".into())
        );
    }

    #[test]
    fn test_parse_tool_calls_in_order() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null,"tool_calls":[
            {"id":"call_a","type":"function","function":{"name":"read_data_from_excel","arguments":"{\"worksheet_name\":\"Sheet1\"}"}},
            {"id":"call_b","type":"function","function":{"name":"read_data_from_excel","arguments":"{\"worksheet_name\":\"Sheet2\"}"}}
        ]},"finish_reason":"tool_calls"}]}"#;
        match parse_response(body).unwrap() {
            ProviderReply::ToolCalls(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].id, "call_a");
                assert_eq!(calls[1].arguments["worksheet_name"], "Sheet2");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_ids_are_generated_and_object_arguments_accepted() {
        let body = r#"{"choices":[{"message":{"tool_calls":[
            {"function":{"name":"list_sheets","arguments":{"file_path":"a.xlsx"}}},
            {"id":"","function":{"name":"list_sheets","arguments":""}}
        ]}}]}"#;
        match parse_response(body).unwrap() {
            ProviderReply::ToolCalls(calls) => {
                assert!(calls[0].id.starts_with("call_"));
                assert_eq!(calls[0].arguments["file_path"], "a.xlsx");
                assert!(calls[1].id.starts_with("call_"));
                assert_ne!(calls[0].id, calls[1].id);
                assert_eq!(calls[1].arguments, serde_json::json!({}));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_reply_is_an_error() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  "}}]}"#;
        assert!(matches!(parse_response(body), Err(ProviderError::EmptyReply)));

        let no_choices = r#"{"choices":[]}"#;
        assert!(matches!(
            parse_response(no_choices),
            Err(ProviderError::MalformedReply { .. })
        ));
    }

    #[test]
    fn test_invalid_argument_json_is_malformed() {
        let body = r#"{"choices":[{"message":{"tool_calls":[
            {"id":"c1","function":{"name":"t","arguments":"{not json"}}
        ]}}]}"#;
        assert!(matches!(
            parse_response(body),
            Err(ProviderError::MalformedReply { .. })
        ));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = OpenAiCompatibleProvider::new(ProviderConfig::new("ftp://x", "m"))
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::ConfigError { .. }));

        let provider =
            OpenAiCompatibleProvider::new(ProviderConfig::new("http://localhost:11434/v1", "qwen2.5"))
                .unwrap();
        assert_eq!(provider.model(), "qwen2.5");
    }
}
