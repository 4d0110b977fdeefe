//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the backend
//! configuration consumed by the supervisor.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::McpError;

/// MCP protocol revision sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names used on the wire.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PROGRESS: &str = "notifications/progress";
    pub const SHUTDOWN: &str = "shutdown";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<String>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response (success or error). The id is normalised to a string.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: String,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One decoded record read from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Fire-and-forget message from the backend.
    Notification { method: String, params: Option<Value> },
    /// Request initiated by the backend. We do not serve these.
    ServerRequest { id: String, method: String },
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Behavioural hints a backend may attach to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
}

/// Tool schema as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

/// Name prefixes treated as read-only when a tool carries no annotations.
const READ_ONLY_PREFIXES: &[&str] = &["read_", "get_", "list_"];

impl ToolSchema {
    /// Whether the tool only reads state, so it can share a batch with others.
    pub fn is_read_only(&self) -> bool {
        if let Some(hint) = self.annotations.as_ref().and_then(|a| a.read_only_hint) {
            return hint;
        }
        READ_ONLY_PREFIXES
            .iter()
            .any(|prefix| self.name.starts_with(prefix))
    }

    /// Field names listed under the schema's `required` array.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default()
    }
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// A typed content block inside a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        data: String,
        #[serde(default, rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Raw `tools/call` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "structuredContent")]
    pub structured_content: Option<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Parse a `tools/call` result. A result that is not an object (a bare
    /// array of rows, say) is kept whole as structured content.
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        if !value.is_object() {
            return Ok(Self {
                content: Vec::new(),
                structured_content: (!value.is_null()).then_some(value),
                is_error: false,
            });
        }
        serde_json::from_value(value).map_err(|e| McpError::Protocol {
            reason: format!("failed to parse tools/call result: {e}"),
        })
    }
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// A single tool invocation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRequest {
    name: String,
    arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Build from an arbitrary JSON value. `null` means no arguments;
    /// anything other than an object is rejected.
    pub fn from_value(name: impl Into<String>, arguments: Value) -> Result<Self, McpError> {
        let name = name.into();
        match arguments {
            Value::Object(map) => Ok(Self::new(name, map)),
            Value::Null => Ok(Self::new(name, Map::new())),
            other => Err(McpError::InvalidArguments {
                tool: name,
                reason: format!("arguments must be a JSON object, got {other}"),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// `tools/call` params for this request.
    pub(crate) fn to_params(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "arguments": self.arguments,
        })
    }
}

/// Outcome of a tool call as seen by the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallResult {
    Ok(Vec<ContentBlock>),
    Error(String),
}

impl ToolCallResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolCallResult::Ok(_))
    }

    /// Readable text for the result: joined text blocks, or the error message.
    pub fn text(&self) -> String {
        match self {
            ToolCallResult::Ok(blocks) => blocks_to_text(blocks),
            ToolCallResult::Error(message) => message.clone(),
        }
    }
}

impl From<CallToolResult> for ToolCallResult {
    fn from(mut raw: CallToolResult) -> Self {
        // Structured output stands in for missing text content, as JSON.
        if let Some(structured) = raw.structured_content.take() {
            if !raw.content.iter().any(|b| matches!(b, ContentBlock::Text { .. })) {
                raw.content.push(ContentBlock::Text {
                    text: structured.to_string(),
                });
            }
        }
        if raw.is_error {
            let text = blocks_to_text(&raw.content);
            let message = if text.is_empty() {
                "tool reported an error".to_string()
            } else {
                text
            };
            ToolCallResult::Error(message)
        } else {
            ToolCallResult::Ok(raw.content)
        }
    }
}

fn blocks_to_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { mime_type, .. } if mime_type.is_empty() => "[image]".to_string(),
            ContentBlock::Image { mime_type, .. } => format!("[image: {mime_type}]"),
            ContentBlock::Resource { resource } => resource
                .get("text")
                .and_then(|t| t.as_str())
                .map(String::from)
                .unwrap_or_else(|| resource.to_string()),
            ContentBlock::Unknown => "[unsupported content]".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Backend Configuration ───────────────────────────────────────────────────

/// How to launch and supervise the tool backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_restart_base_delay_ms() -> u64 {
    1_000
}
fn default_max_concurrency() -> usize {
    5
}

impl BackendConfig {
    /// Config for `command` with every other field at its default.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            startup_timeout_secs: default_startup_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_base_delay_ms: default_restart_base_delay_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_without_mime_type_still_parses() {
        let raw = CallToolResult::from_value(serde_json::json!({
            "content": [
                {"type": "image", "data": "iVBORw0KGgo="},
                {"type": "text", "text": "chart attached"}
            ]
        }))
        .unwrap();
        let result = ToolCallResult::from(raw);
        assert_eq!(result.text(), "[image]\nchart attached");
    }

    #[test]
    fn test_structured_content_becomes_json_text() {
        let rows = serde_json::json!([["Name", "Age", "City"], ["John", 30, "NYC"]]);

        let bare = ToolCallResult::from(CallToolResult::from_value(rows.clone()).unwrap());
        let parsed: Value = serde_json::from_str(&bare.text()).unwrap();
        assert_eq!(parsed, rows);

        let wrapped = CallToolResult::from_value(serde_json::json!({
            "content": [],
            "structuredContent": {"rows": rows}
        }))
        .unwrap();
        assert_eq!(
            ToolCallResult::from(wrapped).text(),
            r#"{"rows":[["Name","Age","City"],["John",30,"NYC"]]}"#
        );

        // Text content wins when the backend sends both.
        let both = CallToolResult::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "2 rows"}],
            "structuredContent": {"rows": 2}
        }))
        .unwrap();
        assert_eq!(ToolCallResult::from(both).text(), "2 rows");
    }

    #[test]
    fn test_request_serialization_omits_missing_params() {
        let req = JsonRpcRequest::new("7", "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","id":"7","method":"tools/list"}"#);
    }

    #[test]
    fn test_tool_call_request_keeps_argument_order() {
        let req = ToolCallRequest::from_value(
            "read_data_from_excel",
            serde_json::json!({"worksheet_name": "Sheet1", "file_path": "a.xlsx", "range": "A1:C3"}),
        )
        .unwrap();
        let keys: Vec<&String> = req.arguments().keys().collect();
        assert_eq!(keys, vec!["worksheet_name", "file_path", "range"]);

        let params = serde_json::to_string(&req.to_params()).unwrap();
        assert!(params.starts_with(r#"{"name":"read_data_from_excel","arguments":{"worksheet_name""#));
    }

    #[test]
    fn test_tool_call_request_rejects_non_object() {
        let err = ToolCallRequest::from_value("t", serde_json::json!([1, 2])).unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));

        let empty = ToolCallRequest::from_value("t", Value::Null).unwrap();
        assert!(empty.arguments().is_empty());
    }

    #[test]
    fn test_content_blocks_deserialize_with_unknown_type() {
        let raw: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "audio", "data": "zzz"}
            ]
        }))
        .unwrap();
        assert_eq!(raw.content.len(), 3);
        assert_eq!(raw.content[2], ContentBlock::Unknown);

        let result = ToolCallResult::from(raw);
        assert_eq!(result.text(), "hello\n[image: image/png]\n[unsupported content]");
    }

    #[test]
    fn test_is_error_result_becomes_error_variant() {
        let raw: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "sheet not found"}],
            "isError": true
        }))
        .unwrap();
        assert_eq!(
            ToolCallResult::from(raw),
            ToolCallResult::Error("sheet not found".into())
        );
    }

    #[test]
    fn test_read_only_detection() {
        let annotated: ToolSchema = serde_json::from_value(serde_json::json!({
            "name": "write_data_to_excel",
            "annotations": {"readOnlyHint": true}
        }))
        .unwrap();
        assert!(annotated.is_read_only());

        let by_name: ToolSchema =
            serde_json::from_value(serde_json::json!({"name": "read_data_from_excel"})).unwrap();
        assert!(by_name.is_read_only());

        let writer: ToolSchema =
            serde_json::from_value(serde_json::json!({"name": "write_data_to_excel"})).unwrap();
        assert!(!writer.is_read_only());

        let overridden: ToolSchema = serde_json::from_value(serde_json::json!({
            "name": "get_and_clear",
            "annotations": {"readOnlyHint": false}
        }))
        .unwrap();
        assert!(!overridden.is_read_only());
    }

    #[test]
    fn test_required_fields() {
        let schema: ToolSchema = serde_json::from_value(serde_json::json!({
            "name": "read_data_from_excel",
            "inputSchema": {"type": "object", "required": ["file_path", "worksheet_name"]}
        }))
        .unwrap();
        assert_eq!(schema.required_fields(), vec!["file_path", "worksheet_name"]);
    }

    #[test]
    fn test_backend_config_defaults() {
        let config: BackendConfig = serde_yaml::from_str("command: excel-mcp").unwrap();
        assert_eq!(config.startup_timeout_secs, 30);
        assert_eq!(config.shutdown_grace_secs, 5);
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.restart_base_delay_ms, 1_000);
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
    }
}
