//! MCP client error types.

use thiserror::Error;

/// Errors that can occur while talking to the tool backend.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The backend process could not be spawned.
    #[error("failed to spawn backend '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The backend did not answer its first request within the start timeout.
    #[error("backend did not complete startup within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    /// The initialization handshake was answered but unusable.
    #[error("backend initialization failed: {reason}")]
    InitFailed { reason: String },

    /// Malformed output from the backend (garbled line, truncated frame).
    #[error("malformed backend output: {reason}")]
    TransportDecode { reason: String },

    /// The backend exited or its streams broke while a session was running.
    #[error("backend crashed: {reason}")]
    ProcessCrashed { reason: String },

    /// Restart budget exhausted; the backend is gone for this session.
    #[error("backend unavailable after {attempts} restart attempts")]
    ProcessUnavailable { attempts: u32 },

    /// The backend was stopped deliberately while the request was in flight.
    #[error("backend stopped")]
    BackendStopped,

    /// A single call exceeded its deadline.
    #[error("request {id} ('{method}') timed out after {timeout_ms}ms")]
    Timeout {
        id: String,
        method: String,
        timeout_ms: u64,
    },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The backend answered with a JSON-RPC error object.
    #[error("tool error [{code}]: {message}")]
    ToolError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments failed call-site validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Request could not be serialized, or an id collided.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

impl McpError {
    /// Whether this error is fatal for the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, McpError::ProcessUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_fatal() {
        assert!(McpError::ProcessUnavailable { attempts: 3 }.is_fatal());
        assert!(!McpError::ProcessCrashed { reason: "gone".into() }.is_fatal());
        assert!(!McpError::BackendStopped.is_fatal());
    }

    #[test]
    fn test_timeout_message_names_id() {
        let err = McpError::Timeout {
            id: "42".into(),
            method: "tools/call".into(),
            timeout_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "request 42 ('tools/call') timed out after 1500ms"
        );
    }
}
