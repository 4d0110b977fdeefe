//! JSON-RPC over stdio framing.
//!
//! One JSON object per line, `\n`-terminated. The writer half serialises
//! concurrent senders; the reader half yields decoded records until the
//! stream closes. A garbled or truncated line is a terminal decode error,
//! not something to skip: it is the caller's signal that the backend is
//! unhealthy.

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{IncomingMessage, JsonRpcError, JsonRpcResponse};

/// Largest single frame accepted from the backend.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read half of a backend connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a backend connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Encode / Decode ─────────────────────────────────────────────────────────

/// Serialize one message as a newline-terminated frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, McpError> {
    let mut bytes = serde_json::to_vec(message).map_err(|e| McpError::Protocol {
        reason: format!("failed to serialize message: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Decode a single line (without its terminator) into a record.
pub fn decode_line(line: &str) -> Result<IncomingMessage, McpError> {
    let raw: RawMessage = serde_json::from_str(line).map_err(|e| McpError::TransportDecode {
        reason: format!("invalid JSON-RPC record: {e}"),
    })?;

    if let Some(version) = raw.jsonrpc.as_deref() {
        if version != "2.0" {
            return Err(McpError::TransportDecode {
                reason: format!("unsupported jsonrpc version '{version}'"),
            });
        }
    }

    let id = raw.id.map(normalize_id).transpose()?;

    match (id, raw.method) {
        (Some(id), Some(method)) => Ok(IncomingMessage::ServerRequest { id, method }),
        (None, Some(method)) => Ok(IncomingMessage::Notification {
            method,
            params: raw.params,
        }),
        (Some(id), None) => Ok(IncomingMessage::Response(JsonRpcResponse {
            id,
            result: raw.result,
            error: raw.error,
        })),
        // An error reply to a request the backend could not even identify.
        (None, None) if raw.error.is_some() => Ok(IncomingMessage::Response(JsonRpcResponse {
            id: String::new(),
            result: None,
            error: raw.error,
        })),
        (None, None) => Err(McpError::TransportDecode {
            reason: "record is neither a response nor a notification".into(),
        }),
    }
}

fn normalize_id(id: Value) -> Result<String, McpError> {
    match id {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(McpError::TransportDecode {
            reason: format!("unsupported id type: {other}"),
        }),
    }
}

/// Extract the result from a response, converting error objects to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ToolError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ToolError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Write half: one frame at a time, flushed after each.
pub struct FrameWriter {
    writer: Mutex<BoxedWriter>,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Encode and write one message.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let frame = encode(message)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| McpError::ProcessCrashed {
                reason: format!("failed to write to backend stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::ProcessCrashed {
            reason: format!("failed to flush backend stdin: {e}"),
        })
    }

    /// Close the write half. The backend sees end-of-input.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "closing backend stdin failed");
        }
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read half: yields records until the stream closes.
pub struct FrameReader {
    reader: BufReader<BoxedReader>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Read the next record.
    ///
    /// `Ok(None)` means the stream closed cleanly between records. A partial
    /// line at end-of-stream, invalid UTF-8, an oversized frame, or invalid
    /// JSON is an error.
    pub async fn next_message(&mut self) -> Result<Option<IncomingMessage>, McpError> {
        loop {
            self.buf.clear();
            let mut limited = (&mut self.reader).take(MAX_FRAME_BYTES as u64 + 1);
            let bytes_read = limited.read_until(b'\n', &mut self.buf).await.map_err(|e| {
                McpError::ProcessCrashed {
                    reason: format!("failed to read backend stdout: {e}"),
                }
            })?;

            if bytes_read == 0 {
                return Ok(None);
            }

            if self.buf.last() != Some(&b'\n') {
                let reason = if self.buf.len() > MAX_FRAME_BYTES {
                    format!("frame exceeds {MAX_FRAME_BYTES} bytes")
                } else {
                    format!("truncated frame of {} bytes at end of stream", self.buf.len())
                };
                return Err(McpError::TransportDecode { reason });
            }

            let line = std::str::from_utf8(&self.buf).map_err(|e| McpError::TransportDecode {
                reason: format!("frame is not valid UTF-8: {e}"),
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return decode_line(trimmed).map(Some);
        }
    }

    /// Turn the reader into a stream that ends at EOF or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<IncomingMessage, McpError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next_message().await {
                Ok(Some(message)) => Some((Ok(message), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
