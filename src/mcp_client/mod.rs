//! MCP Client: JSON-RPC over stdio to a single supervised tool backend.
//!
//! This module handles:
//! - Line-delimited JSON-RPC framing over the backend's stdio
//! - Spawning, handshaking, and restarting the backend process
//! - Correlating concurrent requests with responses by id
//! - Single, batched, and progress-reporting tool calls
//! - The per-session tool catalog and call-site validation

pub mod catalog;
pub mod client;
pub mod errors;
pub mod pending;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use catalog::{ToolCatalog, ToolSet};
pub use client::{McpClient, DEFAULT_MAX_CONCURRENCY};
pub use errors::McpError;
pub use supervisor::{
    BackendLauncher, BackendPipes, CommandLauncher, ProcessState, ProcessStatus, ProcessSupervisor,
};
pub use types::{BackendConfig, ContentBlock, ToolCallRequest, ToolCallResult, ToolSchema};
