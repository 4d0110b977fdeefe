//! Progress events: ephemeral, fire-and-forget narration of what the core
//! is doing (subprocess health, tool starts/ends, warnings).
//!
//! Events flow through a bounded channel. Producers never block: when the
//! channel is full or the receiver is gone, the event is dropped and logged
//! at debug level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default capacity for progress channels created by [`progress_channel`].
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// What kind of event this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressCategory {
    Info,
    ToolStart,
    ToolEnd,
    Warning,
    Error,
}

/// A single progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub message: String,
    pub category: ProgressCategory,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Create an event stamped with the current time.
    pub fn new(category: ProgressCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
            timestamp: Utc::now(),
        }
    }
}

/// Sending half of a progress channel.
///
/// Cheap to clone. A disabled sink silently discards everything.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Wrap an existing sender.
    pub fn from_sender(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Whether events sent here can reach anyone.
    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Emit an event without waiting.
    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            tracing::debug!(error = %e, "progress event dropped");
        }
    }

    /// Shorthand for `emit(ProgressEvent::new(category, message))`.
    pub fn send(&self, category: ProgressCategory, message: impl Into<String>) {
        self.emit(ProgressEvent::new(category, message));
    }
}

/// Create a bounded progress channel.
pub fn progress_channel(capacity: usize) -> (ProgressSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressSink::from_sender(tx), rx)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
