//! In-flight request map.
//!
//! Every request the client writes is registered here first. The reader pump
//! resolves entries by id; the caller removes its own entry on timeout or
//! cancellation. Whoever removes an entry owns its resolution, so each id is
//! resolved at most once and a late response finds nothing to deliver to.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::types::JsonRpcResponse;
use crate::progress::{ProgressCategory, ProgressSink};

/// What a registered request eventually receives.
pub type Completion = Result<JsonRpcResponse, McpError>;

/// One outstanding request.
struct PendingRequest {
    method: String,
    submitted_at: Instant,
    completion: oneshot::Sender<Completion>,
    cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

/// Caller-side handle returned by [`PendingRequests::register`].
pub struct PendingTicket {
    pub completion: oneshot::Receiver<Completion>,
    pub cancel: CancellationToken,
}

/// Thread-safe map of in-flight requests keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request before it is written.
    ///
    /// `cancel` should be a child of the caller's token so that cancelling
    /// the caller reaches this request.
    pub fn register(
        &self,
        id: &str,
        method: &str,
        cancel: CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Result<PendingTicket, McpError> {
        let mut map = self.lock();
        if map.contains_key(id) {
            return Err(McpError::Protocol {
                reason: format!("request id {id} is already in flight"),
            });
        }

        let (tx, rx) = oneshot::channel();
        map.insert(
            id.to_string(),
            PendingRequest {
                method: method.to_string(),
                submitted_at: Instant::now(),
                completion: tx,
                cancel: cancel.clone(),
                progress,
            },
        );
        Ok(PendingTicket {
            completion: rx,
            cancel,
        })
    }

    /// Deliver a response. Returns `false` when no request is waiting for
    /// this id (late or unsolicited); the response is then dropped.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(entry) = self.lock().remove(&response.id) else {
            tracing::warn!(id = %response.id, "discarding response with no pending request");
            return false;
        };

        tracing::debug!(
            id = %response.id,
            method = %entry.method,
            elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
            "response matched"
        );
        entry.completion.send(Ok(response)).is_ok()
    }

    /// Remove a request without resolving it and cancel its token.
    ///
    /// Returns how long it had been pending, or `None` if it was already gone.
    pub fn abandon(&self, id: &str) -> Option<Duration> {
        let entry = self.lock().remove(id)?;
        entry.cancel.cancel();
        Some(entry.submitted_at.elapsed())
    }

    /// Fail every in-flight request. Used when the backend goes away.
    pub fn fail_all(&self, error: &McpError) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(id = %id, method = %entry.method, error = %error, "failing pending request");
            let _ = entry.completion.send(Err(error.clone()));
        }
        count
    }

    /// Forward a backend progress notification to the request it belongs to.
    pub fn report_progress(&self, id: &str, message: &str) -> bool {
        let sink = self.lock().get(id).and_then(|entry| entry.progress.clone());
        match sink {
            Some(sink) => {
                sink.send(ProgressCategory::Info, message);
                true
            }
            None => false,
        }
    }

    /// Whether a request with this id is still waiting.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
