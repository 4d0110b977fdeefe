//! MCP Client: high-level interface for tool execution.
//!
//! Correlates requests with responses over one backend connection and offers
//! single, batched, and progress-reporting tool calls plus the cached tool
//! listing. Every operation takes a [`CancellationToken`]; a timeout behaves
//! exactly like a cancellation from the backend's point of view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::catalog::{ToolCatalog, ToolSet};
use super::errors::McpError;
use super::pending::{PendingRequests, PendingTicket};
use super::supervisor::{
    BackendLauncher, CommandLauncher, Connection, ProcessStatus, ProcessSupervisor,
    SupervisorSettings,
};
use super::transport::extract_result;
use super::types::{
    methods, BackendConfig, CallToolResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult,
    ToolCallRequest, ToolCallResult,
};
use crate::progress::{ProgressCategory, ProgressSink};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for one tool call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of batched calls in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// How often a progress call reports that it is still waiting.
const PROGRESS_HEARTBEAT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages followed in one listing.
const MAX_LIST_PAGES: usize = 100;

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Client for one supervised tool backend.
pub struct McpClient {
    supervisor: ProcessSupervisor,
    pending: Arc<PendingRequests>,
    catalog: ToolCatalog,
    next_id: AtomicU64,
    call_timeout: Duration,
    max_concurrency: usize,
}

impl McpClient {
    /// Client that launches the configured executable.
    pub fn from_config(config: &BackendConfig, progress: ProgressSink) -> Self {
        Self::with_launcher(
            Arc::new(CommandLauncher::new(config.clone())),
            config,
            progress,
        )
    }

    /// Client over an arbitrary launcher. Supervisor events go to `progress`.
    pub fn with_launcher(
        launcher: Arc<dyn BackendLauncher>,
        config: &BackendConfig,
        progress: ProgressSink,
    ) -> Self {
        let pending = Arc::new(PendingRequests::new());
        let supervisor = ProcessSupervisor::new(
            launcher,
            SupervisorSettings::from(config),
            pending.clone(),
            progress,
        );
        let call_timeout = if config.call_timeout_secs == 0 {
            DEFAULT_CALL_TIMEOUT
        } else {
            config.call_timeout()
        };

        Self {
            supervisor,
            pending,
            catalog: ToolCatalog::new(),
            next_id: AtomicU64::new(1),
            call_timeout,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn status(&self) -> ProcessStatus {
        self.supervisor.status()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the backend ahead of the first call.
    pub async fn start(&self) -> Result<(), McpError> {
        self.supervisor.start().await
    }

    /// Stop the backend. In-flight calls fail with `BackendStopped`.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
        self.catalog.invalidate();
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    #[cfg(test)]
    pub(crate) fn set_next_request_id(&self, id: u64) {
        self.next_id.store(id, Ordering::Relaxed);
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<Connection>, McpError> {
        if cancel.is_cancelled() {
            return Err(McpError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            connection = self.supervisor.ensure_running() => connection,
        }
    }

    /// Send one request and wait for its result.
    ///
    /// `timeout` covers the whole request, including any wait for the backend
    /// to start or restart. With a `progress` sink the request carries `_meta.progressToken` set to
    /// its id, and backend progress notifications are forwarded to the sink.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Result<Value, McpError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let id = self.next_request_id();
        let timed_out = || McpError::Timeout {
            id: id.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let connection = tokio::select! {
            biased;
            connection = self.connect(cancel) => connection?,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(id = %id, method, "timed out waiting for backend to start");
                return Err(timed_out());
            }
        };

        let params = match (params, progress.is_some()) {
            (Some(Value::Object(mut map)), true) => {
                map.insert(
                    "_meta".to_string(),
                    serde_json::json!({ "progressToken": id }),
                );
                Some(Value::Object(map))
            }
            (params, _) => params,
        };

        let PendingTicket {
            completion,
            cancel: request_cancel,
        } = self
            .pending
            .register(&id, method, cancel.child_token(), progress)?;
        let guard = AbandonOnDrop {
            pending: &self.pending,
            id: &id,
        };

        if let Err(e) = connection
            .send(&JsonRpcRequest::new(id.clone(), method, params))
            .await
        {
            self.supervisor.report_failure(&connection, &e.to_string());
            return Err(e);
        }
        tracing::debug!(id = %id, method, generation = connection.generation(), "request sent");

        let outcome = tokio::select! {
            biased;
            outcome = completion => match outcome {
                Ok(Ok(response)) => extract_result(response),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(McpError::ProcessCrashed {
                    reason: "response channel closed".into(),
                }),
            },
            _ = request_cancel.cancelled() => {
                self.cancel_remote(&connection, &id, "cancelled by caller").await;
                Err(McpError::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.cancel_remote(&connection, &id, "timed out").await;
                Err(timed_out())
            }
            _ = connection.closed() => Err(McpError::ProcessCrashed {
                reason: "backend connection closed".into(),
            }),
        };

        drop(guard);
        outcome
    }

    /// Forget a request and tell the backend to stop working on it.
    async fn cancel_remote(&self, connection: &Connection, id: &str, reason: &str) {
        let Some(elapsed) = self.pending.abandon(id) else {
            return;
        };
        tracing::warn!(
            id,
            reason,
            elapsed_ms = elapsed.as_millis() as u64,
            "abandoning request"
        );
        let note = JsonRpcNotification::new(
            methods::CANCELLED,
            Some(serde_json::json!({ "requestId": id, "reason": reason })),
        );
        if let Err(e) = connection.send(&note).await {
            tracing::debug!(id, error = %e, "cancellation notice not delivered");
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute one tool call.
    ///
    /// Backend-reported failures (a JSON-RPC error or `isError: true`) come
    /// back as `Ok(ToolCallResult::Error(..))`. `Err` is reserved for
    /// transport, lifecycle, timeout, and cancellation failures. `timeout`
    /// defaults to the configured call timeout.
    pub async fn call_tool(
        &self,
        request: &ToolCallRequest,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, McpError> {
        self.dispatch(request, timeout, cancel, None).await
    }

    async fn dispatch(
        &self,
        request: &ToolCallRequest,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let timeout = timeout.unwrap_or(self.call_timeout);

        let outcome = self
            .request(
                methods::TOOLS_CALL,
                Some(request.to_params()),
                timeout,
                cancel,
                progress,
            )
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                let raw = CallToolResult::from_value(value)?;
                let result = ToolCallResult::from(raw);
                tracing::info!(
                    tool = %request.name(),
                    success = result.is_ok(),
                    elapsed_ms,
                    "tool call completed"
                );
                Ok(result)
            }
            Err(McpError::ToolError { code, message, .. }) => {
                tracing::warn!(tool = %request.name(), code, error = %message, elapsed_ms, "tool call returned an error");
                Ok(ToolCallResult::Error(format!("[{code}] {message}")))
            }
            Err(e) => {
                tracing::warn!(tool = %request.name(), error = %e, elapsed_ms, "tool call failed");
                Err(e)
            }
        }
    }

    /// Execute several tool calls with at most `max_concurrency` in flight.
    ///
    /// Results are in input order, one per request, and one call failing
    /// never affects the others. Cancelling `cancel` cancels every call in
    /// the batch that has not finished.
    pub async fn call_tools_batch(
        &self,
        requests: &[ToolCallRequest],
        max_concurrency: Option<usize>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Vec<Result<ToolCallResult, McpError>> {
        if requests.is_empty() {
            return Vec::new();
        }
        let limit = max_concurrency.unwrap_or(self.max_concurrency).max(1);
        let semaphore = Semaphore::new(limit);
        tracing::info!(calls = requests.len(), limit, "dispatching tool batch");

        let calls = requests.iter().map(|request| {
            let semaphore = &semaphore;
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(McpError::Cancelled),
                    permit = semaphore.acquire() => permit.map_err(|_| McpError::Cancelled)?,
                };
                self.call_tool(request, timeout, cancel).await
            }
        });

        futures::future::join_all(calls).await
    }

    /// Execute one tool call, narrating it on `sink`.
    ///
    /// Emits a "sent" event, an "awaiting" event followed by a heartbeat
    /// while the call runs,
    /// any progress notifications the backend sends, and a "received" event
    /// when it finishes. The sink never blocks the call.
    pub async fn call_tool_with_progress(
        &self,
        request: &ToolCallRequest,
        sink: &ProgressSink,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, McpError> {
        let name = request.name();
        let start = Instant::now();
        sink.send(ProgressCategory::Info, format!("sent {name} to backend"));
        sink.send(ProgressCategory::Info, format!("awaiting backend for {name}"));

        let call = self.dispatch(request, timeout, cancel, Some(sink.clone()));
        tokio::pin!(call);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + PROGRESS_HEARTBEAT,
            PROGRESS_HEARTBEAT,
        );

        let outcome = loop {
            tokio::select! {
                outcome = &mut call => break outcome,
                _ = heartbeat.tick() => {
                    sink.send(
                        ProgressCategory::Info,
                        format!("awaiting backend for {name} ({}s)", start.elapsed().as_secs()),
                    );
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis();
        match &outcome {
            Ok(ToolCallResult::Ok(_)) => sink.send(
                ProgressCategory::Info,
                format!("received {name} result in {elapsed_ms}ms"),
            ),
            Ok(ToolCallResult::Error(message)) => sink.send(
                ProgressCategory::Warning,
                format!("received {name} error in {elapsed_ms}ms: {message}"),
            ),
            Err(e) => sink.send(ProgressCategory::Error, format!("{name} failed: {e}")),
        }
        outcome
    }

    // ─── Catalog ─────────────────────────────────────────────────────────

    /// The backend's tools, fetched once per running session.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Arc<ToolSet>, McpError> {
        let connection = self.connect(cancel).await?;
        let generation = connection.generation();
        if let Some(tools) = self.catalog.get(generation) {
            return Ok(tools);
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let value = self
                .request(methods::TOOLS_LIST, params, self.call_timeout, cancel, None)
                .await?;
            let page: ListToolsResult =
                serde_json::from_value(value).map_err(|e| McpError::Protocol {
                    reason: format!("failed to parse tools/list result: {e}"),
                })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if cursor.is_some() {
            tracing::warn!(pages = MAX_LIST_PAGES, "tools/list pagination did not terminate, using what was fetched");
        }

        Ok(self.catalog.store(generation, tools))
    }
}

/// Removes a pending entry if the request future is dropped before it resolves.
struct AbandonOnDrop<'a> {
    pending: &'a PendingRequests,
    id: &'a str,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.abandon(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::supervisor::ProcessState;
    use crate::mcp_client::test_support::{FakeBackend, Reply};
    use crate::progress::progress_channel;
    use serde_json::json;

    fn fast_config() -> BackendConfig {
        let mut config = BackendConfig::new("fake-backend");
        config.startup_timeout_secs = 1;
        config.shutdown_grace_secs = 1;
        config.restart_base_delay_ms = 5;
        config
    }

    fn client(backend: &Arc<FakeBackend>) -> McpClient {
        McpClient::with_launcher(backend.clone(), &fast_config(), ProgressSink::disabled())
    }

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::from_value(name, args).unwrap()
    }

    #[tokio::test]
    async fn test_call_tool_returns_content() {
        let backend = FakeBackend::new(|method, params| match method {
            "tools/call" if params["name"] == "read_data_from_excel" => {
                assert_eq!(params["arguments"]["range"], "A1:C3");
                Reply::text("Name,Qty,Price\nApple,3,1.20\nPear,5,0.80")
            }
            _ => Reply::Result(json!({})),
        });
        let client = client(&backend);
        let request = call(
            "read_data_from_excel",
            json!({"file_path": "sales.xlsx", "worksheet_name": "Sheet1", "range": "A1:C3"}),
        );

        let result = client
            .call_tool(&request, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(result.text().contains("Apple,3,1.20"));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_backend_errors_become_error_results() {
        let backend = FakeBackend::new(|_, params| match params["name"].as_str() {
            Some("missing_sheet") => Reply::Result(json!({
                "content": [{"type": "text", "text": "Worksheet 'Sheet9' not found"}],
                "isError": true
            })),
            _ => Reply::Error {
                code: -32602,
                message: "Invalid params".into(),
            },
        });
        let client = client(&backend);
        let cancel = CancellationToken::new();

        let flagged = client
            .call_tool(&call("missing_sheet", json!({})), None, &cancel)
            .await
            .unwrap();
        assert_eq!(flagged, ToolCallResult::Error("Worksheet 'Sheet9' not found".into()));

        let rpc_error = client
            .call_tool(&call("anything", json!({})), None, &cancel)
            .await
            .unwrap();
        assert_eq!(rpc_error, ToolCallResult::Error("[-32602] Invalid params".into()));
    }

    #[tokio::test]
    async fn test_timeout_discards_late_response() {
        let backend = FakeBackend::new(|_, _| {
            Reply::after(Duration::from_millis(150), Reply::text("too late"))
        });
        let client = client(&backend);
        client.start().await.unwrap();
        client.set_next_request_id(42);

        let err = client
            .call_tool(
                &call("slow_tool", json!({})),
                Some(Duration::from_millis(30)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { id, .. } => assert_eq!(id, "42"),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(client.in_flight(), 0);

        // The late answer for 42 arrives and is dropped; the backend stays up.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.status().state, ProcessState::Running);
        assert_eq!(backend.cancelled_ids(), vec!["42".to_string()]);

        let next = client
            .call_tool(&call("slow_tool", json!({})), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next.text(), "too late");
        assert_eq!(backend.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_covers_backend_startup() {
        let backend = FakeBackend::echo();
        backend.hang_initialize(true);
        let client = client(&backend);

        let started = Instant::now();
        let err = client
            .call_tool(
                &call("read_data_from_excel", json!({})),
                Some(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 50, .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(client.in_flight(), 0);
        assert!(backend.called_tools().is_empty());

        // The interrupted start is recovered by the next caller.
        backend.hang_initialize(false);
        let result = client
            .call_tool(&call("read_data_from_excel", json!({})), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(client.status().state, ProcessState::Running);
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        // Sheet1 is slowest, Sheet3 fastest.
        let backend = FakeBackend::new(|_, params| {
            let sheet = params["arguments"]["worksheet_name"].as_str().unwrap_or("").to_string();
            let delay = match sheet.as_str() {
                "Sheet1" => 80,
                "Sheet2" => 40,
                _ => 5,
            };
            Reply::after(Duration::from_millis(delay), Reply::text(format!("rows of {sheet}")))
        });
        let client = client(&backend);
        let requests: Vec<ToolCallRequest> = ["Sheet1", "Sheet2", "Sheet3"]
            .iter()
            .map(|s| call("read_data_from_excel", json!({"file_path": "q.xlsx", "worksheet_name": s})))
            .collect();

        let results = client
            .call_tools_batch(&requests, None, None, &CancellationToken::new())
            .await;
        let texts: Vec<String> = results.into_iter().map(|r| r.unwrap().text()).collect();
        assert_eq!(texts, vec!["rows of Sheet1", "rows of Sheet2", "rows of Sheet3"]);
    }

    #[tokio::test]
    async fn test_batch_never_exceeds_concurrency_cap() {
        let backend = FakeBackend::new(|_, _| {
            Reply::after(Duration::from_millis(20), Reply::text("ok"))
        });
        let client = client(&backend);
        let requests: Vec<ToolCallRequest> = (0..12)
            .map(|i| call("get_cell", json!({"cell": format!("A{i}")})))
            .collect();

        let results = client
            .call_tools_batch(&requests, Some(3), None, &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(ToolCallResult::is_ok)));
        assert!(backend.max_in_flight() <= 3);
        assert!(backend.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let backend = FakeBackend::new(|_, params| match params["arguments"]["n"].as_i64() {
            Some(2) => Reply::NoReply,
            Some(3) => Reply::Error {
                code: -32000,
                message: "boom".into(),
            },
            _ => Reply::text("fine"),
        });
        let client = client(&backend);
        client.start().await.unwrap();
        let requests: Vec<ToolCallRequest> =
            (1..=4).map(|n| call("get_n", json!({"n": n}))).collect();

        let results = client
            .call_tools_batch(&requests, None, Some(Duration::from_millis(50)), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().text(), "fine");
        assert!(matches!(results[1], Err(McpError::Timeout { .. })));
        assert_eq!(
            results[2].as_ref().unwrap(),
            &ToolCallResult::Error("[-32000] boom".into())
        );
        assert_eq!(results[3].as_ref().unwrap().text(), "fine");
    }

    #[tokio::test]
    async fn test_cancelling_batch_cancels_every_pending_call() {
        let backend = FakeBackend::new(|_, _| Reply::NoReply);
        let client = client(&backend);
        let requests: Vec<ToolCallRequest> =
            (0..4).map(|i| call("get_n", json!({"n": i}))).collect();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let results = client
            .call_tools_batch(&requests, Some(2), Some(Duration::from_secs(10)), &cancel)
            .await;
        assert!(results.iter().all(|r| matches!(r, Err(McpError::Cancelled))));
        assert_eq!(client.in_flight(), 0);

        // Only the two admitted calls reached the backend; both were cancelled there.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.called_tools().len(), 2);
        assert_eq!(backend.cancelled_ids().len(), 2);
        assert_eq!(client.status().state, ProcessState::Running);
    }

    #[tokio::test]
    async fn test_crash_fails_in_flight_and_next_call_restarts() {
        let backend = FakeBackend::new(|_, params| match params["name"].as_str() {
            Some("crash") => Reply::Exit,
            _ => Reply::text("back"),
        });
        let client = client(&backend);
        let cancel = CancellationToken::new();

        let err = client
            .call_tool(&call("crash", json!({})), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ProcessCrashed { .. }));
        assert_eq!(client.status().state, ProcessState::Crashed);

        let result = client.call_tool(&call("ok", json!({})), None, &cancel).await.unwrap();
        assert_eq!(result.text(), "back");
        assert_eq!(backend.launch_count(), 2);
        assert_eq!(client.status().restart_count, 1);
    }

    #[tokio::test]
    async fn test_progress_call_narrates_and_forwards_backend_progress() {
        let backend = FakeBackend::new(|_, _| {
            Reply::Progress(
                vec!["read 500 rows".into(), "read 1000 rows".into()],
                Box::new(Reply::text("done")),
            )
        });
        let client = client(&backend);
        let (sink, mut rx) = progress_channel(16);

        let result = client
            .call_tool_with_progress(
                &call("read_data_from_excel", json!({"worksheet_name": "All"})),
                &sink,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.text(), "done");

        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            messages.push(event.message);
        }
        assert_eq!(messages[0], "sent read_data_from_excel to backend");
        assert_eq!(messages[1], "awaiting backend for read_data_from_excel");
        assert!(messages.contains(&"read 500 rows".to_string()));
        assert!(messages.contains(&"read 1000 rows".to_string()));
        assert!(messages.last().unwrap().starts_with("received read_data_from_excel result"));

        // The request carried its own id as the progress token.
        let sent = backend
            .received()
            .into_iter()
            .find(|m| m["method"] == "tools/call")
            .unwrap();
        assert_eq!(sent["params"]["_meta"]["progressToken"], sent["id"]);
    }

    #[tokio::test]
    async fn test_list_tools_paginates_and_caches_per_session() {
        let backend = FakeBackend::new(|method, params| match method {
            "tools/list" => match params["cursor"].as_str() {
                None => Reply::Result(json!({
                    "tools": [{"name": "read_data_from_excel"}],
                    "nextCursor": "page2"
                })),
                Some(_) => Reply::Result(json!({"tools": [{"name": "write_data_to_excel"}]})),
            },
            _ => Reply::Exit,
        });
        let client = client(&backend);
        let cancel = CancellationToken::new();

        let tools = client.list_tools(&cancel).await.unwrap();
        assert_eq!(tools.names(), vec!["read_data_from_excel", "write_data_to_excel"]);
        client.list_tools(&cancel).await.unwrap();
        let lists = || backend.received_methods().iter().filter(|m| *m == "tools/list").count();
        assert_eq!(lists(), 2);

        // A crash and restart invalidates the cache.
        let _ = client.call_tool(&call("boom", json!({})), None, &cancel).await;
        client.list_tools(&cancel).await.unwrap();
        assert_eq!(lists(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_fails_in_flight_with_backend_stopped() {
        let backend = FakeBackend::new(|_, _| Reply::NoReply);
        let client = Arc::new(client(&backend));

        let caller = client.clone();
        let handle = tokio::spawn(async move {
            caller
                .call_tool(&call("hang", json!({})), None, &CancellationToken::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.shutdown().await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::BackendStopped));
        assert_eq!(client.status().state, ProcessState::Stopped);
    }
}
