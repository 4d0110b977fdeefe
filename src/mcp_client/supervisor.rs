//! Backend process supervision.
//!
//! Owns the subprocess: spawning, the `initialize` handshake, the reader pump
//! that feeds the in-flight map, crash detection, restart with exponential
//! backoff, and graceful shutdown. State changes go through
//! [`ProcessState::can_transition_to`] and each one is narrated as a
//! [`ProgressEvent`](crate::progress::ProgressEvent).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::pending::PendingRequests;
use super::transport::{extract_result, BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use super::types::{
    methods, BackendConfig, IncomingMessage, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, MCP_PROTOCOL_VERSION,
};
use crate::progress::{ProgressCategory, ProgressSink};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timing and restart policy for a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long the backend has to answer `initialize`.
    pub startup_timeout: Duration,
    /// How long to wait for a graceful exit before killing.
    pub shutdown_grace: Duration,
    /// Restart attempts allowed before the backend is declared unavailable.
    pub max_restart_attempts: u32,
    /// First backoff delay; doubles on each attempt.
    pub restart_base_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            max_restart_attempts: 3,
            restart_base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&BackendConfig> for SupervisorSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            max_restart_attempts: config.max_restart_attempts,
            restart_base_delay: Duration::from_millis(config.restart_base_delay_ms),
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of the backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
}

impl ProcessState {
    /// The legal edges of the lifecycle state machine.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Crashed)
                | (Running, Stopped)
                | (Crashed, Restarting)
                | (Crashed, Stopped)
                | (Restarting, Running)
                | (Restarting, Crashed)
                | (Restarting, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Crashed => "crashed",
            ProcessState::Restarting => "restarting",
        }
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    /// Restart attempts over the supervisor's lifetime.
    pub restart_count: u32,
    /// Restart attempts that failed since the backend was last running.
    pub failed_restarts: u32,
    pub last_started_at: Option<DateTime<Utc>>,
    /// Sequence number of the current (or last) running session.
    pub generation: u64,
    /// Set once the restart budget is exhausted.
    pub unavailable: bool,
}

struct StatusInner {
    state: ProcessState,
    restart_count: u32,
    failed_restarts: u32,
    last_started_at: Option<DateTime<Utc>>,
    generation: u64,
    next_generation: u64,
    unavailable: bool,
    connection: Option<Arc<Connection>>,
}

/// Shared between the supervisor and its reader pump.
struct StatusCell {
    inner: Mutex<StatusInner>,
    progress: ProgressSink,
}

impl StatusCell {
    fn new(progress: ProgressSink) -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: ProcessState::Stopped,
                restart_count: 0,
                failed_restarts: 0,
                last_started_at: None,
                generation: 0,
                next_generation: 1,
                unavailable: false,
                connection: None,
            }),
            progress,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ProcessStatus {
        let inner = self.lock();
        ProcessStatus {
            state: inner.state,
            restart_count: inner.restart_count,
            failed_restarts: inner.failed_restarts,
            last_started_at: inner.last_started_at,
            generation: inner.generation,
            unavailable: inner.unavailable,
        }
    }

    fn running_connection(&self) -> Option<Arc<Connection>> {
        let inner = self.lock();
        if inner.state == ProcessState::Running {
            inner.connection.clone()
        } else {
            None
        }
    }

    fn allocate_generation(&self) -> u64 {
        let mut inner = self.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        generation
    }

    /// Apply a transition and narrate it. Illegal transitions are refused.
    fn transition(&self, inner: &mut StatusInner, to: ProcessState, detail: &str) -> bool {
        let from = inner.state;
        if !from.can_transition_to(to) {
            tracing::error!(
                from = from.as_str(),
                to = to.as_str(),
                "refusing illegal backend state transition"
            );
            return false;
        }
        inner.state = to;
        if to != ProcessState::Running {
            inner.connection = None;
        }

        let category = match to {
            ProcessState::Crashed => ProgressCategory::Error,
            ProcessState::Restarting => ProgressCategory::Warning,
            ProcessState::Stopped if inner.unavailable => ProgressCategory::Error,
            _ => ProgressCategory::Info,
        };
        tracing::info!(
            from = from.as_str(),
            to = to.as_str(),
            restart_count = inner.restart_count,
            detail,
            "backend state changed"
        );
        self.progress
            .send(category, format!("backend {}: {detail}", to.as_str()));
        true
    }

    fn set(&self, to: ProcessState, detail: &str) -> bool {
        let mut inner = self.lock();
        self.transition(&mut inner, to, detail)
    }

    fn enter_running(&self, connection: Arc<Connection>) {
        let mut inner = self.lock();
        let generation = connection.generation;
        let detail = format!("session {generation} ready");
        if self.transition(&mut inner, ProcessState::Running, &detail) {
            inner.generation = generation;
            inner.failed_restarts = 0;
            inner.last_started_at = Some(Utc::now());
            inner.connection = Some(connection);
        }
    }

    /// Mark the given session crashed. Returns `false` if that session is no
    /// longer the live one (already stopped, already crashed, or replaced).
    fn mark_crashed(&self, generation: u64, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.state != ProcessState::Running || inner.generation != generation {
            return false;
        }
        self.transition(&mut inner, ProcessState::Crashed, reason)
    }
}

// ─── Launching ───────────────────────────────────────────────────────────────

/// Raw stdio of a freshly launched backend.
pub struct BackendPipes {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    /// The OS process, when there is one.
    pub child: Option<Child>,
}

/// Something that can bring up a backend and hand back its stdio.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self) -> Result<BackendPipes, McpError>;
}

/// Launches the configured executable as a child process.
pub struct CommandLauncher {
    config: BackendConfig,
}

impl CommandLauncher {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendLauncher for CommandLauncher {
    async fn launch(&self) -> Result<BackendPipes, McpError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent a console window from appearing for the backend
        #[cfg(target_os = "windows")]
        {
            #[allow(unused_imports)]
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            command: self.config.command.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            command: self.config.command.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            command: self.config.command.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, self.config.command.clone()));
        }

        tracing::info!(
            command = %self.config.command,
            args = ?self.config.args,
            pid = child.id(),
            "backend process spawned"
        );

        Ok(BackendPipes {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }
}

/// Longest stderr line kept in the log.
const MAX_STDERR_LINE: usize = 2000;

async fn forward_stderr(stderr: tokio::process::ChildStderr, command: String) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(mut line)) = lines.next_line().await {
        if line.len() > MAX_STDERR_LINE {
            let mut cut = MAX_STDERR_LINE;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str("...(truncated)");
        }
        tracing::debug!(backend = %command, stderr = %line, "backend stderr");
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// Write side of one running session, shared by every caller.
pub struct Connection {
    generation: u64,
    writer: FrameWriter,
    closed: CancellationToken,
}

impl Connection {
    /// Which session this connection belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one message to the backend.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        self.writer.send(message).await
    }

    /// Resolves once the session's reader has stopped.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct ActiveSession {
    connection: Arc<Connection>,
    child: Option<Child>,
    pump: JoinHandle<()>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Owns the backend subprocess and its lifecycle.
pub struct ProcessSupervisor {
    launcher: Arc<dyn BackendLauncher>,
    settings: SupervisorSettings,
    pending: Arc<PendingRequests>,
    status: Arc<StatusCell>,
    /// Held for the duration of any start, restart, or stop.
    session: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl ProcessSupervisor {
    /// Create a supervisor in the `Stopped` state. Nothing is spawned yet.
    ///
    /// `pending` is the client's in-flight map; the reader pump resolves
    /// responses into it.
    pub fn new(
        launcher: Arc<dyn BackendLauncher>,
        settings: SupervisorSettings,
        pending: Arc<PendingRequests>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            launcher,
            settings,
            pending,
            status: Arc::new(StatusCell::new(progress)),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.snapshot()
    }

    pub fn state(&self) -> ProcessState {
        self.status.snapshot().state
    }

    /// Start the backend if it is not already running.
    pub async fn start(&self) -> Result<(), McpError> {
        self.ensure_running().await.map(|_| ())
    }

    /// Return a live connection, starting or restarting the backend if needed.
    ///
    /// A crashed backend gets exactly one restart attempt per call, after an
    /// exponential backoff delay. After `max_restart_attempts` consecutive
    /// failed restarts the supervisor stops for good and every call fails
    /// with `ProcessUnavailable` without spawning anything. A successful
    /// restart clears the failure count.
    pub async fn ensure_running(&self) -> Result<Arc<Connection>, McpError> {
        if let Some(connection) = self.status.running_connection() {
            return Ok(connection);
        }

        let mut session = self.session.lock().await;
        let snapshot = self.status.snapshot();

        match snapshot.state {
            ProcessState::Running => self.status.running_connection().ok_or(McpError::ProcessCrashed {
                reason: "running session has no connection".into(),
            }),
            ProcessState::Stopped if snapshot.unavailable => Err(McpError::ProcessUnavailable {
                attempts: snapshot.failed_restarts,
            }),
            ProcessState::Stopped => self.start_locked(&mut session).await,
            ProcessState::Starting => {
                // A previous caller was cancelled mid-start.
                self.status.set(ProcessState::Stopped, "interrupted start");
                self.start_locked(&mut session).await
            }
            ProcessState::Restarting => {
                self.status.set(ProcessState::Crashed, "interrupted restart");
                self.restart_locked(&mut session).await
            }
            ProcessState::Crashed => self.restart_locked(&mut session).await,
        }
    }

    async fn start_locked(
        &self,
        session: &mut Option<ActiveSession>,
    ) -> Result<Arc<Connection>, McpError> {
        self.status.set(ProcessState::Starting, "launching");

        match self.launch_session().await {
            Ok(active) => {
                let connection = active.connection.clone();
                *session = Some(active);
                self.status.enter_running(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                self.status.set(ProcessState::Stopped, &format!("start failed: {e}"));
                Err(e)
            }
        }
    }

    async fn restart_locked(
        &self,
        session: &mut Option<ActiveSession>,
    ) -> Result<Arc<Connection>, McpError> {
        if let Some(old) = session.take() {
            retire(old).await;
        }

        let attempt = {
            let mut inner = self.status.lock();
            if inner.failed_restarts >= self.settings.max_restart_attempts {
                inner.unavailable = true;
                let attempts = inner.failed_restarts;
                self.status.transition(
                    &mut inner,
                    ProcessState::Stopped,
                    &format!("backend unavailable after {attempts} restart attempts"),
                );
                drop(inner);
                let err = McpError::ProcessUnavailable { attempts };
                self.pending.fail_all(&err);
                return Err(err);
            }
            inner.restart_count += 1;
            let attempt = inner.failed_restarts + 1;
            self.status.transition(
                &mut inner,
                ProcessState::Restarting,
                &format!(
                    "attempt {attempt} of {}",
                    self.settings.max_restart_attempts
                ),
            );
            attempt
        };

        // Exponential backoff: base, 2×base, 4×base, ...
        let delay = self.settings.restart_base_delay * 2u32.saturating_pow(attempt - 1);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "backing off before restart");
        tokio::time::sleep(delay).await;

        match self.launch_session().await {
            Ok(active) => {
                let connection = active.connection.clone();
                *session = Some(active);
                self.status.enter_running(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                let mut inner = self.status.lock();
                inner.failed_restarts += 1;
                self.status.transition(
                    &mut inner,
                    ProcessState::Crashed,
                    &format!("restart attempt {attempt} failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Spawn, handshake, and start the reader pump.
    async fn launch_session(&self) -> Result<ActiveSession, McpError> {
        let generation = self.status.allocate_generation();
        let BackendPipes {
            stdin,
            stdout,
            mut child,
        } = self.launcher.launch().await?;

        let writer = FrameWriter::new(stdin);
        let mut reader = FrameReader::new(stdout);

        let handshake = tokio::time::timeout(
            self.settings.startup_timeout,
            initialize(&writer, &mut reader, generation),
        )
        .await;

        match handshake {
            Ok(Ok(init)) => {
                tracing::info!(
                    generation,
                    server = init
                        .server_info
                        .as_ref()
                        .and_then(|s| s.name.as_deref())
                        .unwrap_or("unknown"),
                    version = init
                        .server_info
                        .as_ref()
                        .and_then(|s| s.version.as_deref())
                        .unwrap_or("unknown"),
                    protocol = init.protocol_version.as_deref().unwrap_or("unspecified"),
                    "backend initialized"
                );
            }
            Ok(Err(e)) => {
                kill_child(child.as_mut()).await;
                return Err(match e {
                    McpError::InitFailed { .. } => e,
                    other => McpError::InitFailed {
                        reason: other.to_string(),
                    },
                });
            }
            Err(_) => {
                kill_child(child.as_mut()).await;
                return Err(McpError::StartupTimeout {
                    timeout_secs: self.settings.startup_timeout.as_secs(),
                });
            }
        }

        let connection = Arc::new(Connection {
            generation,
            writer,
            closed: CancellationToken::new(),
        });
        let pump = tokio::spawn(run_pump(
            reader,
            self.pending.clone(),
            self.status.clone(),
            connection.clone(),
        ));

        Ok(ActiveSession {
            connection,
            child,
            pump,
        })
    }

    /// Record a failure observed by a caller (e.g. a broken stdin pipe).
    pub fn report_failure(&self, connection: &Connection, reason: &str) {
        if self.status.mark_crashed(connection.generation, reason) {
            connection.closed.cancel();
            self.pending.fail_all(&McpError::ProcessCrashed {
                reason: reason.to_string(),
            });
        }
    }

    /// Stop the backend: ask it to exit, close its input, and kill it if it
    /// has not exited within the grace period.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        let active = session.take();

        if self.status.snapshot().state != ProcessState::Stopped {
            self.status.set(ProcessState::Stopped, "stopped by request");
        }
        self.pending.fail_all(&McpError::BackendStopped);

        let Some(active) = active else {
            return;
        };

        if let Err(e) = active
            .connection
            .send(&JsonRpcNotification::new(methods::SHUTDOWN, None))
            .await
        {
            tracing::debug!(error = %e, "shutdown notification not delivered");
        }
        active.connection.writer.close().await;

        if let Some(mut child) = active.child {
            match tokio::time::timeout(self.settings.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => tracing::info!(%status, "backend exited"),
                _ => {
                    tracing::warn!(
                        grace_secs = self.settings.shutdown_grace.as_secs(),
                        "backend did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill backend");
                    }
                }
            }
        }

        active.connection.closed.cancel();
        active.pump.abort();
    }
}

async fn kill_child(child: Option<&mut Child>) {
    if let Some(child) = child {
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "failed to kill backend");
        }
    }
}

/// Tear down a crashed session before replacing it.
async fn retire(mut old: ActiveSession) {
    old.connection.closed.cancel();
    old.pump.abort();
    kill_child(old.child.as_mut()).await;
}

/// MCP `initialize` handshake, read directly off the stream before the pump starts.
async fn initialize(
    writer: &FrameWriter,
    reader: &mut FrameReader,
    generation: u64,
) -> Result<InitializeResult, McpError> {
    let id = format!("init-{generation}");
    let params = serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    writer
        .send(&JsonRpcRequest::new(id.clone(), methods::INITIALIZE, Some(params)))
        .await?;

    loop {
        match reader.next_message().await? {
            None => {
                return Err(McpError::InitFailed {
                    reason: "backend closed its output during initialization".into(),
                })
            }
            Some(IncomingMessage::Response(response)) if response.id == id => {
                let result = extract_result(response).map_err(|e| McpError::InitFailed {
                    reason: e.to_string(),
                })?;
                let init: InitializeResult =
                    serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                        reason: format!("failed to parse initialize response: {e}"),
                    })?;
                writer
                    .send(&JsonRpcNotification::new(methods::INITIALIZED, None))
                    .await?;
                return Ok(init);
            }
            Some(other) => {
                tracing::debug!(message = ?other, "ignoring message received before initialization");
            }
        }
    }
}

// ─── Reader Pump ─────────────────────────────────────────────────────────────

/// Single reader of the backend's stdout for one session.
async fn run_pump(
    reader: FrameReader,
    pending: Arc<PendingRequests>,
    status: Arc<StatusCell>,
    connection: Arc<Connection>,
) {
    let generation = connection.generation;
    let stream = reader.into_stream();
    futures::pin_mut!(stream);

    let failure = loop {
        match stream.next().await {
            Some(Ok(IncomingMessage::Response(response))) => {
                pending.resolve(response);
            }
            Some(Ok(IncomingMessage::Notification { method, params })) => {
                handle_notification(&pending, &method, params.as_ref());
            }
            Some(Ok(IncomingMessage::ServerRequest { id, method })) => {
                tracing::warn!(id = %id, method = %method, "discarding server-initiated request");
            }
            Some(Err(e)) => break e,
            None => {
                break McpError::ProcessCrashed {
                    reason: "backend closed its output stream".into(),
                }
            }
        }
    };

    let reason = failure.to_string();
    if status.mark_crashed(generation, &reason) {
        tracing::warn!(generation, error = %reason, "backend session lost");
        pending.fail_all(&McpError::ProcessCrashed { reason });
    }
    connection.closed.cancel();
}

fn handle_notification(pending: &PendingRequests, method: &str, params: Option<&Value>) {
    match method {
        methods::PROGRESS => {
            let Some(params) = params else {
                return;
            };
            let token = match params.get("progressToken") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return,
            };
            let message = match params.get("message").and_then(|m| m.as_str()) {
                Some(m) => m.to_string(),
                None => {
                    let progress = params.get("progress").cloned().unwrap_or(Value::Null);
                    match params.get("total") {
                        Some(total) => format!("progress {progress}/{total}"),
                        None => format!("progress {progress}"),
                    }
                }
            };
            if !pending.report_progress(&token, &message) {
                tracing::debug!(token = %token, "progress for unknown request");
            }
        }
        "notifications/message" => {
            tracing::info!(params = ?params, "backend log message");
        }
        other => {
            tracing::debug!(method = %other, "ignoring backend notification");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
