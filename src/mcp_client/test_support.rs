//! Scripted in-memory backend for tests.
//!
//! Speaks the same line-delimited JSON-RPC as a real backend over
//! `tokio::io::duplex` pipes. `initialize` is answered automatically; every
//! other request is answered by a handler closure returning a [`Reply`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use super::errors::McpError;
use super::supervisor::{BackendLauncher, BackendPipes};

/// How the fake backend answers one request.
pub(crate) enum Reply {
    /// `{"result": value}`.
    Result(Value),
    /// `{"error": {code, message}}`.
    Error { code: i32, message: String },
    /// Wait, then answer.
    Delayed(Duration, Box<Reply>),
    /// Send `notifications/progress` for the request's progress token, then answer.
    Progress(Vec<String>, Box<Reply>),
    /// Never answer.
    NoReply,
    /// Write a raw, non-JSON line.
    Garbage(String),
    /// Close stdout, as if the process died.
    Exit,
}

impl Reply {
    /// A successful `tools/call` result with one text block.
    pub(crate) fn text(text: impl Into<String>) -> Reply {
        Reply::Result(json!({"content": [{"type": "text", "text": text.into()}]}))
    }

    pub(crate) fn after(delay: Duration, reply: Reply) -> Reply {
        Reply::Delayed(delay, Box::new(reply))
    }
}

type Handler = dyn Fn(&str, &Value) -> Reply + Send + Sync;
type SharedOutput = Arc<tokio::sync::Mutex<Option<DuplexStream>>>;

#[derive(Default)]
struct Observed {
    received: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub(crate) struct FakeBackend {
    handler: Arc<Handler>,
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    hang_initialize: AtomicBool,
    observed: Arc<Observed>,
}

impl FakeBackend {
    pub(crate) fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Arc::new(handler),
            launches: AtomicUsize::new(0),
            failing_launches: AtomicUsize::new(0),
            hang_initialize: AtomicBool::new(false),
            observed: Arc::new(Observed::default()),
        })
    }

    /// Empty catalog; `tools/call` echoes `name: arguments`.
    pub(crate) fn echo() -> Arc<Self> {
        Self::new(|method, params| match method {
            "tools/list" => Reply::Result(json!({"tools": []})),
            "tools/call" => Reply::text(format!("{}: {}", params["name"].as_str().unwrap_or(""), params["arguments"])),
            _ => Reply::Result(json!({})),
        })
    }

    /// Make the next `n` launches fail with `SpawnFailed`.
    pub(crate) fn fail_next_launches(&self, n: usize) {
        self.failing_launches.store(n, Ordering::SeqCst);
    }

    pub(crate) fn hang_initialize(&self, hang: bool) {
        self.hang_initialize.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Highest number of requests that were being answered at once.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.observed.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every frame received, in arrival order.
    pub(crate) fn received(&self) -> Vec<Value> {
        self.observed.received.lock().unwrap().clone()
    }

    pub(crate) fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["method"].as_str().map(String::from))
            .collect()
    }

    /// Tool names of every `tools/call`, in arrival order.
    pub(crate) fn called_tools(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter(|m| m["method"] == "tools/call")
            .filter_map(|m| m["params"]["name"].as_str().map(String::from))
            .collect()
    }

    /// `requestId`s of every `notifications/cancelled`.
    pub(crate) fn cancelled_ids(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter(|m| m["method"] == "notifications/cancelled")
            .filter_map(|m| m["params"]["requestId"].as_str().map(String::from))
            .collect()
    }
}

#[async_trait]
impl BackendLauncher for FakeBackend {
    async fn launch(&self) -> Result<BackendPipes, McpError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(McpError::SpawnFailed {
                command: "fake-backend".into(),
                reason: "scripted launch failure".into(),
            });
        }

        let (client_stdin, server_stdin) = tokio::io::duplex(256 * 1024);
        let (server_stdout, client_stdout) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve(
            server_stdin,
            server_stdout,
            self.handler.clone(),
            self.observed.clone(),
            self.hang_initialize.load(Ordering::SeqCst),
        ));

        Ok(BackendPipes {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            child: None,
        })
    }
}

async fn serve(
    input: DuplexStream,
    output: DuplexStream,
    handler: Arc<Handler>,
    observed: Arc<Observed>,
    hang_initialize: bool,
) {
    let output: SharedOutput = Arc::new(tokio::sync::Mutex::new(Some(output)));
    let mut lines = BufReader::new(input).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        observed.received.lock().unwrap().push(message.clone());

        let (Some(id), Some(method)) = (message.get("id").cloned(), message["method"].as_str()) else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        if method == "initialize" {
            if !hang_initialize {
                let result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-backend", "version": "0.0.1"}
                });
                write_value(&output, &json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
            }
            continue;
        }

        let reply = handler(method, &params);
        let output = output.clone();
        let observed = observed.clone();
        tokio::spawn(async move {
            let now = observed.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            observed.max_in_flight.fetch_max(now, Ordering::SeqCst);
            respond(&output, id, &params, reply).await;
            observed.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    // stdin closed: the process "exits".
    output.lock().await.take();
}

async fn respond(output: &SharedOutput, id: Value, params: &Value, mut reply: Reply) {
    loop {
        match reply {
            Reply::Delayed(delay, next) => {
                tokio::time::sleep(delay).await;
                reply = *next;
            }
            Reply::Progress(messages, next) => {
                let token = params["_meta"]["progressToken"].clone();
                for (i, message) in messages.iter().enumerate() {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/progress",
                        "params": {"progressToken": token, "progress": i + 1, "total": messages.len(), "message": message}
                    });
                    write_value(output, &note).await;
                }
                reply = *next;
            }
            Reply::Result(result) => {
                write_value(output, &json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                return;
            }
            Reply::Error { code, message } => {
                let error = json!({"code": code, "message": message});
                write_value(output, &json!({"jsonrpc": "2.0", "id": id, "error": error})).await;
                return;
            }
            Reply::NoReply => return,
            Reply::Garbage(text) => {
                write_raw(output, format!("{text}\n").as_bytes()).await;
                return;
            }
            Reply::Exit => {
                output.lock().await.take();
                return;
            }
        }
    }
}

async fn write_value(output: &SharedOutput, value: &Value) {
    let mut line = serde_json::to_vec(value).unwrap();
    line.push(b'\n');
    write_raw(output, &line).await;
}

async fn write_raw(output: &SharedOutput, bytes: &[u8]) {
    let mut guard = output.lock().await;
    if let Some(stream) = guard.as_mut() {
        let _ = stream.write_all(bytes).await;
        let _ = stream.flush().await;
    }
}
