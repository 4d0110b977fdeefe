//! Conversation orchestrator for an MCP tool backend.
//!
//! - `mcp_client`: JSON-RPC over stdio to one supervised backend process
//! - `inference`: the OpenAI-compatible conversation provider
//! - `agent_core`: the tool loop tying the two together
//! - `progress`: user-visible progress events
//! - `config`: the YAML config file

pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;
pub mod progress;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for mcp-orchestrator.
///
/// - macOS: `~/Library/Application Support/mcp-orchestrator/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-orchestrator\`
/// - Linux: `$XDG_DATA_HOME/mcp-orchestrator/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-orchestrator/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-orchestrator")
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// `<data dir>/orchestrator.log`, rotated on every start.
    File,
    Stderr,
}

/// Initialize the tracing subscriber.
///
/// With [`LogTarget::File`], existing logs are rotated (keeping the last 3)
/// and a fresh `orchestrator.log` is opened with a line-flushing writer. If
/// the log file cannot be opened, logging falls back to stderr. `RUST_LOG`
/// overrides the default filter.
pub fn init_tracing(target: LogTarget, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_orchestrator=info,warn"));

    let log_path = match target {
        LogTarget::File => open_log_file(&data_dir()),
        LogTarget::Stderr => None,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    match (log_path, json) {
        (Some((path, writer)), true) => {
            builder.json().with_writer(writer).init();
            log_banner(Some(&path));
        }
        (Some((path, writer)), false) => {
            builder.with_ansi(false).with_writer(writer).init();
            log_banner(Some(&path));
        }
        (None, true) => {
            builder.json().with_writer(std::io::stderr).init();
            log_banner(None);
        }
        (None, false) => {
            builder.with_writer(std::io::stderr).init();
            log_banner(None);
        }
    }
}

fn open_log_file(log_dir: &Path) -> Option<(PathBuf, FlushingWriter)> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("cannot create log dir {}: {e}", log_dir.display());
        return None;
    }

    let log_path = log_dir.join("orchestrator.log");
    rotate_log_file(&log_path, 3);

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => Some((log_path, FlushingWriter::new(file))),
        Err(e) => {
            eprintln!("cannot open {}: {e}", log_path.display());
            None
        }
    }
}

fn log_banner(log_file: Option<&Path>) {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_file.map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        pid = std::process::id(),
        "=== mcp-orchestrator starting ==="
    );
}

/// Rotate log files: `orchestrator.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk even if the process dies mid-conversation.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
