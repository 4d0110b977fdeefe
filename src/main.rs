//! mcp-orchestrator CLI.
//!
//! - `mcp-orchestrator ask "<message>"`  # run one conversation turn
//! - `mcp-orchestrator tools`            # list the backend's tool catalog

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use mcp_orchestrator::agent_core::Orchestrator;
use mcp_orchestrator::config::{find_config_path, load_config, AppConfig};
use mcp_orchestrator::inference::OpenAiCompatibleProvider;
use mcp_orchestrator::mcp_client::McpClient;
use mcp_orchestrator::progress::{
    progress_channel, ProgressCategory, ProgressEvent, ProgressSink, DEFAULT_PROGRESS_CAPACITY,
};
use mcp_orchestrator::{init_tracing, LogTarget};

#[derive(Parser)]
#[command(name = "mcp-orchestrator")]
#[command(about = "Drive an MCP tool backend from an AI conversation")]
#[command(version)]
struct Cli {
    /// Path to the config file (default: search for mcp-orchestrator.yaml)
    #[arg(long, env = "MCP_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the reply
    Ask {
        /// The user message
        message: String,
    },
    /// List the tools the backend exposes
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let target = if cli.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::File
    };
    init_tracing(target, cli.json_logs);

    let cwd = std::env::current_dir().context("cannot read current directory")?;
    let path = find_config_path(cli.config.as_deref(), &cwd)?;
    let config = load_config(&path)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    let (sink, mut events) = progress_channel(DEFAULT_PROGRESS_CAPACITY);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let client = Arc::new(McpClient::from_config(&config.backend, sink.clone()));
    let outcome = match cli.command {
        Commands::Ask { message } => ask(&config, client.clone(), sink.clone(), &message, &cancel).await,
        Commands::Tools => list_tools(&client, &cancel).await,
    };

    client.shutdown().await;
    drop(client);
    drop(sink);
    // The printer ends once every sink clone is gone.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
    outcome
}

async fn ask(
    config: &AppConfig,
    client: Arc<McpClient>,
    sink: ProgressSink,
    message: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let provider = OpenAiCompatibleProvider::new(config.provider.clone())?;
    let orchestrator = Orchestrator::new(client, Arc::new(provider), config.orchestrator.clone())
        .with_progress(sink);

    let mut conversation = orchestrator.new_conversation();
    let reply = orchestrator
        .send_message(&mut conversation, message, cancel)
        .await?;
    println!("{reply}");
    Ok(())
}

async fn list_tools(client: &McpClient, cancel: &CancellationToken) -> anyhow::Result<()> {
    let tools = client.list_tools(cancel).await?;
    for tool in tools.iter() {
        let access = if tool.is_read_only() { "read" } else { "write" };
        println!("{:<32} [{access}] {}", tool.name, tool.description);
    }
    println!("\n{} tool(s)", tools.len());
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    let label = match event.category {
        ProgressCategory::Info => "info",
        ProgressCategory::ToolStart => "tool",
        ProgressCategory::ToolEnd => "done",
        ProgressCategory::Warning => "warn",
        ProgressCategory::Error => "error",
    };
    eprintln!(
        "[{}] {label:>5}: {}",
        event.timestamp.format("%H:%M:%S"),
        event.message
    );
}
