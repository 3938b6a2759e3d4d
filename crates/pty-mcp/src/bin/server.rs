//! ttymux MCP server binary.
//!
//! Speaks MCP over stdin/stdout; logs go to stderr.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ttymux_mcp::{serve_stdio, Backend, ServerConfig, TerminalServer};

#[derive(Debug, Parser)]
#[command(name = "ttymux-mcp-server", version, about = "MCP server for terminal and Zellij sessions")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "TTYMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Terminal backend: pty or terminal-app
    #[arg(long)]
    backend: Option<Backend>,

    /// Shell started in PTY sessions
    #[arg(long)]
    shell: Option<String>,

    /// Disable the Zellij tools
    #[arg(long)]
    no_multiplexer: bool,

    /// Log filter, e.g. "debug" or "info,ttymux_mcp=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,ttymux_mcp=debug".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(shell) = args.shell {
        config.shell = Some(shell);
    }
    if args.no_multiplexer {
        config.multiplexer.enabled = false;
    }

    tracing::info!(
        backend = %config.backend,
        multiplexer = config.multiplexer.enabled,
        "Starting ttymux MCP server"
    );

    let server = TerminalServer::new(config);
    let result = serve_stdio(&server).await;
    server.shutdown().await;

    tracing::info!("Shutting down ttymux MCP server");
    result?;
    Ok(())
}
