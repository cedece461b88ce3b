//! MCP supervisor binary
//!
//! Runs the embedded MCP listener under the supervisor, or talks to a
//! running instance through its control routes.
//!
//! Logs go to stderr; stdout is reserved for the stdio bridge.

use clap::{Args, Parser, Subcommand};
use mcp_supervisor::{
    config::parse_allowed_origins, expand_path, HttpServerManager, HttpTakeoverClient,
    McpSettings, McpSupervisor, RuntimeMode, ServerState, StdioBridge, TakeoverClient,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STOP_GRACE_MS: u64 = 2_000;

#[derive(Parser)]
#[command(name = "mcp-supervisor", version, about = "Embedded MCP server control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervised MCP listener until a signal arrives (default)
    Serve(ServeArgs),
    /// Check whether a compatible MCP server holds the port
    Probe(TargetArgs),
    /// Ask a running instance to release the port
    Shutdown(ShutdownArgs),
}

#[derive(Args, Default)]
struct TargetArgs {
    /// Settings file (JSON); missing fields take their defaults
    #[arg(long)]
    config: Option<String>,
    /// Listener host (overrides the settings file)
    #[arg(long)]
    host: Option<String>,
    /// Listener port (overrides the settings file)
    #[arg(long)]
    port: Option<u16>,
    /// Talk to the listener over HTTPS
    #[arg(long)]
    tls: bool,
}

#[derive(Args)]
struct ShutdownArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Shared secret of the running instance
    #[arg(long, env = "MCP_TOKEN")]
    token: Option<String>,
}

#[derive(Args, Default)]
struct ServeArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Shared secret for the shutdown route
    #[arg(long, env = "MCP_TOKEN")]
    token: Option<String>,
    /// Also serve MCP over stdin/stdout
    #[arg(long)]
    stdio: bool,
    /// Allowed Origin values (comma-separated). Loopback origins are always allowed.
    #[arg(long)]
    allow_origin: Option<String>,
    /// Maximum concurrent tool calls
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// PEM certificate chain for --tls (default: generated self-signed)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,
    /// PEM private key for --tls
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,
}

impl TargetArgs {
    fn settings(&self) -> anyhow::Result<McpSettings> {
        let mut settings = match &self.config {
            Some(path) => McpSettings::load(&expand_path(path))?,
            None => McpSettings::default(),
        };
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if self.tls {
            settings.tls_enabled = true;
        }
        Ok(settings)
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging to stderr (stdout is used for MCP protocol)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mcp_supervisor=info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => rt.block_on(run_serve(args)),
        Command::Probe(args) => rt.block_on(run_probe(args)),
        Command::Shutdown(args) => rt.block_on(run_shutdown(args)),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut settings = args.target.settings()?;
    if let Some(token) = args.token {
        settings.token = token;
    }
    if args.stdio {
        settings.stdio_enabled = true;
    }
    if let Some(raw) = &args.allow_origin {
        settings.allowed_origins = parse_allowed_origins(raw);
    }
    if let Some(max) = args.max_concurrent {
        settings.max_concurrent_requests = max;
    }
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        settings.tls_cert_path = expand_path(cert).display().to_string();
        settings.tls_key_path = expand_path(key).display().to_string();
    }
    settings.enabled = true;

    info!(
        host = %settings.host,
        port = settings.port,
        tls = settings.tls_enabled,
        stdio = settings.stdio_enabled,
        "Starting MCP supervisor"
    );

    let supervisor = McpSupervisor::builder(Arc::new(HttpServerManager::new()))
        .side_channel(Arc::new(StdioBridge::new()))
        .build()?;

    let mut states = supervisor.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            info!(state = %state, "MCP server state changed");
        }
    });

    supervisor.apply_settings(settings, RuntimeMode::default());

    if wait_for_shutdown_signal().await.is_err() {
        warn!("Shutdown signal handler failed; stopping now");
    } else {
        info!("Shutdown signal received");
    }

    let mut states = supervisor.subscribe();
    supervisor.shutdown();
    let stopped = tokio::time::timeout(
        Duration::from_millis(STOP_GRACE_MS),
        states.wait_for(|s| {
            !matches!(
                s,
                ServerState::Starting | ServerState::Running | ServerState::Stopping
            )
        }),
    )
    .await;
    if stopped.is_err() {
        warn!("MCP listener did not report stopped in time");
    }

    info!("Server stopped");
    Ok(())
}

async fn run_probe(args: TargetArgs) -> anyhow::Result<()> {
    let settings = args.settings()?;
    let client = HttpTakeoverClient::new();
    if client.probe(&settings).await {
        println!("compatible MCP server at {}", settings.authority());
    } else {
        println!("no compatible MCP server at {}", settings.authority());
    }
    Ok(())
}

async fn run_shutdown(args: ShutdownArgs) -> anyhow::Result<()> {
    let mut settings = args.target.settings()?;
    if let Some(token) = args.token {
        settings.token = token;
    }
    let client = HttpTakeoverClient::new();
    if !client.request_shutdown(&settings).await {
        anyhow::bail!(
            "MCP server at {} did not accept the shutdown request",
            settings.authority()
        );
    }
    println!("shutdown requested from {}", settings.authority());
    Ok(())
}
