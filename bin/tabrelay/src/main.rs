use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tabrelay_core::{config::ENV_LOG_FILE, encode_frame, Config, Frame, FrameBuffer, Paths};
use tabrelay_helper as helper;
use tabrelay_panel::{EchoExecutor, MemoryTabHost, SidePanel};
use tabrelay_router::RouterDaemon;

#[derive(Parser)]
#[command(name = "tabrelay")]
#[command(about = "Session-aware bridge between MCP agent hosts and a browser extension", long_about = None)]
#[command(version)]
struct Cli {
    /// Run as the host-wide router daemon (the helper's self-spawn flag)
    #[arg(long)]
    daemon: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP on stdio for one agent host (default)
    Serve,

    /// Run the router daemon in the foreground
    Daemon,

    /// Run the side-panel loop against the in-memory tab host (dev harness)
    Panel,

    /// Query the running daemon and print its status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let paths = Paths::new();
    let config = Config::load(&paths)?;

    let command = if cli.daemon {
        Commands::Daemon
    } else {
        cli.command.unwrap_or(Commands::Serve)
    };

    match command {
        Commands::Serve => {
            helper::run(config, paths).await?;
        }
        Commands::Daemon => {
            RouterDaemon::new(config, paths).run().await?;
        }
        Commands::Panel => {
            let host = Arc::new(MemoryTabHost::new());
            let executor = Arc::new(EchoExecutor::new());
            info!(url = %config.ws_url(), "starting side panel (in-memory executor)");
            let panel = SidePanel::new(config, host, executor);
            panel.run().await?;
        }
        Commands::Status => {
            status(config, paths).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so MCP stdout stays clean; BROWSER_AGENT_LOG_FILE
/// redirects them to a file instead.
fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_file = std::env::var(ENV_LOG_FILE).ok().filter(|p| !p.is_empty());
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

async fn status(config: Config, paths: Paths) -> anyhow::Result<()> {
    let socket = config.socket_path(&paths);
    let mut stream = match tokio::net::UnixStream::connect(&socket).await {
        Ok(stream) => stream,
        Err(_) => {
            println!("daemon: not running ({})", socket.display());
            return Ok(());
        }
    };

    stream
        .write_all(&encode_frame(&Frame::Status, config.max_frame_bytes)?)
        .await?;

    let mut buffer = FrameBuffer::new(config.max_frame_bytes);
    let mut chunk = [0u8; 4096];
    loop {
        use tokio::io::AsyncReadExt;
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("daemon closed the connection before answering");
        }
        buffer.extend(&chunk[..n]);
        if let Some(frame) = buffer.next_frame::<Frame>()? {
            match frame {
                Frame::StatusOk {
                    extension_connected,
                    active_sessions,
                } => {
                    println!("daemon: running");
                    println!("  socket: {}", socket.display());
                    println!("  extension connected: {extension_connected}");
                    println!("  active sessions: {active_sessions}");
                    return Ok(());
                }
                other => anyhow::bail!("unexpected reply from daemon: {other:?}"),
            }
        }
    }
}
