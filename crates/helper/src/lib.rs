pub mod bridge;
pub mod launch;
pub mod mcp;
pub mod tools;

pub use bridge::{Bridge, DaemonBridge, DirectBridge, StatusReport};
pub use mcp::McpServer;

use std::time::Duration;

use tracing::{info, warn};

use tabrelay_core::{Config, Paths, Result};

/// Run the MCP helper: find or spawn the daemon (falling back to direct
/// mode), then serve MCP on stdio until the agent host disconnects or we are
/// terminated.
pub async fn run(config: Config, paths: Paths) -> Result<()> {
    let bridge = connect(&config, &paths).await?;
    info!(mode = bridge.mode(), "helper ready");
    let server = McpServer::new(bridge);

    let served = tokio::select! {
        result = server.run() => result,
        _ = shutdown_signal() => {
            info!("termination signal received");
            Ok(())
        }
    };

    // Guarantee termination even if teardown wedges.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        warn!("shutdown watchdog fired, forcing exit");
        std::process::exit(1);
    });

    server.bridge().shutdown().await;
    served
}

async fn connect(config: &Config, paths: &Paths) -> Result<Bridge> {
    match launch::connect_or_spawn(config, paths).await {
        Ok(stream) => match DaemonBridge::connect(stream, config).await {
            Ok(bridge) => return Ok(Bridge::Daemon(bridge)),
            Err(e) => {
                warn!(error = %e, "daemon handshake failed, entering direct mode");
            }
        },
        Err(e) => {
            warn!(error = %e, "no daemon available, entering direct mode");
        }
    }
    Ok(Bridge::Direct(DirectBridge::start(config).await?))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
