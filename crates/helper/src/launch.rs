//! Daemon discovery and the single-spawn rule.
//!
//! Competing helpers race to start one daemon. The winner is whoever creates
//! the lock file (O_EXCL); everyone else polls the socket until it appears.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use tabrelay_core::{Config, Error, Paths, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect to the daemon, spawning one first if nobody is listening.
pub async fn connect_or_spawn(config: &Config, paths: &Paths) -> Result<UnixStream> {
    connect_or_spawn_with(config, paths, spawn_daemon_process).await
}

/// Same as [`connect_or_spawn`] with an injectable spawner.
pub async fn connect_or_spawn_with<F>(
    config: &Config,
    paths: &Paths,
    spawn: F,
) -> Result<UnixStream>
where
    F: FnOnce() -> Result<()>,
{
    let socket = config.socket_path(paths);
    if let Ok(stream) = UnixStream::connect(&socket).await {
        debug!(socket = %socket.display(), "daemon already running");
        return Ok(stream);
    }

    paths.ensure_dirs()?;
    let lock = paths.lock_file();
    let window = Duration::from_millis(config.spawn_wait_ms.max(1));
    let holder = acquire_lock(&lock, window)?;

    if holder {
        info!("spawning router daemon");
        if let Err(e) = spawn() {
            let _ = std::fs::remove_file(&lock);
            return Err(e);
        }
    } else {
        debug!("another helper is spawning the daemon, waiting for the socket");
    }

    let result = poll_socket(&socket, window).await;
    if holder {
        let _ = std::fs::remove_file(&lock);
    }
    result
}

/// Try to create the lock exclusively. A lock left behind by a dead spawner
/// (older than twice the spawn window) is broken and re-taken.
fn acquire_lock(lock: &Path, window: Duration) -> Result<bool> {
    match exclusive_create(lock) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let stale = std::fs::metadata(lock)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|age| age > window * 2)
                .unwrap_or(false);
            if stale {
                warn!(lock = %lock.display(), "breaking stale startup lock");
                let _ = std::fs::remove_file(lock);
                match exclusive_create(lock) {
                    Ok(()) => Ok(true),
                    Err(_) => Ok(false),
                }
            } else {
                Ok(false)
            }
        }
        Err(e) => Err(Error::Io(e)),
    }
}

fn exclusive_create(path: &Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
}

async fn poll_socket(socket: &Path, window: Duration) -> Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        if let Ok(stream) = UnixStream::connect(socket).await {
            return Ok(stream);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "daemon socket {} did not appear within {}ms",
                socket.display(),
                window.as_millis()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Re-exec this binary with the daemon flag, detached from our lifetime.
fn spawn_daemon_process() -> Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("--daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabrelay_router::RouterDaemon;

    fn test_setup(tmp: &tempfile::TempDir) -> (Config, Paths) {
        let paths = Paths::with_base(tmp.path().join("base"));
        let config = Config {
            ws_port: 0,
            spawn_wait_ms: 2_000,
            ..Config::default()
        };
        (config, paths)
    }

    #[tokio::test]
    async fn test_spawner_is_invoked_and_socket_polled() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_setup(&tmp);

        // The "spawned process" is an in-process daemon task.
        let daemon_config = config.clone();
        let daemon_paths = paths.clone();
        let spawn = move || {
            tokio::spawn(async move {
                let handle = RouterDaemon::new(daemon_config, daemon_paths)
                    .start()
                    .await
                    .unwrap();
                handle.wait().await.unwrap();
            });
            Ok(())
        };

        let stream = connect_or_spawn_with(&config, &paths, spawn).await.unwrap();
        drop(stream);
        // The winner released its lock.
        assert!(!paths.lock_file().exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut config, paths) = test_setup(&tmp);
        config.spawn_wait_ms = 200;

        let err = connect_or_spawn_with(&config, &paths, || {
            Err(Error::Other("spawn blew up".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("spawn blew up"));
        assert!(!paths.lock_file().exists());
    }

    #[tokio::test]
    async fn test_contender_without_lock_times_out_when_no_daemon_appears() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut config, paths) = test_setup(&tmp);
        config.spawn_wait_ms = 150;
        paths.ensure_dirs().unwrap();
        // Someone else holds a fresh lock and never starts a daemon.
        exclusive_create(&paths.lock_file()).unwrap();

        let spawn_called = std::sync::atomic::AtomicBool::new(false);
        let err = connect_or_spawn_with(&config, &paths, || {
            spawn_called.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(
            !spawn_called.load(std::sync::atomic::Ordering::SeqCst),
            "the lock loser must not spawn"
        );
        // The foreign lock is left in place.
        assert!(paths.lock_file().exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(tmp.path().join("base"));
        paths.ensure_dirs().unwrap();
        exclusive_create(&paths.lock_file()).unwrap();

        // With a tiny window, the just-created lock goes stale quickly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let holder = acquire_lock(&paths.lock_file(), Duration::from_millis(10)).unwrap();
        assert!(holder, "stale lock should be broken and re-taken");
    }
}
