//! The host-wide router daemon.
//!
//! Multiplexes any number of helper connections (newline-framed JSON over a
//! Unix socket) onto a single extension WebSocket uplink. Owns the session
//! table and the pending-request table; nothing else reads them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use tabrelay_core::{
    encode_frame, wire, Config, Error, Frame, FrameBuffer, Paths, PendingTable, RequestFrame,
    ResponseFrame, Result,
};

use crate::sessions::SessionTable;

struct UplinkHandle {
    tx: mpsc::UnboundedSender<WsMessage>,
    epoch: u64,
}

struct DaemonState {
    config: Config,
    sessions: SessionTable,
    pending: PendingTable,
    uplink: Mutex<Option<UplinkHandle>>,
    uplink_epoch: AtomicU64,
    next_conn_id: AtomicU64,
    /// Pinged on every session insert/remove so the idle watcher re-evaluates.
    sessions_changed: Notify,
    shutdown_tx: watch::Sender<bool>,
}

pub struct RouterDaemon {
    config: Config,
    paths: Paths,
}

/// A bound, running daemon. Dropping the handle does not stop the daemon;
/// call [`DaemonHandle::wait`] (production) or [`DaemonHandle::stop`] (tests).
pub struct DaemonHandle {
    pub socket_path: PathBuf,
    pub ws_addr: std::net::SocketAddr,
    state: Arc<DaemonState>,
    pid_file: PathBuf,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RouterDaemon {
    pub fn new(config: Config, paths: Paths) -> Self {
        Self { config, paths }
    }

    /// Bind both listeners and start serving. Fails (for the caller to exit 1)
    /// when another live daemon already owns the socket or a bind fails.
    pub async fn start(self) -> Result<DaemonHandle> {
        self.paths.ensure_dirs()?;
        let socket_path = self.config.socket_path(&self.paths);

        if socket_path.exists() {
            if UnixStream::connect(&socket_path).await.is_ok() {
                return Err(Error::Other(format!(
                    "another daemon is already listening on {}",
                    socket_path.display()
                )));
            }
            // Leftover from a crashed daemon.
            warn!(path = %socket_path.display(), "removing stale socket file");
            std::fs::remove_file(&socket_path)?;
        }

        let unix_listener = UnixListener::bind(&socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let pid_file = self.paths.pid_file();
        std::fs::write(&pid_file, std::process::id().to_string())?;

        let ws_listener = match TcpListener::bind(self.config.ws_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_file(&socket_path);
                let _ = std::fs::remove_file(&pid_file);
                return Err(Error::Io(e));
            }
        };
        let ws_addr = ws_listener.local_addr()?;

        info!(
            socket = %socket_path.display(),
            ws = %ws_addr,
            "router daemon listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(DaemonState {
            sessions: SessionTable::new(self.config.max_sessions),
            pending: PendingTable::new(),
            uplink: Mutex::new(None),
            uplink_epoch: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(1),
            sessions_changed: Notify::new(),
            shutdown_tx,
            config: self.config,
        });

        let mut tasks = Vec::new();

        // Helper accept loop. Aborting this task also closes the listener.
        let accept_state = state.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match unix_listener.accept().await {
                    Ok((stream, _addr)) => {
                        let conn_id = accept_state.next_conn_id.fetch_add(1, Ordering::SeqCst);
                        let conn_state = accept_state.clone();
                        tokio::spawn(async move {
                            handle_helper_conn(conn_state, stream, conn_id).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "helper accept failed");
                        break;
                    }
                }
            }
        }));

        // Extension accept loop. Reconnection is passive: whatever WS arrives
        // next becomes the uplink.
        let ws_state = state.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match ws_listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn_state = ws_state.clone();
                        tokio::spawn(async move {
                            handle_extension_conn(conn_state, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "extension accept failed");
                        break;
                    }
                }
            }
        }));

        // Idle watcher: exit after a quiet period with zero sessions.
        let idle_state = state.clone();
        tasks.push(tokio::spawn(async move {
            idle_watcher(idle_state).await;
        }));

        Ok(DaemonHandle {
            socket_path,
            ws_addr,
            state,
            pid_file,
            shutdown_rx,
            tasks,
        })
    }

    /// Run until idle auto-shutdown or a termination signal.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        handle.wait().await
    }
}

impl DaemonHandle {
    /// Block until idle shutdown or SIGINT/SIGTERM, then tear down in order.
    pub async fn wait(mut self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = self.shutdown_rx.changed() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received interrupt"),
                _ = self.shutdown_rx.changed() => {}
            }
        }
        self.teardown().await;
        Ok(())
    }

    /// Immediate ordered shutdown (test and status-tool path).
    pub async fn stop(self) {
        self.teardown().await;
    }

    async fn teardown(self) {
        info!("daemon shutting down");
        // 1. Stop accepting new helpers and extensions.
        for task in &self.tasks {
            task.abort();
        }
        // 2. Abort every pending request.
        let aborted = self.state.pending.abort_all(wire::SHUTTING_DOWN).await;
        if aborted > 0 {
            info!(aborted, "aborted pending requests");
        }
        // 3. Close the extension uplink.
        self.state.uplink.lock().await.take();
        // 4. Remove socket and PID files.
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_file);
        info!("daemon shutdown complete");
    }
}

async fn idle_watcher(state: Arc<DaemonState>) {
    let idle = Duration::from_millis(state.config.idle_timeout_ms.max(1));
    loop {
        if state.sessions.count().await > 0 {
            state.sessions_changed.notified().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(idle) => {
                if state.sessions.count().await == 0 {
                    info!(idle_ms = idle.as_millis() as u64, "no active sessions, idle exit");
                    let _ = state.shutdown_tx.send(true);
                    return;
                }
            }
            _ = state.sessions_changed.notified() => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Helper side
// ---------------------------------------------------------------------------

async fn handle_helper_conn(state: Arc<DaemonState>, stream: UnixStream, conn_id: u64) {
    info!(conn_id, "helper connected");
    let max_frame_bytes = state.config.max_frame_bytes;
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match encode_frame(&frame, max_frame_bytes) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = FrameBuffer::new(max_frame_bytes);
    let mut chunk = [0u8; 8192];
    'conn: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(conn_id, error = %e, "helper read error");
                break;
            }
        };
        buffer.extend(&chunk[..n]);
        loop {
            match buffer.next_frame::<Frame>() {
                Ok(Some(frame)) => {
                    if !handle_helper_frame(&state, conn_id, &tx, frame).await {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(Error::Json(e)) => {
                    warn!(conn_id, error = %e, "dropping malformed frame");
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "closing helper connection");
                    break 'conn;
                }
            }
        }
    }

    // Helper gone: every session it registered ends now.
    for session in state.sessions.remove_by_conn(conn_id).await {
        finish_session(&state, &session.session_id).await;
    }
    // Let queued replies (REGISTER_ERROR in particular) flush before the
    // write half drops. Waiter tasks may still hold sender clones, so this
    // is bounded rather than a plain await.
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_millis(250), writer_task).await;
    info!(conn_id, "helper disconnected");
}

/// Returns false when the connection should close.
async fn handle_helper_frame(
    state: &Arc<DaemonState>,
    conn_id: u64,
    tx: &mpsc::UnboundedSender<Frame>,
    frame: Frame,
) -> bool {
    match frame {
        Frame::Register => {
            match state.sessions.register(conn_id, tx.clone()).await {
                Ok(session_id) => {
                    info!(conn_id, session = %session_id, "session registered");
                    send_to_extension(
                        state,
                        Frame::SessionStart {
                            session_id: session_id.clone(),
                        },
                    )
                    .await;
                    let _ = tx.send(Frame::RegisterOk { session_id });
                    state.sessions_changed.notify_one();
                    true
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "registration rejected");
                    let _ = tx.send(Frame::RegisterError {
                        error: wire::SESSION_LIMIT_EXCEEDED.to_string(),
                    });
                    false
                }
            }
        }
        Frame::Request(request) => {
            handle_request(state, tx, request).await;
            true
        }
        Frame::Ping => {
            state.sessions.touch_conn(conn_id).await;
            let _ = tx.send(Frame::Pong);
            true
        }
        Frame::Status => {
            // Reflects the live uplink, never a cache.
            let extension_connected = state.uplink.lock().await.is_some();
            let active_sessions = state.sessions.count().await;
            let _ = tx.send(Frame::StatusOk {
                extension_connected,
                active_sessions,
            });
            true
        }
        Frame::Disconnect { session_id } => {
            if state.sessions.remove(&session_id).await.is_some() {
                finish_session(state, &session_id).await;
            }
            true
        }
        other => {
            debug!(conn_id, ?other, "ignoring unexpected frame from helper");
            true
        }
    }
}

async fn handle_request(
    state: &Arc<DaemonState>,
    tx: &mpsc::UnboundedSender<Frame>,
    request: RequestFrame,
) {
    let req_id = request.req_id.clone();
    let echoed_session = request.session_id.clone();

    let Some(session_id) = request.session_id.clone() else {
        let _ = tx.send(err_response(&req_id, echoed_session, wire::UNKNOWN_SESSION));
        return;
    };
    if !state.sessions.contains(&session_id).await {
        let _ = tx.send(err_response(&req_id, echoed_session, wire::UNKNOWN_SESSION));
        return;
    }
    if state.pending.has(&req_id).await {
        let _ = tx.send(err_response(
            &req_id,
            echoed_session,
            wire::DUPLICATE_REQUEST_ID,
        ));
        return;
    }
    if state.uplink.lock().await.is_none() {
        let _ = tx.send(err_response(
            &req_id,
            echoed_session,
            wire::EXTENSION_NOT_CONNECTED,
        ));
        return;
    }

    let deadline = Duration::from_millis(state.config.request_timeout_ms);
    let rx = match state
        .pending
        .register(&req_id, Some(session_id.clone()), deadline)
        .await
    {
        Ok(rx) => rx,
        Err(_) => {
            let _ = tx.send(err_response(
                &req_id,
                echoed_session,
                wire::DUPLICATE_REQUEST_ID,
            ));
            return;
        }
    };

    debug!(
        req_id = %req_id,
        session = %session_id,
        action = %request.action,
        "forwarding request to extension"
    );
    if !send_to_extension(state, Frame::Request(request)).await {
        // Uplink vanished between the check and the send.
        state
            .pending
            .complete(&req_id, Err(wire::EXTENSION_NOT_CONNECTED.to_string()))
            .await;
    }

    // One route home: the helper connection that issued the request.
    let tx = tx.clone();
    tokio::spawn(async move {
        if let Ok(outcome) = rx.await {
            let frame = match outcome {
                Ok(data) => Frame::Response(ResponseFrame::ok(req_id, Some(session_id), data)),
                Err(error) => {
                    Frame::Response(ResponseFrame::err(req_id, Some(session_id), error))
                }
            };
            let _ = tx.send(frame);
        }
    });
}

fn err_response(req_id: &str, session_id: Option<String>, error: &str) -> Frame {
    Frame::Response(ResponseFrame::err(req_id.to_string(), session_id, error))
}

async fn finish_session(state: &Arc<DaemonState>, session_id: &str) {
    let aborted = state
        .pending
        .abort_session(session_id, wire::SESSION_ENDED)
        .await;
    send_to_extension(
        state,
        Frame::SessionEnd {
            session_id: session_id.to_string(),
        },
    )
    .await;
    state.sessions_changed.notify_one();
    info!(session = %session_id, aborted, "session ended");
}

async fn send_to_extension(state: &Arc<DaemonState>, frame: Frame) -> bool {
    let guard = state.uplink.lock().await;
    match guard.as_ref() {
        Some(uplink) => match serde_json::to_string(&frame) {
            Ok(text) => uplink.tx.send(WsMessage::Text(text)).is_ok(),
            Err(e) => {
                error!(error = %e, "failed to serialize uplink frame");
                false
            }
        },
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Extension side
// ---------------------------------------------------------------------------

async fn handle_extension_conn(
    state: Arc<DaemonState>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "extension websocket handshake failed");
            return;
        }
    };
    info!(%peer, "extension connected");

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let epoch = state.uplink_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let pong_tx = tx.clone();
    let replaced = {
        let mut guard = state.uplink.lock().await;
        guard.replace(UplinkHandle { tx, epoch }).is_some()
    };
    if replaced {
        // Requests forwarded on the old socket can never answer.
        let aborted = state.pending.abort_all(wire::EXTENSION_DISCONNECTED).await;
        info!(aborted, "replaced previous extension uplink");
    }

    while let Some(msg) = source.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => handle_extension_text(&state, &text).await,
            Ok(WsMessage::Ping(payload)) => {
                let _ = pong_tx.send(WsMessage::Pong(payload));
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "extension read error");
                break;
            }
        }
    }

    writer_task.abort();
    uplink_lost(&state, epoch).await;
    info!(%peer, "extension disconnected");
}

async fn handle_extension_text(state: &Arc<DaemonState>, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Response(response)) => {
            let req_id = response.req_id.clone();
            let session_id = response.session_id.clone();
            let ok = response.ok;
            let delivered = state
                .pending
                .complete(&req_id, response.into_outcome())
                .await;
            if delivered {
                if let Some(session_id) = &session_id {
                    state.sessions.touch(session_id).await;
                }
                debug!(req_id = %req_id, ok, "response routed to helper");
            } else {
                debug!(req_id = %req_id, "dropping response with no pending entry");
            }
        }
        Ok(other) => {
            debug!(?other, "ignoring non-response frame from extension");
        }
        Err(e) => {
            warn!(error = %e, "malformed frame from extension");
        }
    }
}

/// Sessions survive uplink loss; only in-flight requests are aborted. Helpers
/// may retry once an extension reconnects.
async fn uplink_lost(state: &Arc<DaemonState>, epoch: u64) {
    let mut guard = state.uplink.lock().await;
    let current = guard.as_ref().map(|u| u.epoch) == Some(epoch);
    if current {
        *guard = None;
        drop(guard);
        let aborted = state.pending.abort_all(wire::EXTENSION_DISCONNECTED).await;
        if aborted > 0 {
            info!(aborted, "aborted in-flight requests after extension loss");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabrelay_core::MAX_FRAME_BYTES;
    use tokio_tungstenite::connect_async;

    fn test_config(tmp: &tempfile::TempDir, max_sessions: usize, idle_ms: u64) -> (Config, Paths) {
        let paths = Paths::with_base(tmp.path().join("base"));
        let config = Config {
            ws_host: "127.0.0.1".to_string(),
            ws_port: 0,
            max_sessions,
            idle_timeout_ms: idle_ms,
            request_timeout_ms: 5_000,
            ..Config::default()
        };
        (config, paths)
    }

    async fn read_frame(stream: &mut UnixStream, buffer: &mut FrameBuffer) -> Frame {
        loop {
            if let Some(frame) = buffer.next_frame::<Frame>().unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "daemon closed the connection unexpectedly");
            buffer.extend(&chunk[..n]);
        }
    }

    async fn send_frame(stream: &mut UnixStream, frame: &Frame) {
        stream
            .write_all(&encode_frame(frame, MAX_FRAME_BYTES).unwrap())
            .await
            .unwrap();
    }

    async fn register(stream: &mut UnixStream, buffer: &mut FrameBuffer) -> String {
        send_frame(stream, &Frame::Register).await;
        match read_frame(stream, buffer).await {
            Frame::RegisterOk { session_id } => session_id,
            other => panic!("expected REGISTER_OK, got {other:?}"),
        }
    }

    /// The uplink installs a beat after the client handshake finishes; poll
    /// STATUS until the daemon reports it.
    async fn wait_for_uplink(stream: &mut UnixStream, buffer: &mut FrameBuffer) {
        for _ in 0..100 {
            send_frame(stream, &Frame::Status).await;
            match read_frame(stream, buffer).await {
                Frame::StatusOk {
                    extension_connected: true,
                    ..
                } => return,
                Frame::StatusOk { .. } => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => panic!("expected STATUS_OK, got {other:?}"),
            }
        }
        panic!("extension uplink never became ready");
    }

    #[tokio::test]
    async fn test_register_status_and_extensionless_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_config(&tmp, 10, 60_000);
        let handle = RouterDaemon::new(config, paths).start().await.unwrap();

        let mut stream = UnixStream::connect(&handle.socket_path).await.unwrap();
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        let session_id = register(&mut stream, &mut buffer).await;

        send_frame(&mut stream, &Frame::Status).await;
        match read_frame(&mut stream, &mut buffer).await {
            Frame::StatusOk {
                extension_connected,
                active_sessions,
            } => {
                assert!(!extension_connected);
                assert_eq!(active_sessions, 1);
            }
            other => panic!("expected STATUS_OK, got {other:?}"),
        }

        // No uplink: the request fails fast with a typed error.
        send_frame(
            &mut stream,
            &Frame::Request(RequestFrame {
                req_id: format!("{session_id}:1"),
                session_id: Some(session_id.clone()),
                action: "navigate".into(),
                params: json!({"url": "https://a.example"}),
                tab_id: None,
            }),
        )
        .await;
        match read_frame(&mut stream, &mut buffer).await {
            Frame::Response(resp) => {
                assert!(!resp.ok);
                assert_eq!(resp.error.as_deref(), Some(wire::EXTENSION_NOT_CONNECTED));
                assert_eq!(resp.req_id, format!("{session_id}:1"));
            }
            other => panic!("expected RESPONSE, got {other:?}"),
        }
        assert!(handle.state.pending.is_empty().await, "no zombie entries");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_session_cap_rejects_and_closes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_config(&tmp, 1, 60_000);
        let handle = RouterDaemon::new(config, paths).start().await.unwrap();

        let mut first = UnixStream::connect(&handle.socket_path).await.unwrap();
        let mut first_buf = FrameBuffer::new(MAX_FRAME_BYTES);
        register(&mut first, &mut first_buf).await;

        let mut second = UnixStream::connect(&handle.socket_path).await.unwrap();
        let mut second_buf = FrameBuffer::new(MAX_FRAME_BYTES);
        send_frame(&mut second, &Frame::Register).await;
        match read_frame(&mut second, &mut second_buf).await {
            Frame::RegisterError { error } => {
                assert_eq!(error, wire::SESSION_LIMIT_EXCEEDED);
            }
            other => panic!("expected REGISTER_ERROR, got {other:?}"),
        }
        // The daemon closes the rejected connection.
        let mut chunk = [0u8; 64];
        let n = second.read(&mut chunk).await.unwrap();
        assert_eq!(n, 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_round_trip_through_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_config(&tmp, 10, 60_000);
        let handle = RouterDaemon::new(config, paths).start().await.unwrap();

        let (ws, _) = connect_async(format!("ws://{}", handle.ws_addr))
            .await
            .unwrap();
        let (mut ext_sink, mut ext_source) = ws.split();

        let mut stream = UnixStream::connect(&handle.socket_path).await.unwrap();
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        wait_for_uplink(&mut stream, &mut buffer).await;
        let session_id = register(&mut stream, &mut buffer).await;

        // The extension learns about the session out of band.
        let start = ext_source.next().await.unwrap().unwrap();
        let start: Frame = serde_json::from_str(start.to_text().unwrap()).unwrap();
        assert_eq!(
            start,
            Frame::SessionStart {
                session_id: session_id.clone()
            }
        );

        let req_id = format!("{session_id}:1");
        send_frame(
            &mut stream,
            &Frame::Request(RequestFrame {
                req_id: req_id.clone(),
                session_id: Some(session_id.clone()),
                action: "get_page_info".into(),
                params: json!({}),
                tab_id: None,
            }),
        )
        .await;

        // Extension receives the request unchanged and answers.
        let forwarded = ext_source.next().await.unwrap().unwrap();
        let forwarded: Frame = serde_json::from_str(forwarded.to_text().unwrap()).unwrap();
        match &forwarded {
            Frame::Request(req) => {
                assert_eq!(req.req_id, req_id);
                assert_eq!(req.session_id.as_deref(), Some(session_id.as_str()));
            }
            other => panic!("expected forwarded REQUEST, got {other:?}"),
        }
        let reply = Frame::Response(ResponseFrame::ok(
            req_id.clone(),
            Some(session_id.clone()),
            json!({"title": "Example"}),
        ));
        ext_sink
            .send(WsMessage::Text(serde_json::to_string(&reply).unwrap()))
            .await
            .unwrap();

        match read_frame(&mut stream, &mut buffer).await {
            Frame::Response(resp) => {
                assert!(resp.ok);
                assert_eq!(resp.req_id, req_id);
                assert_eq!(resp.data.unwrap()["title"], "Example");
            }
            other => panic!("expected RESPONSE, got {other:?}"),
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_extension_loss_aborts_in_flight_requests() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_config(&tmp, 10, 60_000);
        let handle = RouterDaemon::new(config, paths).start().await.unwrap();

        let (ws, _) = connect_async(format!("ws://{}", handle.ws_addr))
            .await
            .unwrap();
        let (ext_sink, mut ext_source) = ws.split();

        let mut stream = UnixStream::connect(&handle.socket_path).await.unwrap();
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        wait_for_uplink(&mut stream, &mut buffer).await;
        let session_id = register(&mut stream, &mut buffer).await;
        let _ = ext_source.next().await; // SESSION_START

        let req_id = format!("{session_id}:1");
        send_frame(
            &mut stream,
            &Frame::Request(RequestFrame {
                req_id: req_id.clone(),
                session_id: Some(session_id.clone()),
                action: "screenshot".into(),
                params: json!({}),
                tab_id: None,
            }),
        )
        .await;
        let _ = ext_source.next().await; // the forwarded request

        // Extension dies before answering.
        drop(ext_sink);
        drop(ext_source);

        match read_frame(&mut stream, &mut buffer).await {
            Frame::Response(resp) => {
                assert!(!resp.ok);
                assert_eq!(resp.error.as_deref(), Some(wire::EXTENSION_DISCONNECTED));
            }
            other => panic!("expected RESPONSE, got {other:?}"),
        }
        assert!(handle.state.pending.is_empty().await, "no zombie entries");

        // Session survives the uplink loss.
        send_frame(&mut stream, &Frame::Status).await;
        match read_frame(&mut stream, &mut buffer).await {
            Frame::StatusOk {
                extension_connected,
                active_sessions,
            } => {
                assert!(!extension_connected);
                assert_eq!(active_sessions, 1);
            }
            other => panic!("expected STATUS_OK, got {other:?}"),
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_idle_exit_removes_socket_and_pid_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_config(&tmp, 10, 50);
        let handle = RouterDaemon::new(config, paths).start().await.unwrap();
        let socket_path = handle.socket_path.clone();
        let pid_file = handle.pid_file.clone();
        assert!(pid_file.exists());

        // Register, then disconnect; the daemon should idle out shortly after.
        {
            let mut stream = UnixStream::connect(&socket_path).await.unwrap();
            let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
            let session_id = register(&mut stream, &mut buffer).await;
            send_frame(&mut stream, &Frame::Disconnect { session_id }).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("daemon should idle-exit")
            .unwrap();
        assert!(!socket_path.exists());
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_duplicate_req_id_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, paths) = test_config(&tmp, 10, 60_000);
        let handle = RouterDaemon::new(config, paths).start().await.unwrap();

        let (ws, _) = connect_async(format!("ws://{}", handle.ws_addr))
            .await
            .unwrap();
        let (_ext_sink, mut ext_source) = ws.split();

        let mut stream = UnixStream::connect(&handle.socket_path).await.unwrap();
        let mut buffer = FrameBuffer::new(MAX_FRAME_BYTES);
        wait_for_uplink(&mut stream, &mut buffer).await;
        let session_id = register(&mut stream, &mut buffer).await;
        let _ = ext_source.next().await; // SESSION_START

        let request = Frame::Request(RequestFrame {
            req_id: format!("{session_id}:1"),
            session_id: Some(session_id.clone()),
            action: "get_tabs".into(),
            params: json!({}),
            tab_id: None,
        });
        send_frame(&mut stream, &request).await;
        let _ = ext_source.next().await; // first forward

        // Same reqId while the first is still in flight.
        send_frame(&mut stream, &request).await;
        match read_frame(&mut stream, &mut buffer).await {
            Frame::Response(resp) => {
                assert!(!resp.ok);
                assert_eq!(resp.error.as_deref(), Some(wire::DUPLICATE_REQUEST_ID));
            }
            other => panic!("expected RESPONSE, got {other:?}"),
        }

        handle.stop().await;
    }
}
