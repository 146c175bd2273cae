//! The helper's transport to the browser: through the router daemon in the
//! normal case, or hosting the extension WebSocket itself in direct mode.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tabrelay_core::{
    encode_frame, wire, ActionKind, Config, Error, Frame, FrameBuffer, PendingTable, RequestFrame,
    RequestOutcome, Result,
};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub connected: bool,
    pub mode: &'static str,
    pub session_id: Option<String>,
}

pub enum Bridge {
    Daemon(DaemonBridge),
    Direct(DirectBridge),
}

impl Bridge {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Daemon(_) => "daemon",
            Self::Direct(_) => "direct",
        }
    }

    pub async fn request(
        &self,
        action: ActionKind,
        params: Value,
        tab_id: Option<i64>,
    ) -> RequestOutcome {
        match self {
            Self::Daemon(bridge) => bridge.request(action, params, tab_id).await,
            Self::Direct(bridge) => bridge.request(action, params, tab_id).await,
        }
    }

    pub async fn status(&self) -> Result<StatusReport> {
        match self {
            Self::Daemon(bridge) => bridge.status().await,
            Self::Direct(bridge) => Ok(bridge.status().await),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Daemon(bridge) => bridge.shutdown().await,
            Self::Direct(bridge) => bridge.shutdown().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon mode
// ---------------------------------------------------------------------------

type RegisterSlot = Arc<Mutex<Option<oneshot::Sender<std::result::Result<String, String>>>>>;
type StatusSlot = Arc<Mutex<Option<oneshot::Sender<(bool, usize)>>>>;

pub struct DaemonBridge {
    session_id: String,
    counter: AtomicU64,
    pending: PendingTable,
    out_tx: mpsc::UnboundedSender<Frame>,
    status_slot: StatusSlot,
    alive: Arc<AtomicBool>,
    request_timeout_ms: u64,
}

impl DaemonBridge {
    /// Take an established IPC stream, register, and return once the daemon
    /// has assigned a session.
    pub async fn connect(stream: UnixStream, config: &Config) -> Result<Self> {
        let max_frame_bytes = config.max_frame_bytes;
        let (mut reader, mut writer) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match encode_frame(&frame, max_frame_bytes) {
                    Ok(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode outbound frame"),
                }
            }
        });

        let pending = PendingTable::new();
        let status_slot: StatusSlot = Arc::new(Mutex::new(None));
        let register_slot: RegisterSlot = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        let (register_tx, register_rx) = oneshot::channel();
        *register_slot.lock().await = Some(register_tx);

        let reader_pending = pending.clone();
        let reader_status = status_slot.clone();
        let reader_register = register_slot.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            let mut buffer = FrameBuffer::new(max_frame_bytes);
            let mut chunk = [0u8; 8192];
            'conn: loop {
                let n = match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                buffer.extend(&chunk[..n]);
                loop {
                    match buffer.next_frame::<Frame>() {
                        Ok(Some(frame)) => {
                            dispatch_daemon_frame(
                                frame,
                                &reader_pending,
                                &reader_status,
                                &reader_register,
                            )
                            .await;
                        }
                        Ok(None) => break,
                        Err(Error::Json(e)) => {
                            warn!(error = %e, "dropping malformed frame from daemon");
                        }
                        Err(e) => {
                            warn!(error = %e, "daemon stream corrupted");
                            break 'conn;
                        }
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            reader_pending.abort_all(wire::DAEMON_NOT_CONNECTED).await;
            if let Some(tx) = reader_register.lock().await.take() {
                let _ = tx.send(Err(wire::DAEMON_NOT_CONNECTED.to_string()));
            }
            // Dropping a parked status sender wakes its waiter with an error.
            reader_status.lock().await.take();
        });

        out_tx
            .send(Frame::Register)
            .map_err(|_| Error::Transport(wire::DAEMON_NOT_CONNECTED.to_string()))?;
        let session_id = tokio::time::timeout(CONTROL_TIMEOUT, register_rx)
            .await
            .map_err(|_| Error::Timeout("timed out waiting for REGISTER_OK".to_string()))?
            .map_err(|_| Error::Transport(wire::DAEMON_NOT_CONNECTED.to_string()))?
            .map_err(Error::Session)?;
        info!(session = %session_id, "registered with daemon");

        Ok(Self {
            session_id,
            counter: AtomicU64::new(0),
            pending,
            out_tx,
            status_slot,
            alive,
            request_timeout_ms: config.request_timeout_ms,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `${sessionId}:${counter}` — unique across helpers even though the
    /// daemon never re-namespaces ids.
    fn next_req_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}:{seq}", self.session_id)
    }

    pub async fn request(
        &self,
        action: ActionKind,
        params: Value,
        tab_id: Option<i64>,
    ) -> RequestOutcome {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(wire::DAEMON_NOT_CONNECTED.to_string());
        }
        let req_id = self.next_req_id();
        let rx = match self
            .pending
            .register(
                &req_id,
                Some(self.session_id.clone()),
                Duration::from_millis(self.request_timeout_ms),
            )
            .await
        {
            Ok(rx) => rx,
            Err(e) => return Err(e.to_string()),
        };

        let frame = Frame::Request(RequestFrame {
            req_id: req_id.clone(),
            session_id: Some(self.session_id.clone()),
            action: action.as_str().to_string(),
            params,
            tab_id,
        });
        if self.out_tx.send(frame).is_err() {
            self.pending
                .complete(&req_id, Err(wire::DAEMON_NOT_CONNECTED.to_string()))
                .await;
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(wire::SHUTTING_DOWN.to_string()),
        }
    }

    pub async fn status(&self) -> Result<StatusReport> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Transport(wire::DAEMON_NOT_CONNECTED.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        *self.status_slot.lock().await = Some(tx);
        self.out_tx
            .send(Frame::Status)
            .map_err(|_| Error::Transport(wire::DAEMON_NOT_CONNECTED.to_string()))?;
        let (extension_connected, _active_sessions) = tokio::time::timeout(CONTROL_TIMEOUT, rx)
            .await
            .map_err(|_| Error::Timeout("status request timed out".to_string()))?
            .map_err(|_| Error::Transport(wire::DAEMON_NOT_CONNECTED.to_string()))?;
        Ok(StatusReport {
            connected: extension_connected,
            mode: "daemon",
            session_id: Some(self.session_id.clone()),
        })
    }

    /// Optional keep-alive for long-idle helpers.
    pub fn ping(&self) {
        let _ = self.out_tx.send(Frame::Ping);
    }

    pub async fn shutdown(&self) {
        let _ = self.out_tx.send(Frame::Disconnect {
            session_id: self.session_id.clone(),
        });
        self.pending.abort_all(wire::SHUTTING_DOWN).await;
        // Let the DISCONNECT flush before the socket drops.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn dispatch_daemon_frame(
    frame: Frame,
    pending: &PendingTable,
    status_slot: &StatusSlot,
    register_slot: &RegisterSlot,
) {
    match frame {
        Frame::RegisterOk { session_id } => {
            if let Some(tx) = register_slot.lock().await.take() {
                let _ = tx.send(Ok(session_id));
            }
        }
        Frame::RegisterError { error } => {
            if let Some(tx) = register_slot.lock().await.take() {
                let _ = tx.send(Err(error));
            }
        }
        Frame::Response(response) => {
            let req_id = response.req_id.clone();
            if !pending.complete(&req_id, response.into_outcome()).await {
                debug!(req_id = %req_id, "dropping response with no waiter");
            }
        }
        Frame::StatusOk {
            extension_connected,
            active_sessions,
        } => {
            if let Some(tx) = status_slot.lock().await.take() {
                let _ = tx.send((extension_connected, active_sessions));
            }
        }
        Frame::Pong => {}
        other => debug!(?other, "ignoring frame from daemon"),
    }
}

// ---------------------------------------------------------------------------
// Direct mode
// ---------------------------------------------------------------------------

type DirectUplink = Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>;

/// Fallback when no daemon can be reached: the helper opens the WebSocket
/// listener itself and plays daemon for exactly one session. A second
/// extension connection is refused while one is live.
pub struct DirectBridge {
    client_id: String,
    counter: AtomicU64,
    pending: PendingTable,
    uplink: DirectUplink,
    request_timeout_ms: u64,
    pub local_addr: std::net::SocketAddr,
    accept_task: JoinHandle<()>,
}

impl DirectBridge {
    pub async fn start(config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(config.ws_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "direct mode: listening for the extension");

        let uplink: DirectUplink = Arc::new(Mutex::new(None));
        let pending = PendingTable::new();

        let accept_uplink = uplink.clone();
        let accept_pending = pending.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let uplink = accept_uplink.clone();
                let pending = accept_pending.clone();
                tokio::spawn(async move {
                    handle_direct_conn(stream, peer, uplink, pending).await;
                });
            }
        });

        let id = Uuid::new_v4().simple().to_string();
        Ok(Self {
            client_id: format!("direct-{}", &id[..8]),
            counter: AtomicU64::new(0),
            pending,
            uplink,
            request_timeout_ms: config.request_timeout_ms,
            local_addr,
            accept_task,
        })
    }

    pub async fn request(
        &self,
        action: ActionKind,
        params: Value,
        tab_id: Option<i64>,
    ) -> RequestOutcome {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let req_id = format!("{}:{seq}", self.client_id);

        let frame = Frame::Request(RequestFrame {
            req_id: req_id.clone(),
            session_id: Some(self.client_id.clone()),
            action: action.as_str().to_string(),
            params,
            tab_id,
        });
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => return Err(e.to_string()),
        };

        let rx = match self
            .pending
            .register(
                &req_id,
                Some(self.client_id.clone()),
                Duration::from_millis(self.request_timeout_ms),
            )
            .await
        {
            Ok(rx) => rx,
            Err(e) => return Err(e.to_string()),
        };

        let sent = {
            let guard = self.uplink.lock().await;
            match guard.as_ref() {
                Some(tx) => tx.send(WsMessage::Text(text)).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending
                .complete(&req_id, Err(wire::EXTENSION_NOT_CONNECTED.to_string()))
                .await;
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(wire::SHUTTING_DOWN.to_string()),
        }
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            connected: self.uplink.lock().await.is_some(),
            mode: "direct",
            session_id: None,
        }
    }

    pub async fn shutdown(&self) {
        self.pending.abort_all(wire::SHUTTING_DOWN).await;
        self.uplink.lock().await.take();
        self.accept_task.abort();
    }
}

impl Drop for DirectBridge {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_direct_conn(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    uplink: DirectUplink,
    pending: PendingTable,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "extension websocket handshake failed");
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    {
        let mut guard = uplink.lock().await;
        if guard.is_some() {
            warn!(%peer, "refusing second extension connection in direct mode");
            drop(guard);
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });
        *guard = Some(tx);
    }
    info!(%peer, "extension connected (direct)");

    while let Some(msg) = source.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Response(response)) => {
                    let req_id = response.req_id.clone();
                    if !pending.complete(&req_id, response.into_outcome()).await {
                        debug!(req_id = %req_id, "dropping response with no waiter");
                    }
                }
                Ok(other) => debug!(?other, "ignoring non-response frame from extension"),
                Err(e) => warn!(error = %e, "malformed frame from extension"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "extension read error");
                break;
            }
        }
    }

    uplink.lock().await.take();
    pending.abort_all(wire::EXTENSION_DISCONNECTED).await;
    info!(%peer, "extension disconnected (direct)");
}
