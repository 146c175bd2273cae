//! The side-panel event loop.
//!
//! Connects to the daemon's WebSocket (or a direct-mode helper's), translates
//! each REQUEST into an executor dispatch against a resolved tab, and echoes
//! the RESPONSE. Sessions arrive and leave via SESSION_START / SESSION_END.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use tabrelay_core::{
    validate_params, ActionKind, Config, Error, Frame, RequestFrame, ResponseFrame, Result,
};

use crate::binder::TabBinder;
use crate::executor::{ActionExecutor, TabHost};

const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub line: String,
}

/// Bounded in-memory log the panel UI renders; oldest entries fall off.
#[derive(Default)]
pub struct LogPane {
    entries: std::sync::Mutex<VecDeque<LogEntry>>,
}

impl LogPane {
    pub fn push(&self, line: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(LogEntry {
            at: Utc::now(),
            line: line.into(),
        });
        while entries.len() > LOG_CAPACITY {
            entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

pub struct SidePanel {
    config: Config,
    executor: Arc<dyn ActionExecutor>,
    binder: TabBinder,
    log: LogPane,
    reconnect_kick: Notify,
    attempts: AtomicU32,
}

impl SidePanel {
    pub fn new(
        config: Config,
        host: Arc<dyn TabHost>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            config,
            executor,
            binder: TabBinder::new(host),
            log: LogPane::default(),
            reconnect_kick: Notify::new(),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn log(&self) -> &LogPane {
        &self.log
    }

    pub fn binder(&self) -> &TabBinder {
        &self.binder
    }

    /// Manual reconnect control: resets the retry budget and skips the
    /// current backoff sleep.
    pub fn reconnect_now(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.reconnect_kick.notify_one();
    }

    /// Connect, serve, and reconnect with a fixed backoff until the retry cap
    /// is exhausted.
    pub async fn run(&self) -> Result<()> {
        let url = self.config.ws_url();
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(url = %url, "panel connected");
                    self.log.push(format!("connected to {url}"));
                    self.attempts.store(0, Ordering::SeqCst);
                    self.serve(ws).await;
                    self.log.push("disconnected");
                    warn!("panel connection lost");
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "panel connect failed");
                    self.log.push(format!("connect failed: {e}"));
                }
            }

            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts > self.config.panel.max_reconnect_attempts {
                return Err(Error::Transport(
                    "reconnect attempts exhausted".to_string(),
                ));
            }
            let delay = Duration::from_millis(self.config.panel.reconnect_delay_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect_kick.notified() => {}
            }
        }
    }

    async fn serve(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut sink, mut source) = ws.split();
        while let Some(msg) = source.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    let frame = match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "malformed frame from router");
                            self.log.push(format!("malformed frame: {e}"));
                            continue;
                        }
                    };
                    if let Some(reply) = self.handle_frame(frame).await {
                        let text = match serde_json::to_string(&reply) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize response");
                                continue;
                            }
                        };
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(WsMessage::Ping(payload)) => {
                    if sink.send(WsMessage::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "panel read error");
                    break;
                }
            }
        }
    }

    /// Handle one inbound frame; the returned frame, if any, goes back on the
    /// wire.
    pub async fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Request(request) => {
                self.log.push(format!(
                    "{} {} (session {})",
                    request.action,
                    request.req_id,
                    request.session_id.as_deref().unwrap_or("-")
                ));
                Some(Frame::Response(self.handle_request(request).await))
            }
            Frame::SessionStart { session_id } => {
                // No eager tab: an agent that only asks for status should
                // never pop a window.
                debug!(session = %session_id, "session started");
                None
            }
            Frame::SessionEnd { session_id } => {
                let closed = self
                    .binder
                    .cleanup(&session_id, self.config.panel.close_tab_on_session_end)
                    .await;
                self.log.push(match closed {
                    Some(tab) => format!("session {session_id} ended, closed tab {tab}"),
                    None => format!("session {session_id} ended"),
                });
                None
            }
            other => {
                debug!(?other, "ignoring frame");
                None
            }
        }
    }

    async fn handle_request(&self, request: RequestFrame) -> ResponseFrame {
        let req_id = request.req_id.clone();
        let session_id = request.session_id.clone();

        let tab = match self
            .binder
            .resolve_tab(session_id.as_deref(), request.tab_id)
            .await
        {
            Ok(tab) => tab,
            Err(e) => return self.failure(req_id, session_id, e),
        };

        let action = match request.action.parse::<ActionKind>() {
            Ok(action) => action,
            Err(e) => return self.failure(req_id, session_id, e),
        };
        if let Err(e) = validate_params(action, &request.params) {
            return self.failure(req_id, session_id, e);
        }

        if let Err(e) = self.executor.ensure_helpers(tab).await {
            return self.failure(req_id, session_id, e);
        }
        match self.executor.execute(tab, action, request.params).await {
            Ok(data) => {
                debug!(req_id = %req_id, tab, "action succeeded");
                ResponseFrame::ok(req_id, session_id, data)
            }
            Err(e) => self.failure(req_id, session_id, e),
        }
    }

    fn failure(&self, req_id: String, session_id: Option<String>, error: Error) -> ResponseFrame {
        let message = wire_message(error);
        self.log.push(format!("{req_id} failed: {message}"));
        ResponseFrame::err(req_id, session_id, message)
    }
}

/// Error strings on the wire stay bare ("tab not found"), without the
/// `thiserror` display prefixes.
fn wire_message(error: Error) -> String {
    match error {
        Error::Transport(s)
        | Error::Routing(s)
        | Error::Session(s)
        | Error::Action(s)
        | Error::Timeout(s)
        | Error::NotFound(s)
        | Error::Other(s)
        | Error::Config(s) => s,
        other => other.to_string(),
    }
}
