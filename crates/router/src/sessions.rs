use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use tabrelay_core::{wire, Error, Frame, Result};

/// One registered helper conversation.
pub struct Session {
    pub session_id: String,
    /// Identity of the helper connection that owns this session.
    pub conn_id: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Outbound queue of the owning helper connection.
    pub writer: mpsc::UnboundedSender<Frame>,
}

/// The daemon's session table. Owned by the daemon's event loop; identifiers
/// are never reused within a process lifetime.
pub struct SessionTable {
    max_sessions: usize,
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh session for a helper connection.
    pub async fn register(
        &self,
        conn_id: u64,
        writer: mpsc::UnboundedSender<Frame>,
    ) -> Result<String> {
        let mut table = self.inner.lock().await;
        if table.len() >= self.max_sessions {
            return Err(Error::Session(wire::SESSION_LIMIT_EXCEEDED.to_string()));
        }
        let session_id = format!("sess_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        table.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                conn_id,
                created_at: now,
                last_active_at: now,
                writer,
            },
        );
        Ok(session_id)
    }

    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().await.remove(session_id)
    }

    /// Drop every session owned by one helper connection (used when the
    /// connection closes). Returns the removed sessions.
    pub async fn remove_by_conn(&self, conn_id: u64) -> Vec<Session> {
        let mut table = self.inner.lock().await;
        let doomed: Vec<String> = table
            .values()
            .filter(|s| s.conn_id == conn_id)
            .map(|s| s.session_id.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|id| table.remove(id))
            .collect()
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.inner.lock().await.get_mut(session_id) {
            session.last_active_at = Utc::now();
        }
    }

    pub async fn touch_conn(&self, conn_id: u64) {
        let mut table = self.inner.lock().await;
        for session in table.values_mut() {
            if session.conn_id == conn_id {
                session.last_active_at = Utc::now();
            }
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().await.contains_key(session_id)
    }

    pub async fn writer(&self, session_id: &str) -> Option<mpsc::UnboundedSender<Frame>> {
        self.inner
            .lock()
            .await
            .get(session_id)
            .map(|s| s.writer.clone())
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }
}
