//! Correlation of in-flight requests with their eventual responses.
//!
//! Each entry pairs a request id with a one-shot continuation and a deadline.
//! An entry resolves exactly once: by a matching response, by its deadline
//! firing, or by a bulk abort when its session or transport dies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{wire, Error, Result};

/// What the waiter sees: response data on success, an error string otherwise.
pub type RequestOutcome = std::result::Result<Value, String>;

struct Entry {
    session_id: Option<String>,
    tx: oneshot::Sender<RequestOutcome>,
    deadline: JoinHandle<()>,
}

#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `req_id`. The returned receiver resolves when a
    /// response arrives, the deadline fires, or the entry is aborted.
    ///
    /// A colliding `req_id` is a caller bug: callers check `has()` (or derive
    /// ids from a monotonic counter) before registering.
    pub async fn register(
        &self,
        req_id: &str,
        session_id: Option<String>,
        deadline: Duration,
    ) -> Result<oneshot::Receiver<RequestOutcome>> {
        let mut table = self.inner.lock().await;
        if table.contains_key(req_id) {
            debug_assert!(false, "pending entry already exists for {req_id}");
            return Err(Error::Routing(format!(
                "{}: {req_id}",
                wire::DUPLICATE_REQUEST_ID
            )));
        }

        let (tx, rx) = oneshot::channel();
        let timer_table = self.inner.clone();
        let timer_req_id = req_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let mut table = timer_table.lock().await;
            if let Some(entry) = table.remove(&timer_req_id) {
                debug!(req_id = %timer_req_id, "pending request timed out");
                let _ = entry.tx.send(Err(wire::TIMEOUT.to_string()));
            }
        });

        table.insert(
            req_id.to_string(),
            Entry {
                session_id,
                tx,
                deadline: timer,
            },
        );
        Ok(rx)
    }

    /// Resolve `req_id`. Returns false when the entry is unknown (already
    /// resolved, timed out, or never registered); the caller drops the
    /// response silently in that case.
    pub async fn complete(&self, req_id: &str, outcome: RequestOutcome) -> bool {
        let entry = self.inner.lock().await.remove(req_id);
        match entry {
            Some(entry) => {
                entry.deadline.abort();
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject every pending entry for one session. Returns how many aborted.
    pub async fn abort_session(&self, session_id: &str, reason: &str) -> usize {
        let mut table = self.inner.lock().await;
        let doomed: Vec<String> = table
            .iter()
            .filter(|(_, e)| e.session_id.as_deref() == Some(session_id))
            .map(|(id, _)| id.clone())
            .collect();
        for req_id in &doomed {
            if let Some(entry) = table.remove(req_id) {
                entry.deadline.abort();
                let _ = entry.tx.send(Err(reason.to_string()));
            }
        }
        doomed.len()
    }

    /// Reject everything and empty the table. Returns how many aborted.
    pub async fn abort_all(&self, reason: &str) -> usize {
        let mut table = self.inner.lock().await;
        let count = table.len();
        for (_, entry) in table.drain() {
            entry.deadline.abort();
            let _ = entry.tx.send(Err(reason.to_string()));
        }
        count
    }

    pub async fn has(&self, req_id: &str) -> bool {
        self.inner.lock().await.contains_key(req_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
