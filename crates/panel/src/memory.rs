//! In-memory tab host and echo executor.
//!
//! Backs the `tabrelay panel` development harness and the panel's tests; no
//! real browser is involved.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use tabrelay_core::{wire, ActionKind, Error, Result};

use crate::executor::{ActionExecutor, TabHost, TabId, TabInfo};

pub struct MemoryTabHost {
    tabs: Mutex<HashMap<TabId, TabInfo>>,
    active: Mutex<Option<TabId>>,
    next_id: AtomicI64,
}

impl MemoryTabHost {
    pub fn new() -> Self {
        Self {
            tabs: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            next_id: AtomicI64::new(1),
        }
    }

    /// Seed a tab directly (the "user already had tabs open" case).
    pub fn insert_tab(&self, url: Option<&str>, active: bool) -> TabId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = TabInfo {
            id,
            url: url.map(|u| u.to_string()),
            active,
        };
        self.tabs.lock().unwrap().insert(id, info);
        if active {
            *self.active.lock().unwrap() = Some(id);
        }
        id
    }

    /// Simulate the user closing a tab.
    pub fn remove_tab(&self, id: TabId) {
        self.tabs.lock().unwrap().remove(&id);
        let mut active = self.active.lock().unwrap();
        if *active == Some(id) {
            *active = None;
        }
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.lock().unwrap().len()
    }
}

#[async_trait]
impl TabHost for MemoryTabHost {
    async fn get_tab(&self, id: TabId) -> Option<TabInfo> {
        self.tabs.lock().unwrap().get(&id).cloned()
    }

    async fn active_tab(&self) -> Option<TabInfo> {
        let active = *self.active.lock().unwrap();
        let tabs = self.tabs.lock().unwrap();
        active.and_then(|id| tabs.get(&id).cloned())
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = TabInfo {
            id,
            url: Some(url.to_string()),
            active: false,
        };
        self.tabs.lock().unwrap().insert(id, info.clone());
        Ok(info)
    }

    async fn close_tab(&self, id: TabId) -> Result<()> {
        match self.tabs.lock().unwrap().remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(wire::TAB_NOT_FOUND.to_string())),
        }
    }
}

/// Executor that records helper injection and echoes every action back.
/// `screenshot` returns a small base64 PNG so image plumbing can be exercised
/// end to end.
#[derive(Default)]
pub struct EchoExecutor {
    injected: Mutex<HashSet<TabId>>,
}

/// 1x1 transparent PNG.
const TINY_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn injection_count(&self) -> usize {
        self.injected.lock().unwrap().len()
    }
}

#[async_trait]
impl ActionExecutor for EchoExecutor {
    async fn ensure_helpers(&self, tab: TabId) -> Result<()> {
        // Repeated injection is a no-op, matching the ping-then-inject
        // behavior of the real content helpers.
        self.injected.lock().unwrap().insert(tab);
        Ok(())
    }

    async fn execute(&self, tab: TabId, action: ActionKind, params: Value) -> Result<Value> {
        match action {
            ActionKind::Screenshot => Ok(json!({
                "screenshot": TINY_PNG_BASE64,
                "mimeType": "image/png",
            })),
            _ => Ok(json!({
                "action": action.as_str(),
                "tabId": tab,
                "params": params,
            })),
        }
    }
}
