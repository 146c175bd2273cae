//! Seams between the routing core and the browser.
//!
//! The side panel is the only component that knows tabs, and the action
//! executor is the only component that touches page content. Both are opaque
//! to the router; the panel drives them through these traits.

use async_trait::async_trait;
use serde_json::Value;

use tabrelay_core::{ActionKind, Result};

pub type TabId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub active: bool,
}

/// Browser-side tab operations the binder needs.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn get_tab(&self, id: TabId) -> Option<TabInfo>;
    async fn active_tab(&self) -> Option<TabInfo>;
    async fn create_tab(&self, url: &str) -> Result<TabInfo>;
    async fn close_tab(&self, id: TabId) -> Result<()>;
}

/// The CDP-driven automation subsystem, treated as external.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Inject content helpers into the tab if a ping round-trip says they are
    /// missing. Must be idempotent.
    async fn ensure_helpers(&self, tab: TabId) -> Result<()>;

    async fn execute(&self, tab: TabId, action: ActionKind, params: Value) -> Result<Value>;
}
