//! Session ↔ tab binding policy.
//!
//! A session's first implicit request opens a "home tab" and binds to it; the
//! binding is recreated lazily if the user closes that tab. An explicit tabId
//! always wins and moves the binding. Two sessions only ever share a tab when
//! one of them asked for it explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use tabrelay_core::{wire, Error, Result};

use crate::executor::{TabHost, TabId};

const NEW_TAB_URL: &str = "about:blank";

/// Hosts whose pages refuse content scripts even over https.
const WEB_STORE_HOSTS: &[&str] = &["chromewebstore.google.com"];

/// Whether a tab with this URL can host content helpers. Only ordinary
/// `http(s)` pages qualify; browser-internal pages and the extension web
/// stores do not.
pub fn is_scriptable_url(url: Option<&str>) -> bool {
    let Some(url) = url else { return false };
    let rest = if let Some(rest) = url.strip_prefix("https://") {
        rest
    } else if let Some(rest) = url.strip_prefix("http://") {
        rest
    } else {
        return false;
    };
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let host = host.split(':').next().unwrap_or(host);
    if WEB_STORE_HOSTS.contains(&host) {
        return false;
    }
    // The old web store lives under a path on a host that is otherwise fine.
    if host == "chrome.google.com" && path.starts_with("/webstore") {
        return false;
    }
    true
}

#[derive(Debug, Clone)]
pub struct TabBinding {
    pub tab_id: TabId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

pub struct TabBinder {
    host: Arc<dyn TabHost>,
    bindings: Mutex<HashMap<String, TabBinding>>,
}

impl TabBinder {
    pub fn new(host: Arc<dyn TabHost>) -> Self {
        Self {
            host,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<dyn TabHost> {
        &self.host
    }

    /// Resolve the target tab for one request.
    ///
    /// Explicit tab: must exist, and rebinding follows it. Session without a
    /// binding (or whose home tab died): a fresh tab. No session at all: the
    /// active tab if scriptable, else a fresh tab.
    pub async fn resolve_tab(
        &self,
        session_id: Option<&str>,
        explicit: Option<TabId>,
    ) -> Result<TabId> {
        if let Some(tab_id) = explicit {
            if self.host.get_tab(tab_id).await.is_none() {
                return Err(Error::NotFound(wire::TAB_NOT_FOUND.to_string()));
            }
            if let Some(session_id) = session_id {
                self.bind(session_id, tab_id).await;
            }
            return Ok(tab_id);
        }

        if let Some(session_id) = session_id {
            let bound = {
                let bindings = self.bindings.lock().await;
                bindings.get(session_id).map(|b| b.tab_id)
            };
            if let Some(tab_id) = bound {
                if self.host.get_tab(tab_id).await.is_some() {
                    self.touch(session_id).await;
                    return Ok(tab_id);
                }
                debug!(session = session_id, tab = tab_id, "home tab is gone");
            }
            let tab = self.host.create_tab(NEW_TAB_URL).await?;
            info!(session = session_id, tab = tab.id, "opened home tab");
            self.bind(session_id, tab.id).await;
            return Ok(tab.id);
        }

        // Sessionless request: current active tab when it can run scripts.
        if let Some(tab) = self.host.active_tab().await {
            if is_scriptable_url(tab.url.as_deref()) {
                return Ok(tab.id);
            }
        }
        let tab = self.host.create_tab(NEW_TAB_URL).await?;
        Ok(tab.id)
    }

    /// Tear down a session's binding. Returns the closed tab id, if any tab
    /// was closed.
    pub async fn cleanup(&self, session_id: &str, close_tab: bool) -> Option<TabId> {
        let binding = self.bindings.lock().await.remove(session_id)?;
        if close_tab {
            // Best effort: the tab may already be gone.
            if self.host.close_tab(binding.tab_id).await.is_ok() {
                info!(session = session_id, tab = binding.tab_id, "closed home tab");
                return Some(binding.tab_id);
            }
        }
        None
    }

    pub async fn binding(&self, session_id: &str) -> Option<TabBinding> {
        self.bindings.lock().await.get(session_id).cloned()
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.lock().await.len()
    }

    async fn bind(&self, session_id: &str, tab_id: TabId) {
        let now = Utc::now();
        let mut bindings = self.bindings.lock().await;
        match bindings.get_mut(session_id) {
            Some(binding) => {
                binding.tab_id = tab_id;
                binding.last_active_at = now;
            }
            None => {
                bindings.insert(
                    session_id.to_string(),
                    TabBinding {
                        tab_id,
                        created_at: now,
                        last_active_at: now,
                    },
                );
            }
        }
    }

    async fn touch(&self, session_id: &str) {
        if let Some(binding) = self.bindings.lock().await.get_mut(session_id) {
            binding.last_active_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTabHost;

    fn binder() -> (Arc<MemoryTabHost>, TabBinder) {
        let host = Arc::new(MemoryTabHost::new());
        (host.clone(), TabBinder::new(host))
    }

    #[test]
    fn test_scriptable_url_table() {
        assert!(!is_scriptable_url(None));
        assert!(!is_scriptable_url(Some("chrome://settings")));
        assert!(!is_scriptable_url(Some("about:blank")));
        assert!(!is_scriptable_url(Some("chrome-extension://abc/panel.html")));
        assert!(!is_scriptable_url(Some("devtools://devtools/inspector.html")));
        assert!(is_scriptable_url(Some("https://example.com")));
        assert!(is_scriptable_url(Some("http://localhost:3000/app")));
        assert!(!is_scriptable_url(Some(
            "https://chromewebstore.google.com/detail/x"
        )));
        assert!(!is_scriptable_url(Some(
            "https://chrome.google.com/webstore/detail/x"
        )));
        assert!(is_scriptable_url(Some("https://chrome.google.com/intl/en/about")));
    }

    #[tokio::test]
    async fn test_two_sessions_get_distinct_home_tabs() {
        let (_host, binder) = binder();
        let a = binder.resolve_tab(Some("s1"), None).await.unwrap();
        let b = binder.resolve_tab(Some("s2"), None).await.unwrap();
        assert_ne!(a, b);

        // Repeat requests stay on the home tab.
        assert_eq!(binder.resolve_tab(Some("s1"), None).await.unwrap(), a);
        assert_eq!(binder.resolve_tab(Some("s2"), None).await.unwrap(), b);
        assert_eq!(binder.binding_count().await, 2);
    }

    #[tokio::test]
    async fn test_explicit_tab_overrides_and_rebinds() {
        let (_host, binder) = binder();
        let home_s1 = binder.resolve_tab(Some("s1"), None).await.unwrap();
        let home_s2 = binder.resolve_tab(Some("s2"), None).await.unwrap();

        // s1 explicitly targets s2's home tab.
        let resolved = binder
            .resolve_tab(Some("s1"), Some(home_s2))
            .await
            .unwrap();
        assert_eq!(resolved, home_s2);

        // The binding followed: a later implicit request from s1 hits the
        // shared tab, and s2 is unaffected.
        assert_eq!(binder.resolve_tab(Some("s1"), None).await.unwrap(), home_s2);
        assert_eq!(binder.resolve_tab(Some("s2"), None).await.unwrap(), home_s2);
        assert_ne!(home_s1, home_s2);
    }

    #[tokio::test]
    async fn test_explicit_dead_tab_is_an_error() {
        let (_host, binder) = binder();
        let err = binder.resolve_tab(Some("s1"), Some(999)).await.unwrap_err();
        assert!(err.to_string().contains(wire::TAB_NOT_FOUND));
        assert!(binder.binding("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_closed_home_tab_is_recreated_lazily() {
        let (host, binder) = binder();
        let first = binder.resolve_tab(Some("s1"), None).await.unwrap();
        host.remove_tab(first);

        let second = binder.resolve_tab(Some("s1"), None).await.unwrap();
        assert_ne!(second, first);
        assert_eq!(binder.binding("s1").await.unwrap().tab_id, second);
        assert!(host.get_tab(second).await.is_some());
    }

    #[tokio::test]
    async fn test_sessionless_request_uses_scriptable_active_tab() {
        let (host, binder) = binder();
        let active = host.insert_tab(Some("https://example.com"), true);
        assert_eq!(binder.resolve_tab(None, None).await.unwrap(), active);
        assert_eq!(binder.binding_count().await, 0, "no implicit binding");
    }

    #[tokio::test]
    async fn test_sessionless_request_skips_internal_active_tab() {
        let (host, binder) = binder();
        let active = host.insert_tab(Some("chrome://extensions"), true);
        let resolved = binder.resolve_tab(None, None).await.unwrap();
        assert_ne!(resolved, active);
    }

    #[tokio::test]
    async fn test_cleanup_closes_or_retains_home_tab() {
        let (host, binder) = binder();
        let home = binder.resolve_tab(Some("s1"), None).await.unwrap();
        assert_eq!(binder.cleanup("s1", true).await, Some(home));
        assert!(host.get_tab(home).await.is_none());
        assert!(binder.binding("s1").await.is_none());

        let home = binder.resolve_tab(Some("s2"), None).await.unwrap();
        assert_eq!(binder.cleanup("s2", false).await, None);
        assert!(host.get_tab(home).await.is_some(), "tab retained");
    }
}
