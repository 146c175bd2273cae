use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::paths::Paths;

pub const ENV_DAEMON_SOCKET: &str = "BROWSER_AGENT_DAEMON_SOCKET";
pub const ENV_WS_HOST: &str = "BROWSER_AGENT_WS_HOST";
pub const ENV_WS_PORT: &str = "BROWSER_AGENT_WS_PORT";
pub const ENV_LOG_FILE: &str = "BROWSER_AGENT_LOG_FILE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// IPC socket the daemon listens on and helpers connect to.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    #[serde(default = "default_ws_host")]
    pub ws_host: String,

    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Deadline for one forwarded tool call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long the daemon lingers at zero sessions before exiting.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Cap on one wire frame and on a connection's receive buffer.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// How long a helper waits for a freshly spawned daemon's socket.
    #[serde(default = "default_spawn_wait_ms")]
    pub spawn_wait_ms: u64,

    #[serde(default)]
    pub panel: PanelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_close_tab_on_session_end")]
    pub close_tab_on_session_end: bool,
}

fn default_ws_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ws_port() -> u16 {
    3026
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_sessions() -> usize {
    100
}

fn default_max_frame_bytes() -> usize {
    crate::codec::MAX_FRAME_BYTES
}

fn default_spawn_wait_ms() -> u64 {
    5_000
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_close_tab_on_session_end() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            ws_host: default_ws_host(),
            ws_port: default_ws_port(),
            request_timeout_ms: default_request_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_sessions: default_max_sessions(),
            max_frame_bytes: default_max_frame_bytes(),
            spawn_wait_ms: default_spawn_wait_ms(),
            panel: PanelConfig::default(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            close_tab_on_session_end: default_close_tab_on_session_end(),
        }
    }
}

impl Config {
    /// Load the optional config file, then apply environment overrides.
    pub fn load(paths: &Paths) -> Result<Self> {
        let mut config = match std::fs::read_to_string(paths.config_file()) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(ENV_DAEMON_SOCKET) {
            if !path.is_empty() {
                self.socket_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(host) = std::env::var(ENV_WS_HOST) {
            if !host.is_empty() {
                self.ws_host = host;
            }
        }
        if let Ok(port) = std::env::var(ENV_WS_PORT) {
            if let Ok(port) = port.parse() {
                self.ws_port = port;
            }
        }
    }

    /// Effective IPC socket path: explicit config wins, else the runtime dir.
    pub fn socket_path(&self, paths: &Paths) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| paths.socket_file())
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.ws_host, self.ws_port)
    }
}
