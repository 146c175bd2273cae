use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error strings carried in RESPONSE envelopes and MCP errors.
/// Helpers and the panel match on these verbatim, so they live in one place.
pub mod wire {
    pub const EXTENSION_NOT_CONNECTED: &str = "extension not connected";
    pub const EXTENSION_DISCONNECTED: &str = "extension disconnected";
    pub const DAEMON_NOT_CONNECTED: &str = "daemon not connected";
    pub const TIMEOUT: &str = "timeout";
    pub const SESSION_ENDED: &str = "session ended";
    pub const SHUTTING_DOWN: &str = "shutting down";
    pub const TAB_NOT_FOUND: &str = "tab not found";
    pub const UNKNOWN_SESSION: &str = "unknown session";
    pub const SESSION_LIMIT_EXCEEDED: &str = "session limit exceeded";
    pub const DUPLICATE_REQUEST_ID: &str = "duplicate request id";
    pub const UNKNOWN_ACTION: &str = "unknown action";
}
