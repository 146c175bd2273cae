//! Wire messages shared by all three hops.
//!
//! Helper ↔ daemon frames travel as newline-delimited JSON over the IPC
//! socket; daemon ↔ extension frames travel one JSON object per WebSocket
//! text frame. Both use the same `kind`-tagged shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Frame {
    #[serde(rename = "REGISTER")]
    Register,

    #[serde(rename = "REGISTER_OK", rename_all = "camelCase")]
    RegisterOk { session_id: String },

    #[serde(rename = "REGISTER_ERROR")]
    RegisterError { error: String },

    #[serde(rename = "REQUEST")]
    Request(RequestFrame),

    #[serde(rename = "RESPONSE")]
    Response(ResponseFrame),

    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "PONG")]
    Pong,

    #[serde(rename = "STATUS")]
    Status,

    #[serde(rename = "STATUS_OK", rename_all = "camelCase")]
    StatusOk {
        extension_connected: bool,
        active_sessions: usize,
    },

    #[serde(rename = "DISCONNECT", rename_all = "camelCase")]
    Disconnect { session_id: String },

    /// Daemon → extension only: a session came into existence.
    #[serde(rename = "SESSION_START", rename_all = "camelCase")]
    SessionStart { session_id: String },

    /// Daemon → extension only: a session is gone; bindings may be torn down.
    #[serde(rename = "SESSION_END", rename_all = "camelCase")]
    SessionEnd { session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub req_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Explicit target tab; overrides the session binding when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub req_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(req_id: impl Into<String>, session_id: Option<String>, data: Value) -> Self {
        Self {
            req_id: req_id.into(),
            session_id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(
        req_id: impl Into<String>,
        session_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            req_id: req_id.into(),
            session_id,
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the waiter's view: data on success, error string on
    /// failure.
    pub fn into_outcome(self) -> std::result::Result<Value, String> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}
