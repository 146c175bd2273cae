//! MCP tool server over stdio.
//!
//! JSON-RPC 2.0, one message per line. Tool calls translate through the fixed
//! tool table and ride the bridge; nothing here interprets browser semantics.

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use tabrelay_core::Result;

use crate::bridge::Bridge;
use crate::tools::{action_for_tool, tool_descriptors, STATUS_TOOL};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    /// Absent for notifications. Echoed verbatim (number or string).
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

pub struct McpServer {
    bridge: Bridge,
}

impl McpServer {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Serve MCP until the agent host closes stdin.
    pub async fn run(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request = match serde_json::from_str::<JsonRpcRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "malformed JSON-RPC line");
                    continue;
                }
            };
            if let Some(response) = self.dispatch(request).await {
                let mut bytes = serde_json::to_vec(&response)?;
                bytes.push(b'\n');
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
        }
        info!("agent host closed stdin");
        Ok(())
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Option<Value> {
        let Some(id) = request.id else {
            // Notification: nothing to answer.
            debug!(method = %request.method, "notification");
            return None;
        };

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "tabrelay",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": tool_descriptors()})),
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                Ok(self.handle_call(params).await)
            }
            other => Err(json!({
                "code": -32601,
                "message": format!("method not found: {other}"),
            })),
        };

        Some(match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        })
    }

    /// Execute one tool call and shape the MCP result.
    async fn handle_call(&self, params: Value) -> Value {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut args = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        debug!(tool = %name, "tool call");

        if name == STATUS_TOOL {
            return match self.bridge.status().await {
                Ok(report) => text_result(json!({
                    "connected": report.connected,
                    "mode": report.mode,
                    "sessionId": report.session_id,
                })),
                Err(e) => error_result(e.to_string()),
            };
        }

        let Some(action) = action_for_tool(&name) else {
            return error_result(format!("unknown tool: {name}"));
        };

        let tab_id = args.get("tabId").and_then(|v| v.as_i64());
        if let Some(obj) = args.as_object_mut() {
            obj.remove("tabId");
        }

        match self.bridge.request(action, args, tab_id).await {
            Ok(data) => match image_payload(&data) {
                Some((blob, mime)) => json!({
                    "content": [{"type": "image", "data": blob, "mimeType": mime}],
                }),
                None => text_result(data),
            },
            Err(error) => error_result(error),
        }
    }
}

fn text_result(data: Value) -> Value {
    let text = match &data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    json!({"content": [{"type": "text", "text": text}]})
}

fn error_result(message: String) -> Value {
    json!({
        "content": [{"type": "text", "text": message}],
        "isError": true,
    })
}

/// Recognize a screenshot-like result: an object carrying a base64 image
/// blob. Anything that does not decode stays a text result.
fn image_payload(data: &Value) -> Option<(String, String)> {
    let obj = data.as_object()?;
    let (blob, mime) = if let Some(blob) = obj.get("screenshot").and_then(|v| v.as_str()) {
        let mime = obj
            .get("mimeType")
            .and_then(|v| v.as_str())
            .unwrap_or("image/png");
        (blob, mime)
    } else {
        let blob = obj.get("data").and_then(|v| v.as_str())?;
        let mime = obj.get("mimeType").and_then(|v| v.as_str())?;
        if !mime.starts_with("image/") {
            return None;
        }
        (blob, mime)
    };
    base64::engine::general_purpose::STANDARD
        .decode(blob)
        .ok()?;
    Some((blob.to_string(), mime.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_payload_detection() {
        // 1x1 PNG, valid base64.
        let png = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

        let shot = json!({"screenshot": png});
        let (blob, mime) = image_payload(&shot).unwrap();
        assert_eq!(blob, png);
        assert_eq!(mime, "image/png");

        let tagged = json!({"data": png, "mimeType": "image/jpeg"});
        assert_eq!(image_payload(&tagged).unwrap().1, "image/jpeg");

        // Wrong mime family, invalid base64, or plain data: not images.
        assert!(image_payload(&json!({"data": png, "mimeType": "text/plain"})).is_none());
        assert!(image_payload(&json!({"screenshot": "@@not-base64@@"})).is_none());
        assert!(image_payload(&json!({"title": "page"})).is_none());
        assert!(image_payload(&json!("just text")).is_none());
    }

    #[test]
    fn test_text_result_stringifies_json() {
        let result = text_result(json!({"a": 1}));
        assert_eq!(result["content"][0]["type"], "text");
        assert!(result["content"][0]["text"].as_str().unwrap().contains("\"a\""));
        assert!(result.get("isError").is_none());

        let result = text_result(json!("plain"));
        assert_eq!(result["content"][0]["text"], "plain");
    }

    #[test]
    fn test_error_result_is_flagged() {
        let result = error_result("tab not found".to_string());
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "tab not found");
    }

    #[test]
    fn test_jsonrpc_request_accepts_string_and_number_ids() {
        let n: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert_eq!(n.id, Some(json!(7)));

        let s: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","method":"ping","params":{}}"#)
                .unwrap();
        assert_eq!(s.id, Some(json!("abc")));

        let notification: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .unwrap();
        assert!(notification.id.is_none());
    }
}
