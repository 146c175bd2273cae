//! The fixed MCP tool surface.
//!
//! Every catalog action is exposed as one `browser_*` tool; the mapping is
//! total in both directions and the helper never interprets action
//! semantics. `browser_get_connection_status` is the single local tool.

use serde_json::{json, Value};

use tabrelay_core::actions::ParamType;
use tabrelay_core::{ActionKind, ALL_ACTIONS};

pub const TOOL_PREFIX: &str = "browser_";
pub const STATUS_TOOL: &str = "browser_get_connection_status";

pub fn tool_name(action: ActionKind) -> String {
    format!("{TOOL_PREFIX}{}", action.as_str())
}

pub fn action_for_tool(name: &str) -> Option<ActionKind> {
    name.strip_prefix(TOOL_PREFIX)?.parse().ok()
}

/// The `tools/list` payload: every forwarded tool plus the status tool.
pub fn tool_descriptors() -> Vec<Value> {
    let mut tools: Vec<Value> = ALL_ACTIONS
        .iter()
        .map(|action| {
            json!({
                "name": tool_name(*action),
                "description": describe(*action),
                "inputSchema": input_schema(*action),
            })
        })
        .collect();
    tools.push(json!({
        "name": STATUS_TOOL,
        "description": "Report whether a browser extension is reachable, the routing mode, and this helper's session id",
        "inputSchema": {"type": "object", "properties": {}},
    }));
    tools
}

fn describe(action: ActionKind) -> &'static str {
    match action {
        ActionKind::Navigate => "Navigate the session's tab to a URL",
        ActionKind::Click => "Click the element matching a CSS selector",
        ActionKind::Type => "Type text into the element matching a CSS selector",
        ActionKind::Scroll => "Scroll the page",
        ActionKind::Screenshot => "Capture a screenshot of the tab",
        ActionKind::Evaluate => "Evaluate a JavaScript expression in the page",
        ActionKind::GetPageInfo => "Get the tab's URL, title, and load state",
        ActionKind::GetDomTree => "Get a simplified DOM tree of the page",
        ActionKind::GetTabs => "List open browser tabs",
        ActionKind::SwitchTab => "Bring a tab to the front",
        ActionKind::PressKey => "Press a key or key combination",
        ActionKind::WaitForSelector => "Wait until a CSS selector matches",
        ActionKind::WaitForLoadState => "Wait for the page to reach a load state",
        ActionKind::WaitForFunction => "Wait until a JavaScript expression is truthy",
        ActionKind::EnableNetwork => "Start capturing network requests in the tab",
        ActionKind::GetNetworkRequests => "List captured network requests",
        ActionKind::WaitForResponse => "Wait for a network response matching a URL pattern",
        ActionKind::UploadFile => "Set files on a file input element",
        ActionKind::GetDialog => "Get the currently open JavaScript dialog, if any",
        ActionKind::HandleDialog => "Accept or dismiss the open JavaScript dialog",
        ActionKind::Hover => "Hover over the element matching a CSS selector",
        ActionKind::DoubleClick => "Double-click the element matching a CSS selector",
        ActionKind::RightClick => "Right-click the element matching a CSS selector",
        ActionKind::Download => "Download a URL through the browser",
        ActionKind::Lock => "Lock the tab against manual interaction",
        ActionKind::Unlock => "Release the tab lock",
        ActionKind::UpdateStatus => "Show a status message in the side panel",
    }
}

fn input_schema(action: ActionKind) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, ty) in action.required_params() {
        properties.insert(name.to_string(), param_schema(*ty));
        required.push(json!(name));
    }
    properties.insert(
        "tabId".to_string(),
        json!({
            "type": "integer",
            "description": "Target tab id; overrides the session's bound tab",
        }),
    );
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn param_schema(ty: ParamType) -> Value {
    match ty {
        ParamType::Str => json!({"type": "string"}),
        ParamType::Int => json!({"type": "integer"}),
        ParamType::Bool => json!({"type": "boolean"}),
        ParamType::Arr => json!({"type": "array", "items": {"type": "string"}}),
    }
}
