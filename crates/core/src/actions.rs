//! The closed vocabulary of browser actions and their parameter contracts.
//!
//! The helper maps MCP tool names onto these tags without interpreting them;
//! the side panel validates parameters at the boundary before dispatching to
//! the action executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{wire, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Scroll,
    Screenshot,
    Evaluate,
    GetPageInfo,
    GetDomTree,
    GetTabs,
    SwitchTab,
    PressKey,
    WaitForSelector,
    WaitForLoadState,
    WaitForFunction,
    EnableNetwork,
    GetNetworkRequests,
    WaitForResponse,
    UploadFile,
    GetDialog,
    HandleDialog,
    Hover,
    DoubleClick,
    RightClick,
    Download,
    Lock,
    Unlock,
    UpdateStatus,
}

pub const ALL_ACTIONS: &[ActionKind] = &[
    ActionKind::Navigate,
    ActionKind::Click,
    ActionKind::Type,
    ActionKind::Scroll,
    ActionKind::Screenshot,
    ActionKind::Evaluate,
    ActionKind::GetPageInfo,
    ActionKind::GetDomTree,
    ActionKind::GetTabs,
    ActionKind::SwitchTab,
    ActionKind::PressKey,
    ActionKind::WaitForSelector,
    ActionKind::WaitForLoadState,
    ActionKind::WaitForFunction,
    ActionKind::EnableNetwork,
    ActionKind::GetNetworkRequests,
    ActionKind::WaitForResponse,
    ActionKind::UploadFile,
    ActionKind::GetDialog,
    ActionKind::HandleDialog,
    ActionKind::Hover,
    ActionKind::DoubleClick,
    ActionKind::RightClick,
    ActionKind::Download,
    ActionKind::Lock,
    ActionKind::Unlock,
    ActionKind::UpdateStatus,
];

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::Screenshot => "screenshot",
            Self::Evaluate => "evaluate",
            Self::GetPageInfo => "get_page_info",
            Self::GetDomTree => "get_dom_tree",
            Self::GetTabs => "get_tabs",
            Self::SwitchTab => "switch_tab",
            Self::PressKey => "press_key",
            Self::WaitForSelector => "wait_for_selector",
            Self::WaitForLoadState => "wait_for_load_state",
            Self::WaitForFunction => "wait_for_function",
            Self::EnableNetwork => "enable_network",
            Self::GetNetworkRequests => "get_network_requests",
            Self::WaitForResponse => "wait_for_response",
            Self::UploadFile => "upload_file",
            Self::GetDialog => "get_dialog",
            Self::HandleDialog => "handle_dialog",
            Self::Hover => "hover",
            Self::DoubleClick => "double_click",
            Self::RightClick => "right_click",
            Self::Download => "download",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::UpdateStatus => "update_status",
        }
    }

    /// Required (name, JSON type) pairs for this action. Optional parameters
    /// are not listed; the executor tolerates extras.
    pub fn required_params(&self) -> &'static [(&'static str, ParamType)] {
        use ParamType::*;
        match self {
            Self::Navigate | Self::Download => &[("url", Str)],
            Self::Click | Self::Hover | Self::DoubleClick | Self::RightClick => {
                &[("selector", Str)]
            }
            Self::Type => &[("selector", Str), ("text", Str)],
            Self::Evaluate | Self::WaitForFunction => &[("expression", Str)],
            Self::SwitchTab => &[("tabId", Int)],
            Self::PressKey => &[("key", Str)],
            Self::WaitForSelector => &[("selector", Str)],
            Self::WaitForResponse => &[("urlPattern", Str)],
            Self::UploadFile => &[("selector", Str), ("files", Arr)],
            Self::HandleDialog => &[("accept", Bool)],
            Self::UpdateStatus => &[("status", Str)],
            Self::Scroll
            | Self::Screenshot
            | Self::GetPageInfo
            | Self::GetDomTree
            | Self::GetTabs
            | Self::WaitForLoadState
            | Self::EnableNetwork
            | Self::GetNetworkRequests
            | Self::GetDialog
            | Self::Lock
            | Self::Unlock => &[],
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_ACTIONS
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::Action(format!("{}: {s}", wire::UNKNOWN_ACTION)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
    Bool,
    Arr,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Arr => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "integer",
            Self::Bool => "boolean",
            Self::Arr => "array",
        }
    }
}

/// Check `params` against the action's declared contract.
pub fn validate_params(action: ActionKind, params: &Value) -> Result<()> {
    let required = action.required_params();
    if required.is_empty() {
        return Ok(());
    }
    let obj = params.as_object().ok_or_else(|| {
        Error::Action(format!("action '{action}' requires an object of parameters"))
    })?;
    for (name, ty) in required {
        match obj.get(*name) {
            Some(value) if ty.matches(value) => {}
            Some(_) => {
                return Err(Error::Action(format!(
                    "action '{action}': parameter '{name}' must be a {}",
                    ty.name()
                )));
            }
            None => {
                return Err(Error::Action(format!(
                    "action '{action}': missing required parameter '{name}'"
                )));
            }
        }
    }
    Ok(())
}
