use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QrcError, Result};
use crate::types::Property;

/// Number of distinct request ids before the counter wraps
pub(crate) const REQUEST_ID_SPAN: u16 = 10_000;

/// QRC request envelope (JSON-RPC 2.0)
///
/// Requests carry an `id`; notifications omit it and never receive a
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,
}

impl Request {
    /// Create a notification (no id, no response expected)
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Attach a correlation id, turning the notification into a request
    pub fn with_id(mut self, id: u16) -> Self {
        self.id = Some(id);
        self
    }
}

/// QRC response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// Error object carried by a failed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Response {
    /// Resolve the response into its result, surfacing a core error verbatim
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(QrcError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Engine status snapshot pushed by the core
///
/// Replaced wholesale on every notification. The design code is the
/// authoritative signal that the active design changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineStatus {
    pub state: String,
    #[serde(default)]
    pub platform: String,
    pub design_name: String,
    pub design_code: String,
    #[serde(default)]
    pub is_redundant: bool,
    #[serde(default)]
    pub is_emulator: bool,
    #[serde(default)]
    pub status: Option<StatusDetail>,
}

/// Status code/string pair inside an [`EngineStatus`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusDetail {
    pub code: i64,
    pub string: String,
}

/// One component as listed by `Component.GetComponents`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComponentInfo {
    pub name: String,
    #[serde(default, rename = "Type")]
    pub component_type: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

/// One control as listed by `Component.GetControls`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlInfo {
    pub name: String,
    #[serde(default, rename = "Type")]
    pub control_type: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub string: String,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub value_min: f64,
    #[serde(default)]
    pub value_max: f64,
    #[serde(default)]
    pub string_min: String,
    #[serde(default)]
    pub string_max: String,
}

/// Result shape of `Component.GetControls`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetControlsResult {
    pub name: String,
    #[serde(default)]
    pub controls: Vec<ControlInfo>,
}

/// Result shape of `ChangeGroup.Poll`, also pushed as a notification when
/// auto-poll is enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PollResult {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ChangeDelta>,
}

/// One changed control inside a poll result
///
/// Only the fields actually present in the delta may be applied to the
/// cached control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeDelta {
    #[serde(default)]
    pub component: Option<String>,
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub string: Option<String>,
    #[serde(default)]
    pub position: Option<f64>,
}

/// A classified inbound frame
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Response to a correlated request
    Response(Response),
    /// Unsolicited engine status notification
    EngineStatus(EngineStatus),
    /// Pushed change-group poll (auto-poll deltas)
    GroupPoll(PollResult),
    /// Anything else; logged and dropped
    Unknown(String),
}

/// Classify a raw text frame from the core
pub(crate) fn classify(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)?;

    // Responses carry an id alongside result or error. The core answers an
    // unparseable request with id:null, which falls through to Unknown.
    if value.get("id").is_some_and(Value::is_u64)
        && (value.get("result").is_some() || value.get("error").is_some())
    {
        return Ok(Inbound::Response(serde_json::from_value(value)?));
    }

    match value.get("method").and_then(Value::as_str) {
        Some("EngineStatus") => {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            Ok(Inbound::EngineStatus(serde_json::from_value(params)?))
        }
        Some("ChangeGroup.Poll") => {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            Ok(Inbound::GroupPoll(serde_json::from_value(params)?))
        }
        Some(method) => Ok(Inbound::Unknown(method.to_string())),
        None => Ok(Inbound::Unknown("<no method>".to_string())),
    }
}

/// Turn a caller-supplied core address into a QRC WebSocket URL
///
/// A complete `ws://`/`wss://` URL is used verbatim; a bare host or IP
/// (optionally with a port) becomes `wss://<host>/qrc`. Anything else is
/// rejected.
pub fn core_url(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(QrcError::InvalidAddress("empty address".to_string()));
    }
    if address.starts_with("ws://") || address.starts_with("wss://") {
        return Ok(address.to_string());
    }
    if address.contains("://") || address.starts_with('/') {
        return Err(QrcError::InvalidAddress(address.to_string()));
    }
    Ok(format!("wss://{}/qrc", address))
}
