//! Wire shapes for the stdio control protocol.
//!
//! Frames are one JSON value per line. A top-level `type` discriminator
//! separates control traffic from conversation messages; conversation
//! messages are never interpreted beyond that discriminator and flow to the
//! consumer as raw [`Value`]s.

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Frame type for control requests (both directions).
pub const FRAME_CONTROL_REQUEST: &str = "control_request";
/// Frame type for control responses (both directions).
pub const FRAME_CONTROL_RESPONSE: &str = "control_response";
/// Frame type for the advisory cancel signal.
pub const FRAME_CONTROL_CANCEL: &str = "control_cancel_request";
/// Conversation frame type that marks the end of a turn.
pub const FRAME_RESULT: &str = "result";

/// Inbound control request bodies, discriminated by `subtype`.
///
/// Decoding fails on unknown subtypes; the dispatcher turns that failure
/// into an error control response rather than dropping the request.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype")]
pub enum InboundControlRequest {
    #[serde(rename = "can_use_tool")]
    CanUseTool {
        tool_name: String,
        input: Value,
        tool_use_id: String,
        #[serde(default)]
        permission_suggestions: Option<Vec<Value>>,
        #[serde(default)]
        blocked_path: Option<String>,
    },
    #[serde(rename = "hook_callback")]
    HookCallback {
        callback_id: String,
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(rename = "mcp_message")]
    McpMessage { server_name: String, message: Value },
    #[serde(rename = "interrupt")]
    Interrupt,
    // Outbound-only subtypes occasionally echoed back by the CLI. They are
    // acknowledged with an empty success body.
    #[serde(rename = "initialize")]
    Initialize,
    #[serde(rename = "set_permission_mode")]
    SetPermissionMode,
    #[serde(rename = "rewind_files")]
    RewindFiles,
    #[serde(rename = "stop_task")]
    StopTask,
}

/// Inner payload of a `control_response` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponsePayload {
    pub request_id: String,
    pub subtype: String,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One inbound frame, routed by its `type` discriminator.
#[derive(Debug)]
pub(crate) enum InboundFrame {
    ControlResponse(ControlResponsePayload),
    ControlRequest { request_id: String, request: Value },
    ControlCancel(Value),
    Message(Value),
}

/// Routes a decoded frame. Control frames with a malformed envelope fall
/// through to the conversation channel so nothing is silently discarded.
pub(crate) fn route_frame(value: Value) -> InboundFrame {
    match value.get("type").and_then(Value::as_str) {
        Some(FRAME_CONTROL_RESPONSE) => {
            let payload = value
                .get("response")
                .cloned()
                .and_then(|inner| serde_json::from_value::<ControlResponsePayload>(inner).ok());
            match payload {
                Some(payload) => InboundFrame::ControlResponse(payload),
                None => InboundFrame::Message(value),
            }
        }
        Some(FRAME_CONTROL_REQUEST) => {
            let request_id = value.get("request_id").and_then(Value::as_str);
            let request = value.get("request");
            match (request_id, request) {
                (Some(request_id), Some(request)) => InboundFrame::ControlRequest {
                    request_id: request_id.to_string(),
                    request: request.clone(),
                },
                _ => InboundFrame::Message(value),
            }
        }
        Some(FRAME_CONTROL_CANCEL) => InboundFrame::ControlCancel(value),
        _ => InboundFrame::Message(value),
    }
}

/// Builds an outbound `control_request` frame.
pub(crate) fn control_request_frame(request_id: &str, request: Value) -> Value {
    json!({
        "type": FRAME_CONTROL_REQUEST,
        "request_id": request_id,
        "request": request,
    })
}

/// Builds a success `control_response` frame for an inbound request.
pub(crate) fn success_response_frame(request_id: &str, response: Value) -> Value {
    json!({
        "type": FRAME_CONTROL_RESPONSE,
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
}

/// Builds an error `control_response` frame for an inbound request.
pub(crate) fn error_response_frame(request_id: &str, message: &str) -> Value {
    json!({
        "type": FRAME_CONTROL_RESPONSE,
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        },
    })
}

/// Builds a user conversation frame.
pub fn user_message_frame(
    content: &str,
    session_id: &str,
    parent_tool_use_id: Option<&str>,
) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
        "session_id": session_id,
        "parent_tool_use_id": parent_tool_use_id,
    })
}

/// Generates an outbound control request id: a monotonic sequence number
/// plus a random suffix. Ids only need to be unique within this engine.
pub(crate) fn request_id(seq: u64) -> String {
    format!("req_{}_{:08x}", seq, rand::random::<u32>())
}

/// Capabilities reported by the `initialize` round trip.
///
/// The shape is deliberately permissive: every field defaults, and anything
/// the CLI adds beyond the known keys lands in `extra`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub commands: Vec<Value>,
    #[serde(default, alias = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "outputStyles")]
    pub output_styles: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
