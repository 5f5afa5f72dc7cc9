//! In-process tool server bridge.
//!
//! Consumer-defined tools are exposed to the agent CLI through nested
//! JSON-RPC 2.0 messages carried inside `mcp_message` control requests, so
//! no separate server process is ever spawned. The bridge answers
//! `initialize`, `tools/list`, `tools/call`, and the `initialized`
//! notification; everything else is method-not-found.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::AgentError;

/// MCP protocol revision advertised during the nested `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_INITIALIZE: &str = "initialize";
const METHOD_TOOLS_LIST: &str = "tools/list";
const METHOD_TOOLS_CALL: &str = "tools/call";
const METHOD_NOTIFY_INITIALIZED: &str = "notifications/initialized";

/// JSON-RPC "method not found"; also used for unknown tools and servers.
const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC "internal error"; used when a tool handler fails.
const CODE_INTERNAL_ERROR: i64 = -32603;

/// Async tool handler: receives the call arguments and returns a result map
/// of the form `{"content": [...], "is_error"?: bool}`.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, AgentError>> + Send + Sync>;

/// One tool served in-process.
#[derive(Clone)]
pub struct SdkMcpTool {
    pub name: String,
    pub description: String,
    /// Either a full JSON Schema (detected by `type` + `properties`) or a
    /// compact map of parameter names to primitive type tags
    /// (`"string"`, `"integer"`, `"number"`, `"boolean"`).
    pub input_schema: Value,
    pub annotations: Option<Value>,
    handler: ToolHandler,
}

impl SdkMcpTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            annotations: None,
            handler: Arc::new(move |arguments| Box::pin(handler(arguments))),
        }
    }

    pub fn annotations(mut self, annotations: Value) -> Self {
        self.annotations = Some(annotations);
        self
    }
}

impl std::fmt::Debug for SdkMcpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkMcpTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// A named set of in-process tools addressed by `mcp_message` requests.
#[derive(Clone)]
pub struct SdkMcpServer {
    pub name: String,
    pub version: String,
    tools: Vec<SdkMcpTool>,
}

impl SdkMcpServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            tools: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn tool(mut self, tool: SdkMcpTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = SdkMcpTool>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Answers one nested JSON-RPC message. Always produces a response,
    /// including for notifications (answered with id `0`).
    pub async fn handle_message(&self, message: &Value) -> Value {
        let id = jsonrpc_id(message);
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");

        match method {
            METHOD_INITIALIZE => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.name, "version": self.version },
                },
            }),
            METHOD_TOOLS_LIST => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|tool| {
                        let mut entry = json!({
                            "name": tool.name,
                            "description": tool.description,
                            "inputSchema": expand_input_schema(&tool.input_schema),
                        });
                        if let Some(annotations) = &tool.annotations {
                            entry["annotations"] = annotations.clone();
                        }
                        entry
                    })
                    .collect();
                json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}})
            }
            METHOD_TOOLS_CALL => self.call_tool(id, message).await,
            METHOD_NOTIFY_INITIALIZED => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            other => error_response(
                id,
                CODE_METHOD_NOT_FOUND,
                &format!("Method '{other}' not found"),
            ),
        }
    }

    async fn call_tool(&self, id: Value, message: &Value) -> Value {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let Some(tool) = self.tools.iter().find(|tool| tool.name == name) else {
            return error_response(
                id,
                CODE_METHOD_NOT_FOUND,
                &format!("Tool '{name}' not found"),
            );
        };

        match (tool.handler)(arguments).await {
            Ok(output) => {
                let content = output
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|items| translate_content(items))
                    .unwrap_or_default();
                let mut result = json!({"content": content});
                if output.get("is_error").and_then(Value::as_bool) == Some(true) {
                    result["is_error"] = json!(true);
                }
                json!({"jsonrpc": "2.0", "id": id, "result": result})
            }
            Err(err) => error_response(id, CODE_INTERNAL_ERROR, &err.to_string()),
        }
    }
}

impl std::fmt::Debug for SdkMcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkMcpServer")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tools", &format!("{} tools", self.tools.len()))
            .finish()
    }
}

/// Response produced when an `mcp_message` names an unregistered server.
pub(crate) fn server_not_found(message: &Value, server_name: &str) -> Value {
    error_response(
        jsonrpc_id(message),
        CODE_METHOD_NOT_FOUND,
        &format!("Server '{server_name}' not found"),
    )
}

/// Extracts the request id, falling back to `0` for notifications so that
/// consumers requiring a response always get one.
fn jsonrpc_id(message: &Value) -> Value {
    match message.get("id") {
        Some(id @ (Value::String(_) | Value::Number(_))) => id.clone(),
        _ => json!(0),
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Expands a compact parameter map into a JSON Schema with every property
/// required; full schemas pass through untouched.
fn expand_input_schema(schema: &Value) -> Value {
    let Some(map) = schema.as_object() else {
        return json!({"type": "object", "properties": {}});
    };
    if map.contains_key("type") && map.contains_key("properties") {
        return schema.clone();
    }

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (param, tag) in map {
        let property = match tag {
            Value::String(tag) => match tag.as_str() {
                "string" | "integer" | "number" | "boolean" => json!({"type": tag}),
                _ => json!({"type": "string"}),
            },
            Value::Object(_) => tag.clone(),
            _ => json!({"type": "string"}),
        };
        properties.insert(param.clone(), property);
        required.push(Value::String(param.clone()));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Translates handler content items into JSON-RPC result content.
///
/// Text passes through, image and audio become image items, embedded
/// document resources become document source descriptors, resource links
/// are dropped.
fn translate_content(items: &[Value]) -> Vec<Value> {
    let mut content = Vec::new();
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => content.push(json!({
                "type": "text",
                "text": item.get("text").and_then(Value::as_str).unwrap_or(""),
            })),
            Some("image") | Some("audio") => content.push(json!({
                "type": "image",
                "data": item.get("data").cloned().unwrap_or(json!("")),
                "mimeType": item.get("mimeType").cloned().unwrap_or(json!("")),
            })),
            Some("document") => {
                let source = item.get("source").cloned().unwrap_or(json!({}));
                content.push(json!({
                    "type": "document",
                    "source": {
                        "type": source.get("type").and_then(Value::as_str).unwrap_or("base64"),
                        "media_type": source
                            .get("media_type")
                            .and_then(Value::as_str)
                            .unwrap_or("application/pdf"),
                        "data": source.get("data").cloned().unwrap_or(json!("")),
                    },
                }));
            }
            Some("resource") => {
                if let Some(translated) = translate_embedded_resource(item) {
                    content.push(translated);
                }
            }
            // resource_link and anything unrecognized carry no renderable
            // payload for the agent; skip them.
            _ => {}
        }
    }
    content
}

/// Maps an embedded resource to a document descriptor when its URI or MIME
/// type marks it as one; other resources are dropped.
fn translate_embedded_resource(item: &Value) -> Option<Value> {
    let resource = item.get("resource")?;
    let uri = resource.get("uri").and_then(Value::as_str).unwrap_or("");
    let mime_type = resource
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or("");
    if !uri.starts_with("document://") && mime_type != "application/pdf" {
        return None;
    }

    let source_type = uri.strip_prefix("document://").unwrap_or("base64");
    let data = resource.get("blob").cloned().unwrap_or(json!(""));
    Some(json!({
        "type": "document",
        "source": {
            "type": source_type,
            "media_type": mime_type,
            "data": data,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_server() -> SdkMcpServer {
        SdkMcpServer::new("calc").tool(SdkMcpTool::new(
            "add",
            "Add two numbers",
            json!({"a": "number", "b": "number"}),
            |args| async move {
                let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
                Ok(json!({"content": [{"type": "text", "text": sum.to_string()}]}))
            },
        ))
    }

    #[tokio::test]
    async fn initialize_advertises_tools_only() {
        let response = calc_server()
            .handle_message(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await;
        assert_eq!(response["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(response["result"]["capabilities"], json!({"tools": {}}));
        assert_eq!(response["result"]["serverInfo"]["name"], "calc");
    }

    #[tokio::test]
    async fn tools_list_synthesizes_schema_from_compact_form() {
        let response = calc_server()
            .handle_message(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let schema = &response["result"]["tools"][0]["inputSchema"];
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["a"], json!({"type": "number"}));
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[tokio::test]
    async fn tools_list_passes_full_schemas_through() {
        let schema = json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": [],
        });
        let server = SdkMcpServer::new("s").tool(SdkMcpTool::new(
            "search",
            "Search",
            schema.clone(),
            |_| async move { Ok(json!({"content": []})) },
        ));
        let response = server
            .handle_message(&json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}))
            .await;
        assert_eq!(response["result"]["tools"][0]["inputSchema"], schema);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let response = calc_server()
            .handle_message(&json!({"jsonrpc": "2.0", "id": 4, "method": "resources/list"}))
            .await;
        assert_eq!(response["error"]["code"], -32601);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("resources/list"));
    }

    #[tokio::test]
    async fn notifications_are_answered_with_id_zero() {
        let response = calc_server()
            .handle_message(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert_eq!(response["id"], 0);
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn handler_errors_become_32603() {
        let server = SdkMcpServer::new("s").tool(SdkMcpTool::new(
            "boom",
            "Always fails",
            json!({}),
            |_| async move { Err(AgentError::Callback("kaboom".into())) },
        ));
        let response = server
            .handle_message(&json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "boom", "arguments": {}},
            }))
            .await;
        assert_eq!(response["error"]["code"], -32603);
        assert!(response["error"]["message"].as_str().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn content_translation_covers_the_media_kinds() {
        let items = vec![
            json!({"type": "text", "text": "hi"}),
            json!({"type": "audio", "data": "QUJD", "mimeType": "audio/wav"}),
            json!({"type": "resource_link", "uri": "file:///tmp/x"}),
            json!({"type": "resource", "resource": {
                "uri": "document://base64",
                "mimeType": "application/pdf",
                "blob": "UERG",
            }}),
            json!({"type": "resource", "resource": {
                "uri": "file:///plain.txt",
                "mimeType": "text/plain",
                "text": "skipped",
            }}),
        ];
        let translated = translate_content(&items);
        assert_eq!(translated.len(), 3);
        assert_eq!(translated[0], json!({"type": "text", "text": "hi"}));
        assert_eq!(
            translated[1],
            json!({"type": "image", "data": "QUJD", "mimeType": "audio/wav"})
        );
        assert_eq!(translated[2]["type"], "document");
        assert_eq!(translated[2]["source"]["data"], "UERG");
    }
}
