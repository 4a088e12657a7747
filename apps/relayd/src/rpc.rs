//! Minimal JSON-RPC shim over the tool surface.
//!
//! Both transports speak the same request shape: `initialize`,
//! `tools/list`, and `tools/call`. Tool failures never become RPC errors;
//! they ride inside the call result as an error envelope with `isError`
//! set, so a misbehaving argument cannot tear down the session.

use relay_tools::{RequestMeta, ToolSurface};
use serde::Deserialize;
use serde_json::{Map, Value, json};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Handle one request. Notifications (no id) produce no response.
pub async fn handle_request(
    surface: &ToolSurface,
    request: RpcRequest,
    meta: RequestMeta,
) -> Option<Value> {
    if request.method.starts_with("notifications/") {
        return None;
    }
    let id = request.id.clone().unwrap_or(Value::Null);

    let result = match request.method.as_str() {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "relay-mesh",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
        "ping" => json!({}),
        "tools/list" => tools_list(),
        "tools/call" => return Some(tools_call(surface, id, &request.params, meta).await),
        other => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {other}") },
            }));
        }
    };

    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

/// Response for a request body that did not parse as JSON-RPC.
pub fn parse_error(error: serde_json::Error) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": { "code": -32700, "message": format!("parse error: {error}") },
    })
}

fn tools_list() -> Value {
    let tools: Vec<Value> = ToolSurface::definitions()
        .map(|def| {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for arg in def.args {
                properties.insert(
                    arg.name.to_owned(),
                    json!({ "type": "string", "description": arg.description }),
                );
                if arg.required {
                    required.push(arg.name);
                }
            }
            json!({
                "name": def.name,
                "description": def.description,
                "inputSchema": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            })
        })
        .collect();
    json!({ "tools": tools })
}

async fn tools_call(surface: &ToolSurface, id: Value, params: &Value, meta: RequestMeta) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let outcome = surface.call(name, arguments, meta).await;
    let (text, is_error) = match outcome.get("error").and_then(Value::as_str) {
        Some(message) => (message.to_owned(), true),
        None => (outcome.to_string(), false),
    };

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        },
    })
}
