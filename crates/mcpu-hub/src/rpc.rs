//! JSON-RPC 2.0 wire shapes shared by the child-client and the MCP facade.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision this proxy speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request (or notification when `id` is absent).
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One tool record from `tools/list`, kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(
        rename = "outputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl ToolSchema {
    /// First line of the description, for compact listings.
    pub fn brief(&self) -> &str {
        self.description
            .lines()
            .next()
            .unwrap_or_default()
            .trim_end()
    }
}

/// Parsed `tools/call` result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolOutcome {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "structuredContent", default)]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolOutcome {
    /// Serialize the tool's payload for callers.
    ///
    /// Prefers `structuredContent`; a lone text block is passed through as-is
    /// (it usually already is JSON); anything else is the raw content array.
    pub fn render_payload(&self) -> String {
        if let Some(structured) = &self.structured_content {
            return structured.to_string();
        }
        if self.content.len() == 1 {
            if let Some(text) = self.content[0].get("text").and_then(Value::as_str) {
                return text.to_string();
            }
        }
        serde_json::to_string(&self.content).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let request = JsonRpcRequest::new(7, "tools/list", Some(json!({})));
        let raw = serde_json::to_string(&request).unwrap();
        let parsed: JsonRpcRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.method, "tools/list");
        assert_eq!(parsed.id, Some(json!(7)));
        assert!(!parsed.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(note.is_notification());
        let raw = serde_json::to_string(&note).unwrap();
        assert!(!raw.contains("\"id\""));
    }

    #[test]
    fn test_tool_schema_wire_names() {
        let schema: ToolSchema = serde_json::from_value(json!({
            "name": "echo",
            "description": "Echo a value.\nSecond line.",
            "inputSchema": {"type": "object"},
            "outputSchema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(schema.brief(), "Echo a value.");
        let raw = serde_json::to_value(&schema).unwrap();
        assert!(raw.get("inputSchema").is_some());
        assert!(raw.get("outputSchema").is_some());
        assert!(raw.get("annotations").is_none());
    }

    #[test]
    fn test_render_payload_prefers_structured_content() {
        let outcome: CallToolOutcome = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"y": 2}
        }))
        .unwrap();
        assert_eq!(outcome.render_payload(), "{\"y\":2}");
    }

    #[test]
    fn test_render_payload_single_text_block() {
        let outcome: CallToolOutcome = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "{\"y\":2}"}]
        }))
        .unwrap();
        assert_eq!(outcome.render_payload(), "{\"y\":2}");
    }

    #[test]
    fn test_render_payload_multi_block_is_content_array() {
        let outcome: CallToolOutcome = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"}
            ]
        }))
        .unwrap();
        assert!(outcome.render_payload().starts_with('['));
    }
}
