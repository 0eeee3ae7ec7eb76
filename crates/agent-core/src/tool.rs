//! Tool Model
//!
//! Types shared by the registry, the dispatcher and the reasoning loop.
//! Tools live on remote servers; the agent only sees their descriptors and
//! the opaque results they return.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::ServerId;

/// A tool as advertised by its owning server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Name as known by the owning server
    pub name: String,

    /// Server that owns the tool
    pub server_id: ServerId,

    /// Human-readable description (shown to the LLM)
    #[serde(default)]
    pub description: String,

    /// JSON Schema of the accepted arguments
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn new(server_id: ServerId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_id,
            description: String::new(),
            input_schema: empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Function definition handed to the model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Name the model must use when calling
    pub name: String,

    pub description: String,

    /// JSON Schema for the arguments
    pub parameters: Value,
}

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool identifier (registry key)
    #[serde(alias = "tool")]
    pub name: String,

    /// Arguments, forwarded verbatim to the owning server
    #[serde(default)]
    pub arguments: Value,

    /// Optional call ID for tracking
    #[serde(default)]
    pub id: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The call ID, generating one if the model didn't supply it
    pub fn ensure_id(&mut self) -> &str {
        self.id
            .get_or_insert_with(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Result returned by a tool server
///
/// The payload shape is owned by the server; the agent never looks past
/// `content` and `is_error`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Raw content payload
    #[serde(default)]
    pub content: Value,

    /// Whether the server flagged this result as an error
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub const fn new(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// A single text item, the most common shape servers return
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(serde_json::json!([{ "type": "text", "text": text.into() }]))
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// Render the payload for the transcript
    ///
    /// Content made only of text items is joined as plain text; anything else
    /// is serialized as JSON.
    pub fn render(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(items) => {
                let texts: Option<Vec<&str>> = items
                    .iter()
                    .map(|item| {
                        (item.get("type").and_then(Value::as_str) == Some("text"))
                            .then(|| item.get("text").and_then(Value::as_str))
                            .flatten()
                    })
                    .collect();
                match texts {
                    Some(texts) if !texts.is_empty() => texts.join("\n"),
                    _ => self.content.to_string(),
                }
            }
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Why a tool call did not produce a result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    /// The owning server is not connected
    SessionUnavailable,
    /// The tool ran (or was attempted) and failed
    ExecutionFailed,
    /// No tool with that name is registered
    ToolNotFound,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionUnavailable => write!(f, "SessionUnavailable"),
            Self::ExecutionFailed => write!(f, "ExecutionFailed"),
            Self::ToolNotFound => write!(f, "ToolNotFound"),
        }
    }
}

/// A contained tool failure, always returned to the model as content
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} ({tool}): {detail}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub tool: String,
    pub detail: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        let detail = format!("no tool named '{tool}' is registered");
        Self::new(ToolErrorKind::ToolNotFound, tool, detail)
    }

    pub fn unavailable(tool: impl Into<String>, server: &ServerId) -> Self {
        Self::new(
            ToolErrorKind::SessionUnavailable,
            tool,
            format!("server '{server}' is not connected"),
        )
    }

    pub fn failed(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ExecutionFailed, tool, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_accepts_tool_alias() {
        let call: ToolCall =
            serde_json::from_str(r#"{"tool": "list_tables", "arguments": {"db": "main"}}"#)
                .unwrap();
        assert_eq!(call.name, "list_tables");
        assert_eq!(call.arguments["db"], "main");
        assert!(call.id.is_none());
    }

    #[test]
    fn test_ensure_id_is_stable() {
        let mut call = ToolCall::new("x", Value::Null);
        let first = call.ensure_id().to_string();
        assert_eq!(call.ensure_id(), first);
        assert!(first.starts_with("call_"));
    }

    #[test]
    fn test_result_from_mcp_payload() {
        let result: ToolResult = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "users"}, {"type": "text", "text": "orders"}],
            "isError": false
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.render(), "users\norders");
    }

    #[test]
    fn test_render_non_text_content_as_json() {
        let result = ToolResult::new(serde_json::json!([{"type": "image", "data": "AAAA"}]));
        assert!(result.render().contains("\"image\""));
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::not_found("drop_db");
        assert_eq!(err.kind, ToolErrorKind::ToolNotFound);
        assert!(err.to_string().starts_with("ToolNotFound (drop_db)"));
    }
}
