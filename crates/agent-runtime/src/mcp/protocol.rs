//! JSON-RPC 2.0 framing shared by the MCP transports

use std::collections::HashSet;

use agent_core::{AgentError, Result, ServerId, ToolDescriptor, ToolResult};
use serde_json::{Value, json};

/// Protocol revision sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Code used when a request outlives its deadline
pub const REQUEST_TIMEOUT: i64 = -32001;

/// Most `tools/list` pages read from one server
pub const MAX_TOOL_PAGES: usize = 100;

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Arguments for `tools/call`; a null payload becomes an empty object
pub fn call_params(name: &str, arguments: Value) -> Value {
    let arguments = match arguments {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    json!({ "name": name, "arguments": arguments })
}

/// What an inbound line from a server turned out to be
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests
    Response { id: u64, outcome: std::result::Result<Value, (i64, String)> },
    /// A request the server expects us to answer
    Request { id: Value, method: String },
    Notification { method: String },
    /// Anything unroutable (unknown id shape, stray payload)
    Ignored,
}

pub fn classify(message: &Value) -> Inbound {
    let method = message.get("method").and_then(Value::as_str);
    match (message.get("id"), method) {
        (Some(id), Some(method)) => Inbound::Request {
            id: id.clone(),
            method: method.to_string(),
        },
        (None, Some(method)) => Inbound::Notification {
            method: method.to_string(),
        },
        (Some(id), None) => {
            let Some(id) = response_id(id) else {
                return Inbound::Ignored;
            };
            let outcome = match message.get("error") {
                Some(error) => Err((
                    error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                )),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            Inbound::Response { id, outcome }
        }
        (None, None) => Inbound::Ignored,
    }
}

/// Servers occasionally echo numeric ids back as strings
fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn rpc_error(server: &ServerId, (code, message): (i64, String)) -> AgentError {
    AgentError::Rpc {
        server: server.to_string(),
        code,
        message,
    }
}

/// Parse a `tools/list` result into descriptors, returning the next cursor
pub fn parse_tools(server: &ServerId, result: &Value) -> Result<(Vec<ToolDescriptor>, Option<String>)> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        return Err(AgentError::Parse(format!(
            "server '{server}' returned a tools/list result without a tools array"
        )));
    };
    let tools = items
        .iter()
        .filter_map(|item| {
            let Some(name) = item.get("name").and_then(Value::as_str) else {
                tracing::warn!(server = %server, "Skipping tool without a name");
                return None;
            };
            let mut tool = ToolDescriptor::new(server.clone(), name);
            if let Some(description) = item.get("description").and_then(Value::as_str) {
                tool = tool.with_description(description);
            }
            if let Some(schema) = item.get("inputSchema") {
                tool = tool.with_schema(schema.clone());
            }
            Some(tool)
        })
        .collect();
    let cursor = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(String::from);
    Ok((tools, cursor))
}

/// Stops `tools/list` paging on a repeated cursor or after [`MAX_TOOL_PAGES`]
#[derive(Debug, Default)]
pub struct Pager {
    seen: HashSet<String>,
    pages: usize,
}

impl Pager {
    /// Record one page; `Ok(Some(cursor))` means fetch the next one
    pub fn advance(&mut self, server: &ServerId, next: Option<String>) -> Result<Option<String>> {
        self.pages += 1;
        let Some(cursor) = next else {
            return Ok(None);
        };
        if !self.seen.insert(cursor.clone()) {
            return Err(AgentError::transport(
                server.as_str(),
                format!("tools/list repeated cursor '{cursor}'"),
            ));
        }
        if self.pages >= MAX_TOOL_PAGES {
            return Err(AgentError::transport(
                server.as_str(),
                format!("tools/list still paging after {MAX_TOOL_PAGES} pages"),
            ));
        }
        Ok(Some(cursor))
    }
}

/// A `tools/call` result keeps the server's payload untouched
pub fn parse_call_result(result: Value) -> ToolResult {
    match result {
        Value::Object(mut map) => {
            let is_error = map.remove("isError").and_then(|v| v.as_bool()).unwrap_or(false);
            let content = map.remove("content").unwrap_or(Value::Object(map));
            ToolResult { content, is_error }
        }
        other => ToolResult::new(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response_and_error() {
        let ok = classify(&json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}}));
        assert_eq!(
            ok,
            Inbound::Response {
                id: 3,
                outcome: Ok(json!({"tools": []}))
            }
        );

        let err = classify(&json!({"jsonrpc": "2.0", "id": "4", "error": {"code": -32602, "message": "bad params"}}));
        assert_eq!(
            err,
            Inbound::Response {
                id: 4,
                outcome: Err((-32602, "bad params".into()))
            }
        );
    }

    #[test]
    fn test_classify_server_traffic() {
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"})),
            Inbound::Request {
                id: json!("srv-1"),
                method: "ping".into()
            }
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"})),
            Inbound::Notification {
                method: "notifications/tools/list_changed".into()
            }
        );
        assert_eq!(classify(&json!({"jsonrpc": "2.0", "id": [1]})), Inbound::Ignored);
    }

    #[test]
    fn test_parse_tools_with_cursor() {
        let server = ServerId::new("files");
        let (tools, cursor) = parse_tools(
            &server,
            &json!({
                "tools": [
                    {"name": "read_file", "description": "Read a file", "inputSchema": {"type": "object"}},
                    {"description": "nameless"}
                ],
                "nextCursor": "page-2"
            }),
        )
        .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(tools[0].server_id, server);
        assert_eq!(cursor.as_deref(), Some("page-2"));

        assert!(parse_tools(&server, &json!({})).is_err());
    }

    #[test]
    fn test_pager_stops_on_repeat_and_cap() {
        let server = ServerId::new("files");
        let mut pager = Pager::default();
        assert_eq!(pager.advance(&server, Some("a".into())).unwrap().as_deref(), Some("a"));
        assert_eq!(pager.advance(&server, Some("b".into())).unwrap().as_deref(), Some("b"));
        let err = pager.advance(&server, Some("a".into())).unwrap_err();
        assert!(err.to_string().contains("repeated cursor 'a'"), "{err}");

        let mut pager = Pager::default();
        assert!(pager.advance(&server, None).unwrap().is_none());

        let mut pager = Pager::default();
        for page in 1..MAX_TOOL_PAGES {
            assert!(pager.advance(&server, Some(page.to_string())).unwrap().is_some());
        }
        assert!(pager.advance(&server, Some("last".into())).is_err());
    }

    #[test]
    fn test_parse_call_result() {
        let result = parse_call_result(json!({
            "content": [{"type": "text", "text": "no such table"}],
            "isError": true
        }));
        assert!(result.is_error);
        assert_eq!(result.render(), "no such table");

        let bare = parse_call_result(json!({"rows": 2}));
        assert!(!bare.is_error);
        assert_eq!(bare.content, json!({"rows": 2}));
    }

    #[test]
    fn test_call_params_defaults_arguments() {
        assert_eq!(
            call_params("list_tables", Value::Null),
            json!({"name": "list_tables", "arguments": {}})
        );
    }
}
