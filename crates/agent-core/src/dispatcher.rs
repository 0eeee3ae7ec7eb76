//! Tool Dispatcher
//!
//! Routes a tool call to the session that owns the tool and folds every
//! failure into a [`ToolError`]. Nothing raised by a server ever escapes as
//! an [`AgentError`](crate::AgentError): the model sees the failure as
//! content and decides what to do next.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::Message;
use crate::registry::ToolRegistry;
use crate::tool::{ToolCall, ToolError, ToolErrorKind, ToolResult};

/// How a batch of tool calls from one reply is executed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DispatchMode {
    /// One call at a time, in request order
    #[default]
    Sequential,
    /// Up to `limit` calls in flight; results still come back in request order
    Concurrent { limit: usize },
}

/// A dispatched call and what came of it
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    pub call: ToolCall,
    pub outcome: Result<ToolResult, ToolError>,
}

impl ToolInvocation {
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Text shown to the model
    pub fn render(&self) -> String {
        match &self.outcome {
            Ok(result) => result.render(),
            Err(e) => format!("Error [{}]: {}", e.kind, e.detail),
        }
    }

    /// Transcript message answering the call
    pub fn to_message(&self) -> Message {
        Message::tool(self.render(), self.call.id.clone()).with_name(&self.call.name)
    }
}

/// Routes calls through the registry to their owning sessions
#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    mode: DispatchMode,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            mode: DispatchMode::default(),
        }
    }

    pub const fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub const fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Invoke a single tool by its registry key
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        let entry = self.registry.resolve(name)?;
        let server = entry.server_id();

        let Some(session) = self.registry.session(server) else {
            return Err(ToolError::unavailable(name, server));
        };
        if !session.is_connected().await {
            tracing::debug!(tool = %name, server = %server, "Owning session not connected");
            return Err(ToolError::unavailable(name, server));
        }

        let arguments = match arguments {
            Value::Object(_) => arguments,
            Value::Null => Value::Object(Map::new()),
            other => {
                return Err(ToolError::failed(
                    name,
                    format!("arguments must be a JSON object, got {other}"),
                ));
            }
        };

        tracing::debug!(tool = %name, server = %server, "Dispatching tool call");

        match session.call_tool(&entry.descriptor.name, arguments).await {
            Ok(result) if result.is_error => {
                tracing::debug!(tool = %name, server = %server, "Tool reported an error");
                Err(ToolError::failed(name, result.render()))
            }
            Ok(result) => Ok(result),
            Err(e) if e.is_fatal_transport() => {
                tracing::warn!(tool = %name, server = %server, error = %e, "Transport failed; marking session failed");
                session.mark_failed().await;
                Err(ToolError::new(
                    ToolErrorKind::SessionUnavailable,
                    name,
                    e.to_string(),
                ))
            }
            Err(e) => Err(ToolError::failed(name, e.to_string())),
        }
    }

    /// Invoke a batch; the result order always equals `calls` order
    pub async fn invoke_all(&self, calls: &[ToolCall]) -> Vec<ToolInvocation> {
        match self.mode {
            DispatchMode::Sequential => {
                let mut out = Vec::with_capacity(calls.len());
                for call in calls {
                    out.push(self.invoke_one(call.clone()).await);
                }
                out
            }
            DispatchMode::Concurrent { limit } => {
                futures::stream::iter(calls.iter().cloned().map(|call| self.invoke_one(call)))
                    .buffered(limit.max(1))
                    .collect()
                    .await
            }
        }
    }

    async fn invoke_one(&self, call: ToolCall) -> ToolInvocation {
        let outcome = self.invoke(&call.name, call.arguments.clone()).await;
        ToolInvocation { call, outcome }
    }
}
