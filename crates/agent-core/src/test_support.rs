//! Scripted collaborators for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{
    Completion, GenerationOptions, LlmProvider, ModelInfo, ProviderInfo,
};
use crate::session::{ProviderSession, ServerId, ServerSession};
use crate::tool::{ToolDescriptor, ToolResult, ToolSpec};

/// What a mock session does when a tool is called
#[derive(Clone)]
enum CallBehavior {
    Echo,
    Transport,
    Rpc,
}

/// In-memory tool server
pub struct MockSession {
    reachable: bool,
    discovery_fails: bool,
    tools: Vec<ToolDescriptor>,
    responses: HashMap<String, ToolResult>,
    delays: HashMap<String, Duration>,
    behavior: CallBehavior,
    calls: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
}

impl MockSession {
    fn base(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            reachable: true,
            discovery_fails: false,
            tools,
            responses: HashMap::new(),
            delays: HashMap::new(),
            behavior: CallBehavior::Echo,
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn with_tools(names: &[&str]) -> Self {
        Self::base(
            names
                .iter()
                .map(|n| ToolDescriptor::new(ServerId::new("unassigned"), *n))
                .collect(),
        )
    }

    pub fn with_descriptors(tools: Vec<ToolDescriptor>) -> Self {
        Self::base(tools)
    }

    /// Connects fine, but `tools/list` fails
    pub fn failing_discovery(names: &[&str]) -> Self {
        Self {
            discovery_fails: true,
            ..Self::with_tools(names)
        }
    }

    /// Never connects
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::with_tools(&[])
        }
    }

    pub fn respond(mut self, tool: &str, result: ToolResult) -> Self {
        self.responses.insert(tool.into(), result);
        self
    }

    pub fn delay(mut self, tool: &str, delay: Duration) -> Self {
        self.delays.insert(tool.into(), delay);
        self
    }

    /// Every call fails as if the pipe broke
    pub fn broken_transport(mut self) -> Self {
        self.behavior = CallBehavior::Transport;
        self
    }

    /// Every call is answered with a JSON-RPC error
    pub fn rpc_errors(mut self) -> Self {
        self.behavior = CallBehavior::Rpc;
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderSession for MockSession {
    async fn connect(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(AgentError::transport("mock", "connection refused"))
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        if self.discovery_fails {
            return Err(AgentError::Rpc {
                server: "mock".into(),
                code: -32603,
                message: "tools/list failed".into(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));
        if let Some(delay) = self.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }
        match self.behavior {
            CallBehavior::Transport => Err(AgentError::transport("mock", "broken pipe")),
            CallBehavior::Rpc => Err(AgentError::Rpc {
                server: "mock".into(),
                code: -32602,
                message: "invalid params".into(),
            }),
            CallBehavior::Echo => Ok(self
                .responses
                .get(name)
                .cloned()
                .unwrap_or_else(|| ToolResult::text(format!("{name} -> {arguments}")))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wrap mocks in sessions and connect them (failures stay `Failed`)
pub async fn connected_sessions<S: Into<String>>(
    specs: Vec<(S, MockSession)>,
) -> Vec<Arc<ServerSession>> {
    let mut sessions = Vec::new();
    for (id, mock) in specs {
        let session = Arc::new(ServerSession::new(ServerId::new(id), Arc::new(mock)));
        let _ = session.connect().await;
        sessions.push(session);
    }
    sessions
}

/// One recorded `complete` call
#[derive(Clone, Debug)]
pub struct Request {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub model: String,
}

/// Provider that replays a fixed script of replies
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion>>>,
    requests: Mutex<Vec<Request>>,
    native_tools: bool,
    cancel_on: Option<(usize, CancellationToken)>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<Completion>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            native_tools: false,
            cancel_on: None,
        }
    }

    /// Plain text replies, in order
    pub fn texts(replies: &[&str]) -> Self {
        Self::new(
            replies
                .iter()
                .map(|r| Ok(Completion::text(*r, "scripted")))
                .collect(),
        )
    }

    pub fn native(mut self) -> Self {
        self.native_tools = true;
        self
    }

    /// Cancel `token` while serving the `call`th request (1-based)
    pub fn cancel_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on = Some((call, token));
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "Scripted".into(),
            version: None,
            models: Vec::new(),
            supports_tools: self.native_tools,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let served = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(Request {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                model: options.model.clone(),
            });
            requests.len()
        };
        if let Some((call, token)) = &self.cancel_on {
            if *call == served {
                token.cancel();
            }
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::Provider("script exhausted".into())))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }
}
