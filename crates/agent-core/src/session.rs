//! Server Sessions
//!
//! One [`ServerSession`] per configured tool server. The wire protocol lives
//! behind [`ProviderSession`]; the core only tracks lifecycle state and the
//! discovered tool catalog. [`SessionManager`] owns every session and
//! guarantees they are closed on all exit paths.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::tool::{ToolDescriptor, ToolResult};

/// Unique server identifier (the key in the server configuration)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Lifecycle of a server session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Live connection to one tool server
///
/// Implemented by the transports in `agent-runtime`. Errors returned from
/// `call_tool` are transport or protocol failures; a tool that ran and
/// failed comes back as `Ok` with `is_error` set.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    /// Establish the connection and perform any handshake
    async fn connect(&self) -> Result<()>;

    /// Fetch the server's tool catalog
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Invoke a tool by its server-side name
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// A server session plus its lifecycle state and cached catalog
pub struct ServerSession {
    id: ServerId,
    handle: Arc<dyn ProviderSession>,
    state: RwLock<SessionState>,
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl ServerSession {
    pub fn new(id: ServerId, handle: Arc<dyn ProviderSession>) -> Self {
        Self {
            id,
            handle,
            state: RwLock::new(SessionState::Connecting),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub const fn id(&self) -> &ServerId {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == SessionState::Connected
    }

    /// Connect the underlying handle. Failures leave the session `Failed`.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == SessionState::Connected {
            return Ok(());
        }
        *state = SessionState::Connecting;
        match self.handle.connect().await {
            Ok(()) => {
                *state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                *state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Re-list the catalog. A failure marks the session `Failed`.
    pub async fn discover(&self) -> Result<Vec<ToolDescriptor>> {
        match self.handle.list_tools().await {
            Ok(mut tools) => {
                for tool in &mut tools {
                    tool.server_id = self.id.clone();
                }
                *self.tools.write().await = tools.clone();
                Ok(tools)
            }
            Err(e) => {
                self.mark_failed().await;
                Err(e)
            }
        }
    }

    /// The catalog from the last successful discovery
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Forward a call to the server
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        self.handle.call_tool(name, arguments).await
    }

    pub async fn mark_failed(&self) {
        let mut state = self.state.write().await;
        if *state != SessionState::Closed {
            *state = SessionState::Failed;
        }
    }

    /// Close the handle; idempotent
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == SessionState::Closed {
            return Ok(());
        }
        *state = SessionState::Closed;
        self.handle.close().await
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Owner of every server session for the process
///
/// Sessions are handed out as `Arc`s (the registry keeps references), but
/// only the manager closes them.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Vec<Arc<ServerSession>>,
}

impl SessionManager {
    pub const fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    /// Add a session; order of insertion is the registry's precedence order
    pub fn add(&mut self, id: ServerId, handle: Arc<dyn ProviderSession>) {
        self.sessions.push(Arc::new(ServerSession::new(id, handle)));
    }

    pub fn sessions(&self) -> &[Arc<ServerSession>] {
        &self.sessions
    }

    pub fn get(&self, id: &ServerId) -> Option<&Arc<ServerSession>> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connect every session concurrently; returns how many connected
    ///
    /// A failed connection only marks that session `Failed`.
    pub async fn connect_all(&self) -> usize {
        let results = futures::future::join_all(self.sessions.iter().map(|session| async move {
            match session.connect().await {
                Ok(()) => {
                    tracing::info!(server = %session.id(), "Connected to tool server");
                    true
                }
                Err(e) => {
                    tracing::warn!(server = %session.id(), error = %e, "Could not start tool server");
                    false
                }
            }
        }))
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Close every session. Errors are logged, never returned.
    pub async fn shutdown(&self) {
        for session in &self.sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(server = %session.id(), error = %e, "Error closing tool server session");
            } else {
                tracing::debug!(server = %session.id(), "Session closed");
            }
        }
    }

    /// Run `f`, then shut down regardless of how `f` finished
    ///
    /// Panics inside `f` are resumed after teardown.
    pub async fn run_scoped<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        self.shutdown().await;
        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSession;

    #[tokio::test]
    async fn test_connect_failure_marks_failed() {
        let session = ServerSession::new("a".into(), Arc::new(MockSession::unreachable()));
        assert!(session.connect().await.is_err());
        assert_eq!(session.state().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_discovery_tags_server_id() {
        let session = ServerSession::new("b".into(), Arc::new(MockSession::with_tools(&["list_tables"])));
        session.connect().await.unwrap();
        let tools = session.discover().await.unwrap();
        assert_eq!(tools[0].server_id, ServerId::new("b"));
        assert_eq!(session.tools().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = Arc::new(MockSession::with_tools(&[]));
        let session = ServerSession::new("c".into(), mock.clone());
        session.connect().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state().await, SessionState::Closed);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_run_scoped_closes_on_error() {
        let mock = Arc::new(MockSession::with_tools(&["t"]));
        let mut manager = SessionManager::new();
        manager.add("a".into(), mock.clone());
        assert_eq!(manager.connect_all().await, 1);

        let result: std::result::Result<(), &str> =
            manager.run_scoped(|| async { Err("conversation blew up") }).await;

        assert!(result.is_err());
        assert_eq!(mock.close_count(), 1);
        assert_eq!(manager.sessions()[0].state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_scoped_closes_on_panic() {
        let mock = Arc::new(MockSession::with_tools(&["t"]));
        let mut manager = SessionManager::new();
        manager.add("a".into(), mock.clone());
        manager.connect_all().await;

        let outcome = AssertUnwindSafe(manager.run_scoped(|| async {
            panic!("boom");
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_all_counts_successes() {
        let mut manager = SessionManager::new();
        manager.add("a".into(), Arc::new(MockSession::unreachable()));
        manager.add("b".into(), Arc::new(MockSession::with_tools(&["x"])));
        assert_eq!(manager.connect_all().await, 1);
        assert_eq!(manager.get(&"a".into()).unwrap().state().await, SessionState::Failed);
    }
}
