//! Stdio transport
//!
//! Spawns the server as a child process and speaks newline-delimited
//! JSON-RPC over its stdin/stdout. A background reader routes responses to
//! waiting requests by id and answers the server's own requests.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agent_core::{AgentError, ProviderSession, Result, ServerId, ToolDescriptor, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

use super::protocol::{self, Inbound};

type Reply = std::result::Result<Value, (i64, String)>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// MCP server running as a child process
pub struct StdioSession {
    inner: Arc<Inner>,
}

struct Inner {
    server: ServerId,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    request_timeout: Duration,
    call_timeout: Duration,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl StdioSession {
    pub fn new(
        server: ServerId,
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                command: command.into(),
                args,
                env,
                request_timeout: REQUEST_TIMEOUT,
                call_timeout: CALL_TIMEOUT,
                child: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Override the handshake/listing and tool-call deadlines
    ///
    /// Only meaningful before `connect`.
    #[must_use]
    pub fn with_timeouts(self, request: Duration, call: Duration) -> Self {
        let inner = Arc::try_unwrap(self.inner).map_or_else(
            |shared| shared,
            |mut inner| {
                inner.request_timeout = request;
                inner.call_timeout = call;
                Arc::new(inner)
            },
        );
        Self { inner }
    }

    pub fn server(&self) -> &ServerId {
        &self.inner.server
    }
}

impl std::fmt::Debug for StdioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioSession")
            .field("server", &self.inner.server)
            .field("command", &self.inner.command)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderSession for StdioSession {
    async fn connect(&self) -> Result<()> {
        if self.inner.child.lock().await.is_some() {
            return Ok(());
        }
        self.inner.spawn().await?;
        if let Err(e) = self.inner.handshake().await {
            self.inner.shutdown(Duration::ZERO).await;
            return Err(e);
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut pager = protocol::Pager::default();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.map_or_else(|| json!({}), |c| json!({ "cursor": c }));
            let result = self
                .inner
                .request("tools/list", params, self.inner.request_timeout)
                .await?;
            let (page, next) = protocol::parse_tools(&self.inner.server, &result)?;
            tools.extend(page);
            match pager.advance(&self.inner.server, next)? {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let result = self
            .inner
            .request(
                "tools/call",
                protocol::call_params(name, arguments),
                self.inner.call_timeout,
            )
            .await?;
        Ok(protocol::parse_call_result(result))
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

impl Inner {
    async fn spawn(self: &Arc<Self>) -> Result<()> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| shellexpand::tilde(arg).into_owned())
            .collect();

        let mut child = Command::new(&self.command)
            .args(&args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.transport_error(format!("failed to start '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture server stdout"))?;

        self.closed.store(false, Ordering::SeqCst);
        *self.writer.lock().await = Some(BufWriter::new(stdin));
        *self.child.lock().await = Some(child);

        debug!(server = %self.server, command = %self.command, "Spawned MCP server");
        tokio::spawn(reader_loop(Arc::downgrade(self), self.server.clone(), stdout));
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let result = self
            .request("initialize", protocol::initialize_params(), self.request_timeout)
            .await?;
        debug!(
            server = %self.server,
            protocol = result.get("protocolVersion").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "MCP server initialized"
        );
        self.write_message(&protocol::notification("notifications/initialized", json!({})))
            .await
    }

    async fn request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(self.transport_error("server process has exited"));
        }
        if let Err(e) = self.write_message(&protocol::request(id, method, params)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(protocol::rpc_error(&self.server, error)),
            Ok(Err(_)) => Err(self.transport_error("server process has exited")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::Rpc {
                    server: self.server.to_string(),
                    code: protocol::REQUEST_TIMEOUT,
                    message: format!("'{method}' timed out after {}s", deadline.as_secs_f32()),
                })
            }
        }
    }

    async fn write_message(&self, message: &Value) -> Result<()> {
        let mut encoded = serde_json::to_vec(message)?;
        encoded.push(b'\n');

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("not connected"))?;
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| self.transport_error(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| self.transport_error(e.to_string()))
    }

    async fn handle(&self, message: &Value) {
        match protocol::classify(message) {
            Inbound::Response { id, outcome } => {
                let waiter = self.pending.lock().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(server = %self.server, id, "Response for unknown request"),
                }
            }
            Inbound::Request { id, method } => {
                let reply = if method == "ping" {
                    protocol::response(id, json!({}))
                } else {
                    warn!(server = %self.server, method = %method, "Server sent unsupported request");
                    protocol::error_response(
                        id,
                        protocol::METHOD_NOT_FOUND,
                        format!("client does not implement method '{method}'"),
                    )
                };
                if let Err(e) = self.write_message(&reply).await {
                    warn!(server = %self.server, error = %e, "Failed to answer server request");
                }
            }
            Inbound::Notification { method } => {
                debug!(server = %self.server, method = %method, "Server notification");
            }
            Inbound::Ignored => debug!(server = %self.server, "Ignoring unroutable message"),
        }
    }

    /// Fail every waiter; their receivers see the channel close
    async fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }

    /// Close stdin, give the process `grace` to exit, then kill it
    async fn shutdown(&self, grace: Duration) {
        self.writer.lock().await.take();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.server, %status, "MCP server exited"),
                _ => {
                    if let Err(e) = child.kill().await {
                        debug!(server = %self.server, error = %e, "Kill failed; process may already be gone");
                    }
                }
            }
        }
        self.fail_pending().await;
    }

    fn transport_error(&self, message: impl Into<String>) -> AgentError {
        AgentError::transport(self.server.as_str(), message)
    }
}

/// Holds only a weak reference so a dropped session still reaps its child
async fn reader_loop(inner: Weak<Inner>, server: ServerId, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, error = %e, "Failed reading from MCP server");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
            debug!(server = %server, line = trimmed, "Skipping non-JSON line");
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle(&message).await;
    }

    debug!(server = %server, "MCP server closed its output");
    if let Some(inner) = inner.upgrade() {
        inner.fail_pending().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use agent_core::{ServerSession, SessionState};

    const FAKE_SERVER: &str = r#"
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}'
read -r line
read -r line
printf '%s\n' 'starting up...'
printf '%s\n' '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}'
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"type":"object"}}]}}'
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}],"isError":false}}'
read -r line
"#;

    fn shell(script: &str) -> StdioSession {
        StdioSession::new(
            ServerId::new("fake"),
            "sh",
            vec!["-c".into(), script.into()],
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_full_session_against_scripted_server() {
        let session = shell(FAKE_SERVER);
        session.connect().await.unwrap();

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description, "Echo text");

        let result = session.call_tool("echo", json!({"text": "hi"})).await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.render(), "hi");

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.call_tool("echo", Value::Null).await,
            Err(AgentError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_repeated_cursor_fails_discovery() {
        let script = r#"
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}'
read -r line
i=2
while read -r line; do
  printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[{"name":"echo"}],"nextCursor":"again"}}\n' "$i"
  i=$((i + 1))
done
"#;
        let session = ServerSession::new(ServerId::new("fake"), Arc::new(shell(script)));
        session.connect().await.unwrap();

        let err = session.discover().await.unwrap_err();
        assert!(err.to_string().contains("repeated cursor 'again'"), "{err}");
        assert_eq!(session.state().await, SessionState::Failed);
        assert!(session.tools().await.is_empty());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_error() {
        let session = StdioSession::new(
            ServerId::new("ghost"),
            "definitely-not-an-installed-mcp-server",
            vec![],
            BTreeMap::new(),
        );
        let err = session.connect().await.unwrap_err();
        assert!(err.is_fatal_transport());
    }

    #[tokio::test]
    async fn test_early_exit_fails_handshake() {
        let err = shell("exit 0").connect().await.unwrap_err();
        assert!(err.is_fatal_transport(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let session = shell("read -r line; sleep 5")
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        match session.connect().await {
            Err(AgentError::Rpc { code, .. }) => assert_eq!(code, protocol::REQUEST_TIMEOUT),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
